//! Signed chains for tests

use crate::crypto::{CryptoProvider, KeyPair, ManagedProvider};
use crate::delegation::signable::signable_bytes;
use crate::delegation::{Curve, Delegation, DelegationChain, Principal, SignedDelegation, WireFormat};

pub(crate) fn key() -> KeyPair {
    ManagedProvider.generate_key_pair(Curve::P256).unwrap()
}

/// root → intermediate → session, every hop genuinely signed
pub(crate) fn signed_chain(expiration: u64, targets: Vec<Principal>, format: WireFormat) -> DelegationChain {
    let root = key();
    let intermediate = key();
    let session = key();

    let first = Delegation {
        pubkey: intermediate.spki_der(),
        expiration,
        targets: vec![],
    };
    let second = Delegation {
        pubkey: session.spki_der(),
        expiration,
        targets,
    };
    let declared = |k: &KeyPair| match format {
        WireFormat::ChainJson => Some(k.spki_der()),
        WireFormat::CompactVector => None,
    };

    DelegationChain {
        public_key: root.spki_der(),
        delegations: vec![
            SignedDelegation {
                signature: ManagedProvider.sign(&root, &signable_bytes(&first).unwrap()).unwrap(),
                delegation: first,
                signer: declared(&root),
            },
            SignedDelegation {
                signature: ManagedProvider
                    .sign(&intermediate, &signable_bytes(&second).unwrap())
                    .unwrap(),
                delegation: second,
                signer: declared(&intermediate),
            },
        ],
        format,
    }
}
