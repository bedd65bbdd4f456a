//! Delegation chain model, parser and encoder
//!
//! A chain asserts authority from a root public key down to a session key
//! through an ordered list of signed delegations. Intercepted tokens are
//! decoded into [`DelegationChain`] by [`parse`] and written back by
//! [`encode`], preserving the wire shape they arrived in.

pub mod der;
mod encoder;
#[cfg(test)]
pub(crate) mod fixtures;
mod parser;
mod principal;
pub mod signable;

pub use encoder::{encode, to_json_value};
pub use parser::{has_chain_fields, looks_like_chain, parse, parse_jwk, EcJwk};
pub use principal::Principal;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PipelineError;

/// Canonical key algorithm of a public key found in a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    EcdsaP256,
    EcdsaSecp256k1,
    Ed25519,
    CanisterSignature,
}

impl KeyAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            KeyAlgorithm::EcdsaP256 => "ECDSA P-256",
            KeyAlgorithm::EcdsaSecp256k1 => "ECDSA secp256k1",
            KeyAlgorithm::Ed25519 => "Ed25519",
            KeyAlgorithm::CanisterSignature => "canister signature",
        }
    }

    /// Whether a session key of this type can be swapped for a forged P-256 key
    pub fn is_forgeable_session_key(&self) -> bool {
        matches!(self, KeyAlgorithm::EcdsaP256 | KeyAlgorithm::Ed25519)
    }
}

/// Elliptic curves the pipeline can generate key material for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Curve {
    P256,
}

impl Curve {
    /// Canonicalise a curve identifier
    pub fn from_name(name: &str) -> Result<Self, PipelineError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "p-256" | "p256" | "secp256r1" | "prime256v1" => Ok(Curve::P256),
            other => Err(PipelineError::unsupported(format!("curve '{}'", other))),
        }
    }

    /// The JWK `crv` value
    pub fn jwk_name(&self) -> &'static str {
        match self {
            Curve::P256 => "P-256",
        }
    }
}

/// Wire shape a chain was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// `{"publicKey": .., "delegations": [..]}` with hex fields
    ChainJson,
    /// `{"fromPubKey": .., "delegationChain": "n;pk:exp:targets:sig;.."}`
    CompactVector,
}

/// A single delegation of authority to `pubkey`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delegation {
    /// DER-encoded public key receiving the authority
    pub pubkey: Vec<u8>,
    /// Expiration in nanoseconds since the Unix epoch
    pub expiration: u64,
    /// Canister targets; empty means no restriction
    pub targets: Vec<Principal>,
}

/// A delegation plus the signature of its signer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDelegation {
    pub delegation: Delegation,
    pub signature: Vec<u8>,
    /// Signer key declared on the wire, if the format carries one
    pub signer: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationChain {
    /// DER-encoded root key that signs the first delegation
    pub public_key: Vec<u8>,
    pub delegations: Vec<SignedDelegation>,
    pub format: WireFormat,
}

impl DelegationChain {
    /// The last delegation, which names the session key
    pub fn terminal(&self) -> Option<&SignedDelegation> {
        self.delegations.last()
    }

    /// Key expected to have signed delegation `index`
    pub fn expected_signer(&self, index: usize) -> Option<&[u8]> {
        match index {
            0 => Some(&self.public_key),
            i => self.delegations.get(i - 1).map(|d| d.delegation.pubkey.as_slice()),
        }
    }

    /// Stable session identifier: hex SHA-256 of the root public key
    pub fn session_id(&self) -> String {
        hex::encode(Sha256::digest(&self.public_key))
    }

    /// Check signer linkage and expiration ordering
    ///
    /// Linkage is only checked for hops that declare a `signer`. Browser
    /// tokens (`DelegationChain.toJSON()` and the compact vector) never carry
    /// one, so for captured traffic this reduces to the expiration check.
    /// Signatures are not verified here.
    pub fn validate_integrity(&self) -> Result<(), PipelineError> {
        let root = self.delegations.first().ok_or(PipelineError::ChainIntegrity {
            hop: 0,
            reason: "chain has no delegations".into(),
        })?;

        for (hop, signed) in self.delegations.iter().enumerate() {
            let expected = self.expected_signer(hop).unwrap_or_default();
            if let Some(declared) = &signed.signer {
                if declared.as_slice() != expected {
                    return Err(PipelineError::ChainIntegrity {
                        hop,
                        reason: "declared signer is not the key delegated by the previous hop".into(),
                    });
                }
            }

            if signed.delegation.expiration > root.delegation.expiration {
                return Err(PipelineError::ChainIntegrity {
                    hop,
                    reason: "delegation outlives the root delegation".into(),
                });
            }
        }

        Ok(())
    }
}
