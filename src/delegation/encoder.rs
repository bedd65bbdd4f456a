//! Encoding of delegation chains back into their wire shape

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use serde_json::Value;

use super::parser::{ChainJson, CompactJson, DelegationJson, SignedDelegationJson};
use super::{DelegationChain, WireFormat};

/// Encode a chain in the wire format it was parsed from
pub fn encode(chain: &DelegationChain) -> Vec<u8> {
    to_json_value(chain).to_string().into_bytes()
}

/// Encode a chain as a JSON value (for splicing into a larger body)
pub fn to_json_value(chain: &DelegationChain) -> Value {
    let encoded = match chain.format {
        WireFormat::ChainJson => serde_json::to_value(chain_json(chain)),
        WireFormat::CompactVector => serde_json::to_value(compact_json(chain)),
    };
    // Plain string/struct serialisation cannot fail
    encoded.unwrap_or(Value::Null)
}

fn chain_json(chain: &DelegationChain) -> ChainJson {
    ChainJson {
        public_key: hex::encode(&chain.public_key),
        delegations: chain
            .delegations
            .iter()
            .map(|signed| SignedDelegationJson {
                delegation: DelegationJson {
                    pubkey: hex::encode(&signed.delegation.pubkey),
                    expiration: format!("{:x}", signed.delegation.expiration),
                    targets: if signed.delegation.targets.is_empty() {
                        None
                    } else {
                        Some(
                            signed
                                .delegation
                                .targets
                                .iter()
                                .map(|t| hex::encode(t.as_slice()))
                                .collect(),
                        )
                    },
                },
                signature: hex::encode(&signed.signature),
                signer: signed.signer.as_ref().map(hex::encode),
            })
            .collect(),
    }
}

/// The compact vector has no slot for declared signers; they are dropped
fn compact_json(chain: &DelegationChain) -> CompactJson {
    let mut vector = chain.delegations.len().to_string();
    for signed in &chain.delegations {
        let delegation = &signed.delegation;
        vector.push(';');
        vector.push_str(&STANDARD_NO_PAD.encode(&delegation.pubkey));
        vector.push(':');
        vector.push_str(&delegation.expiration.to_string());
        vector.push(':');
        vector.push_str(&delegation.targets.len().to_string());
        for target in &delegation.targets {
            vector.push(',');
            vector.push_str(&target.to_text());
        }
        vector.push(':');
        vector.push_str(&STANDARD_NO_PAD.encode(&signed.signature));
    }

    CompactJson {
        from_pub_key: STANDARD_NO_PAD.encode(&chain.public_key),
        delegation_chain: vector,
    }
}
