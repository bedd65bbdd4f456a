//! Decoding of intercepted delegation tokens

use base64::{
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
    Engine,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroizing;

use super::der::parse_spki;
use super::principal;
use super::{Curve, Delegation, DelegationChain, Principal, SignedDelegation, WireFormat};
use crate::error::PipelineError;

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct ChainJson {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub delegations: Vec<SignedDelegationJson>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct SignedDelegationJson {
    pub delegation: DelegationJson,
    pub signature: String,
    /// Not part of agent-js `toJSON()` output; only present in tokens that
    /// were annotated after capture
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct DelegationJson {
    pub pubkey: String,
    /// Hex nanoseconds
    pub expiration: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct CompactJson {
    #[serde(rename = "fromPubKey")]
    pub from_pub_key: String,
    #[serde(rename = "delegationChain")]
    pub delegation_chain: String,
}

/// Whether a JSON object has the shape of a delegation chain
pub fn looks_like_chain(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|obj| has_chain_fields(|key| obj.contains_key(key)))
}

/// Whether an object whose keys answer `has` has the shape of a delegation chain
pub fn has_chain_fields(has: impl Fn(&str) -> bool) -> bool {
    (has("publicKey") && has("delegations")) || (has("fromPubKey") && has("delegationChain"))
}

/// Decode a delegation chain token
///
/// Fails with `MalformedToken` on structural problems and
/// `UnsupportedAlgorithm` when a key cannot be handled by the pipeline.
pub fn parse(raw: &[u8]) -> Result<DelegationChain, PipelineError> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| PipelineError::malformed(format!("invalid JSON: {}", e)))?;

    let obj = value
        .as_object()
        .ok_or_else(|| PipelineError::malformed("token is not a JSON object"))?;

    let chain = if obj.contains_key("delegations") {
        let json: ChainJson = serde_json::from_value(value)
            .map_err(|e| PipelineError::malformed(format!("chain JSON: {}", e)))?;
        from_chain_json(json)?
    } else if obj.contains_key("delegationChain") {
        let json: CompactJson = serde_json::from_value(value)
            .map_err(|e| PipelineError::malformed(format!("compact chain: {}", e)))?;
        from_compact(json)?
    } else {
        return Err(PipelineError::malformed("no delegation chain fields present"));
    };

    canonicalize(&chain)?;
    Ok(chain)
}

fn from_chain_json(json: ChainJson) -> Result<DelegationChain, PipelineError> {
    let public_key = decode_hex("publicKey", &json.public_key)?;

    let delegations = json
        .delegations
        .into_iter()
        .map(|entry| {
            let expiration = u64::from_str_radix(&entry.delegation.expiration, 16).map_err(|_| {
                PipelineError::malformed(format!(
                    "expiration '{}' is not a hex timestamp",
                    entry.delegation.expiration
                ))
            })?;

            let targets = entry
                .delegation
                .targets
                .unwrap_or_default()
                .iter()
                .map(|t| principal::from_bytes(&decode_hex("targets", t)?))
                .collect::<Result<Vec<_>, _>>()?;

            Ok(SignedDelegation {
                delegation: Delegation {
                    pubkey: decode_hex("pubkey", &entry.delegation.pubkey)?,
                    expiration,
                    targets,
                },
                signature: decode_hex("signature", &entry.signature)?,
                signer: entry.signer.as_deref().map(|s| decode_hex("signer", s)).transpose()?,
            })
        })
        .collect::<Result<Vec<_>, PipelineError>>()?;

    Ok(DelegationChain {
        public_key,
        delegations,
        format: WireFormat::ChainJson,
    })
}

fn from_compact(json: CompactJson) -> Result<DelegationChain, PipelineError> {
    let public_key = decode_b64("fromPubKey", &json.from_pub_key)?;

    let mut segments = json.delegation_chain.split(';');
    let declared: usize = segments
        .next()
        .unwrap_or_default()
        .parse()
        .map_err(|_| PipelineError::malformed("delegation vector has no leading count"))?;

    let delegations = segments
        .map(parse_compact_delegation)
        .collect::<Result<Vec<_>, _>>()?;

    if delegations.len() != declared {
        return Err(PipelineError::malformed(format!(
            "delegation vector declares {} delegations but carries {}",
            declared,
            delegations.len()
        )));
    }

    Ok(DelegationChain {
        public_key,
        delegations,
        format: WireFormat::CompactVector,
    })
}

fn parse_compact_delegation(segment: &str) -> Result<SignedDelegation, PipelineError> {
    let fields: Vec<&str> = segment.split(':').collect();
    if fields.len() != 4 {
        return Err(PipelineError::malformed(format!(
            "unexpected number of fields in delegation: {}",
            fields.len()
        )));
    }

    let expiration: u64 = fields[1]
        .parse()
        .map_err(|_| PipelineError::malformed(format!("expiration '{}' is not a number", fields[1])))?;

    let mut target_fields = fields[2].split(',');
    let target_count: usize = target_fields
        .next()
        .unwrap_or_default()
        .parse()
        .map_err(|_| PipelineError::malformed("target list has no leading count"))?;
    let targets = target_fields
        .map(principal::from_text)
        .collect::<Result<Vec<_>, _>>()?;
    if targets.len() != target_count {
        return Err(PipelineError::malformed(format!(
            "target list declares {} targets but carries {}",
            target_count,
            targets.len()
        )));
    }

    Ok(SignedDelegation {
        delegation: Delegation {
            pubkey: decode_b64("pubkey", fields[0])?,
            expiration,
            targets,
        },
        signature: decode_b64("signature", fields[3])?,
        signer: None,
    })
}

/// Canonicalise every key in the chain and check the session key is forgeable
fn canonicalize(chain: &DelegationChain) -> Result<(), PipelineError> {
    parse_spki(&chain.public_key)?;

    let terminal = chain
        .terminal()
        .ok_or_else(|| PipelineError::malformed("chain has no delegations"))?;

    for signed in &chain.delegations {
        parse_spki(&signed.delegation.pubkey)?;
    }

    let session = parse_spki(&terminal.delegation.pubkey)?;
    if !session.algorithm.is_forgeable_session_key() {
        return Err(PipelineError::unsupported(format!(
            "{} session key",
            session.algorithm.name()
        )));
    }

    Ok(())
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, PipelineError> {
    hex::decode(value).map_err(|e| PipelineError::malformed(format!("{}: bad hex ({})", field, e)))
}

fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>, PipelineError> {
    STANDARD_NO_PAD
        .decode(value)
        .map_err(|e| PipelineError::malformed(format!("{}: bad base64 ({})", field, e)))
}

/// An elliptic-curve key in JWK form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcJwk {
    pub curve: Curve,
    pub x: Vec<u8>,
    pub y: Vec<u8>,
    pub d: Option<Zeroizing<Vec<u8>>>,
}

#[derive(Deserialize)]
struct JwkFields {
    kty: String,
    crv: String,
    x: String,
    y: String,
    #[serde(default)]
    d: Option<String>,
}

/// Decode an EC key structure, canonicalising its curve name
pub fn parse_jwk(raw: &[u8]) -> Result<EcJwk, PipelineError> {
    let fields: JwkFields = serde_json::from_slice(raw)
        .map_err(|e| PipelineError::malformed(format!("JWK: {}", e)))?;

    if fields.kty != "EC" {
        return Err(PipelineError::unsupported(format!("key type '{}'", fields.kty)));
    }
    let curve = Curve::from_name(&fields.crv)?;

    let coordinate = |name: &str, value: &str| -> Result<Vec<u8>, PipelineError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|e| PipelineError::malformed(format!("JWK {}: bad base64url ({})", name, e)))?;
        if bytes.len() != 32 {
            return Err(PipelineError::malformed(format!(
                "JWK {} must be 32 bytes, got {}",
                name,
                bytes.len()
            )));
        }
        Ok(bytes)
    };

    Ok(EcJwk {
        curve,
        x: coordinate("x", &fields.x)?,
        y: coordinate("y", &fields.y)?,
        d: fields
            .d
            .as_deref()
            .map(|d| coordinate("d", d).map(Zeroizing::new))
            .transpose()?,
    })
}
