//! SubjectPublicKeyInfo decoding and P-256 key wrapping
//!
//! DER handling goes through the RustCrypto `spki` and `pkcs8` types; this
//! module only maps algorithm identifiers onto [`KeyAlgorithm`].

use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use spki::der::Decode;
use spki::{ObjectIdentifier, SubjectPublicKeyInfoRef};

use crate::error::PipelineError;

use super::KeyAlgorithm;

const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_PRIME256V1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const OID_SECP256K1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.10");
const OID_ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");
const OID_CANISTER_SIGNATURE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.56387.1.2");

/// Length of an uncompressed SEC1 P-256 point
pub const P256_POINT_LEN: usize = 65;

/// A decoded SubjectPublicKeyInfo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyInfo {
    pub algorithm: KeyAlgorithm,
    pub key: Vec<u8>,
}

/// Decode a DER SubjectPublicKeyInfo and canonicalise its algorithm
pub fn parse_spki(der: &[u8]) -> Result<PublicKeyInfo, PipelineError> {
    let info = SubjectPublicKeyInfoRef::from_der(der)
        .map_err(|e| PipelineError::malformed(format!("public key is not DER SPKI: {}", e)))?;

    let key = info
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| PipelineError::malformed("public key bit string has unused bits"))?;

    let oid = info.algorithm.oid;
    let algorithm = if oid == OID_EC_PUBLIC_KEY {
        let curve = info
            .algorithm
            .parameters_oid()
            .map_err(|_| PipelineError::malformed("EC public key without a named curve"))?;
        if curve == OID_PRIME256V1 {
            KeyAlgorithm::EcdsaP256
        } else if curve == OID_SECP256K1 {
            KeyAlgorithm::EcdsaSecp256k1
        } else {
            return Err(PipelineError::unsupported(format!("EC curve {}", curve)));
        }
    } else if oid == OID_ED25519 {
        KeyAlgorithm::Ed25519
    } else if oid == OID_CANISTER_SIGNATURE {
        KeyAlgorithm::CanisterSignature
    } else {
        return Err(PipelineError::unsupported(format!("key algorithm {}", oid)));
    };

    match algorithm {
        KeyAlgorithm::EcdsaP256 => {
            if key.len() != P256_POINT_LEN {
                return Err(PipelineError::malformed("P-256 key is not an uncompressed point"));
            }
            p256::PublicKey::from_public_key_der(der)
                .map_err(|_| PipelineError::malformed("P-256 key is not a point on the curve"))?;
        }
        KeyAlgorithm::Ed25519 if key.len() != 32 => {
            return Err(PipelineError::malformed("Ed25519 key must be 32 bytes"));
        }
        _ => {}
    }

    Ok(PublicKeyInfo {
        algorithm,
        key: key.to_vec(),
    })
}

/// Wrap a SEC1 P-256 point into a DER SubjectPublicKeyInfo
///
/// The point is always re-emitted uncompressed.
pub fn p256_spki(point: &[u8]) -> Result<Vec<u8>, PipelineError> {
    let key = p256::PublicKey::from_sec1_bytes(point)
        .map_err(|_| PipelineError::malformed("not a P-256 point"))?;
    let der = key
        .to_public_key_der()
        .map_err(|e| PipelineError::malformed(format!("could not encode P-256 key: {}", e)))?;
    Ok(der.into_vec())
}
