//! Pure-Rust backend built on the RustCrypto `p256` crate

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use super::{CryptoError, CryptoProvider, KeyPair};
use crate::delegation::Curve;

/// Managed backend: no native code, deterministic (RFC 6979) signatures
#[derive(Debug, Clone, Copy, Default)]
pub struct ManagedProvider;

impl CryptoProvider for ManagedProvider {
    fn name(&self) -> &'static str {
        "managed (p256)"
    }

    fn supports(&self, curve: Curve) -> bool {
        matches!(curve, Curve::P256)
    }

    fn generate_key_pair(&self, curve: Curve) -> Result<KeyPair, CryptoError> {
        if !self.supports(curve) {
            return Err(CryptoError::UnsupportedCurve(curve, self.name()));
        }

        let signing_key = SigningKey::random(&mut OsRng);
        let public_key = signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        let private_key = Zeroizing::new(signing_key.to_bytes().to_vec());

        KeyPair::new(curve, public_key, private_key)
    }

    fn sign(&self, key: &KeyPair, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signing_key = SigningKey::from_slice(key.private_key())
            .map_err(|_| CryptoError::InvalidKey("private scalar is not a valid P-256 key".into()))?;
        let signature: Signature = signing_key
            .try_sign(message)
            .map_err(|e| CryptoError::Computation(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }

    fn verify(
        &self,
        curve: Curve,
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError> {
        if !self.supports(curve) {
            return Err(CryptoError::UnsupportedCurve(curve, self.name()));
        }

        let verifying_key = VerifyingKey::from_sec1_bytes(public_key)
            .map_err(|_| CryptoError::InvalidKey("public key is not a P-256 point".into()))?;
        let Ok(signature) = Signature::from_slice(signature) else {
            return Ok(false);
        };
        Ok(verifying_key.verify(message, &signature).is_ok())
    }
}
