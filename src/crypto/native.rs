//! Native backend built on `ring`

use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, EcdsaSigningAlgorithm, KeyPair as _, UnparsedPublicKey, ECDSA_P256_SHA256_FIXED,
    ECDSA_P256_SHA256_FIXED_SIGNING,
};
use p256::pkcs8::DecodePrivateKey;
use zeroize::Zeroizing;

use super::{CryptoError, CryptoProvider, KeyPair};
use crate::delegation::Curve;

/// Native backend: randomized signatures from ring's assembly implementation
pub struct NativeProvider {
    rng: SystemRandom,
}

impl NativeProvider {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }

    fn signing_algorithm(&self, curve: Curve) -> Result<&'static EcdsaSigningAlgorithm, CryptoError> {
        match curve {
            Curve::P256 => Ok(&ECDSA_P256_SHA256_FIXED_SIGNING),
        }
    }
}

impl Default for NativeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoProvider for NativeProvider {
    fn name(&self) -> &'static str {
        "native (ring)"
    }

    fn supports(&self, curve: Curve) -> bool {
        matches!(curve, Curve::P256)
    }

    fn generate_key_pair(&self, curve: Curve) -> Result<KeyPair, CryptoError> {
        let alg = self.signing_algorithm(curve)?;
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(alg, &self.rng)
            .map_err(|_| CryptoError::Unavailable("system random source failed".into()))?;

        let pair = EcdsaKeyPair::from_pkcs8(alg, pkcs8.as_ref(), &self.rng)
            .map_err(|_| CryptoError::Computation("generated key was rejected".into()))?;
        let public_key = pair.public_key().as_ref().to_vec();

        // ring only hands out PKCS#8; signing later needs the bare scalar
        let secret = p256::SecretKey::from_pkcs8_der(pkcs8.as_ref())
            .map_err(|e| CryptoError::Computation(format!("could not unwrap generated key: {}", e)))?;
        let scalar = Zeroizing::new(secret.to_bytes().to_vec());

        KeyPair::new(curve, public_key, scalar)
    }

    fn sign(&self, key: &KeyPair, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let alg = self.signing_algorithm(key.curve())?;
        let pair = EcdsaKeyPair::from_private_key_and_public_key(
            alg,
            key.private_key(),
            key.public_key(),
            &self.rng,
        )
        .map_err(|_| CryptoError::InvalidKey("private and public key do not match".into()))?;

        let signature = pair
            .sign(&self.rng, message)
            .map_err(|_| CryptoError::Computation("ECDSA signing failed".into()))?;
        Ok(signature.as_ref().to_vec())
    }

    fn verify(
        &self,
        curve: Curve,
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError> {
        let alg = match curve {
            Curve::P256 => &ECDSA_P256_SHA256_FIXED,
        };
        Ok(UnparsedPublicKey::new(alg, public_key)
            .verify(message, signature)
            .is_ok())
    }
}
