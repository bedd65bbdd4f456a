//! Crypto provider bridge
//!
//! Key generation, signing and verification sit behind [`CryptoProvider`].
//! A managed (pure Rust) backend and a native (`ring`) backend are
//! available; one is chosen once at activation by [`select_provider`] and
//! checked with [`probe`].
//!
//! Signatures are 64-byte fixed `r ‖ s` ECDSA over SHA-256 and public keys
//! are uncompressed SEC1 points, wrapped in DER SPKI when placed in a
//! delegation.

mod managed;
mod native;

pub use managed::ManagedProvider;
pub use native::NativeProvider;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::delegation::der::p256_spki;
use crate::delegation::Curve;
use crate::error::PipelineError;
use crate::keystore::Fingerprint;

/// Message signed and verified by the activation self-test
const PROBE_MESSAGE: &[u8] = b"delegation-forge backend self-test";

/// Crypto backend errors. Messages never carry key material.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("backend '{0}' is unavailable")]
    Unavailable(String),

    #[error("curve {0:?} is not supported by backend '{1}'")]
    UnsupportedCurve(Curve, &'static str),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("computation failed: {0}")]
    Computation(String),
}

impl From<CryptoError> for PipelineError {
    fn from(err: CryptoError) -> Self {
        PipelineError::CryptoBackend(err.to_string())
    }
}

/// Backend selection from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoBackend {
    /// Managed backend when it supports the curve, native otherwise
    #[default]
    Auto,
    Managed,
    Native,
}

/// An attacker-controlled key pair
///
/// Owned by the key material store; everything else borrows it for the
/// duration of one exchange.
pub struct KeyPair {
    curve: Curve,
    public_key: Vec<u8>,
    spki: Vec<u8>,
    private_key: Zeroizing<Vec<u8>>,
    origin: Option<Fingerprint>,
}

impl KeyPair {
    /// Fails when `public_key` is not a point on `curve`
    pub fn new(
        curve: Curve,
        public_key: Vec<u8>,
        private_key: Zeroizing<Vec<u8>>,
    ) -> Result<Self, CryptoError> {
        let spki = match curve {
            Curve::P256 => p256_spki(&public_key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?,
        };
        Ok(Self {
            curve,
            public_key,
            spki,
            private_key,
            origin: None,
        })
    }

    pub(crate) fn with_origin(mut self, origin: Fingerprint) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn curve(&self) -> Curve {
        self.curve
    }

    /// Uncompressed SEC1 public point
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Private scalar (sensitive)
    pub fn private_key(&self) -> &[u8] {
        &self.private_key
    }

    /// Fingerprint the store generated this key for
    pub fn origin(&self) -> Option<&Fingerprint> {
        self.origin.as_ref()
    }

    /// Public key as the DER SubjectPublicKeyInfo placed in delegations
    pub fn spki_der(&self) -> Vec<u8> {
        self.spki.clone()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("curve", &self.curve)
            .field("public_key", &hex::encode(&self.public_key))
            .field("private_key", &"<redacted>")
            .field("origin", &self.origin)
            .finish()
    }
}

/// Capability interface over a signing backend
pub trait CryptoProvider: Send + Sync {
    /// Backend name for diagnostics
    fn name(&self) -> &'static str;

    fn supports(&self, curve: Curve) -> bool;

    fn generate_key_pair(&self, curve: Curve) -> Result<KeyPair, CryptoError>;

    fn sign(&self, key: &KeyPair, message: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Returns `Ok(false)` for a well-formed key and a bad signature
    fn verify(
        &self,
        curve: Curve,
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError>;
}

/// Pick the backend for `curve` according to the configured preference
pub fn select_provider(backend: CryptoBackend, curve: Curve) -> Arc<dyn CryptoProvider> {
    let provider: Arc<dyn CryptoProvider> = match backend {
        CryptoBackend::Managed => Arc::new(ManagedProvider),
        CryptoBackend::Native => Arc::new(NativeProvider::new()),
        CryptoBackend::Auto => {
            if ManagedProvider.supports(curve) {
                Arc::new(ManagedProvider)
            } else {
                Arc::new(NativeProvider::new())
            }
        }
    };

    tracing::debug!(backend = provider.name(), ?curve, "Selected crypto provider");
    provider
}

/// Generate, sign and verify once to prove the backend works
pub fn probe(provider: &dyn CryptoProvider, curve: Curve) -> Result<(), CryptoError> {
    if !provider.supports(curve) {
        return Err(CryptoError::UnsupportedCurve(curve, provider.name()));
    }

    let key = provider.generate_key_pair(curve)?;
    let signature = provider.sign(&key, PROBE_MESSAGE)?;
    if provider.verify(curve, key.public_key(), PROBE_MESSAGE, &signature)? {
        Ok(())
    } else {
        Err(CryptoError::Computation("self-test signature did not verify".into()))
    }
}
