//! Canister principals in delegation targets
//!
//! The type itself is `candid::Principal`; these helpers map its errors into
//! the pipeline taxonomy.

pub use candid::Principal;

use crate::error::PipelineError;

/// Parse the dash-grouped textual form, validating the checksum
pub fn from_text(text: &str) -> Result<Principal, PipelineError> {
    Principal::from_text(text.trim())
        .map_err(|e| PipelineError::malformed(format!("invalid principal '{}': {}", text, e)))
}

/// Build a principal from raw bytes (at most 29)
pub fn from_bytes(bytes: &[u8]) -> Result<Principal, PipelineError> {
    Principal::try_from_slice(bytes)
        .map_err(|e| PipelineError::malformed(format!("invalid principal bytes: {}", e)))
}
