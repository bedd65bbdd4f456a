//! Representation-independent hashing of delegations
//!
//! The signature of a delegation covers `DOMAIN_SEPARATOR ‖ request_id(delegation)`
//! where the request id hashes the field map `{pubkey, expiration, targets?}`.

use ic_transport_types::{to_request_id, RequestId};
use serde::Serialize;

use super::{Delegation, Principal};
use crate::error::PipelineError;

/// Domain separator prepended to the delegation hash before signing
pub const DELEGATION_DOMAIN_SEPARATOR: &[u8] = b"\x1Aic-request-auth-delegation";

/// Field map covered by the hash
#[derive(Serialize)]
struct HashedDelegation<'a> {
    #[serde(with = "serde_bytes")]
    pubkey: &'a [u8],
    expiration: u64,
    /// An empty target list is a wildcard and is omitted from the map
    #[serde(skip_serializing_if = "Option::is_none")]
    targets: Option<&'a [Principal]>,
}

impl<'a> From<&'a Delegation> for HashedDelegation<'a> {
    fn from(delegation: &'a Delegation) -> Self {
        Self {
            pubkey: &delegation.pubkey,
            expiration: delegation.expiration,
            targets: (!delegation.targets.is_empty()).then_some(delegation.targets.as_slice()),
        }
    }
}

/// Representation-independent hash of a delegation
pub fn delegation_hash(delegation: &Delegation) -> Result<RequestId, PipelineError> {
    to_request_id(&HashedDelegation::from(delegation))
        .map_err(|e| PipelineError::malformed(format!("delegation cannot be hashed: {}", e)))
}

/// The exact byte string a delegation signature is computed over
pub fn signable_bytes(delegation: &Delegation) -> Result<Vec<u8>, PipelineError> {
    let hash = delegation_hash(delegation)?;
    let mut out = Vec::with_capacity(DELEGATION_DOMAIN_SEPARATOR.len() + 32);
    out.extend_from_slice(DELEGATION_DOMAIN_SEPARATOR);
    out.extend_from_slice(hash.as_slice());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(targets: Vec<Principal>) -> Delegation {
        Delegation {
            pubkey: vec![1, 2, 3],
            expiration: 1_700_000_000_000_000_000,
            targets,
        }
    }

    #[test]
    fn test_signable_has_domain_separator() {
        let bytes = signable_bytes(&sample(vec![])).unwrap();
        assert!(bytes.starts_with(DELEGATION_DOMAIN_SEPARATOR));
        assert_eq!(bytes.len(), DELEGATION_DOMAIN_SEPARATOR.len() + 32);
    }

    #[test]
    fn test_targets_change_hash() {
        let wildcard = delegation_hash(&sample(vec![])).unwrap();
        let scoped = delegation_hash(&sample(vec![Principal::management_canister()])).unwrap();
        assert_ne!(wildcard, scoped);
    }

    #[test]
    fn test_expiration_changes_hash() {
        let mut later = sample(vec![]);
        later.expiration += 1;
        assert_ne!(
            delegation_hash(&sample(vec![])).unwrap(),
            delegation_hash(&later).unwrap()
        );
    }

    #[test]
    fn test_hash_is_stable() {
        let delegation = sample(vec![Principal::anonymous()]);
        assert_eq!(
            signable_bytes(&delegation).unwrap(),
            signable_bytes(&delegation.clone()).unwrap()
        );
    }
}
