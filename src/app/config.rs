//! Application configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::crypto::CryptoBackend;
use crate::error::ConfigError;
use crate::forgery::ForgeryConfig;
use crate::keystore::KeyStoreConfig;
use crate::scope::TargetScope;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Forged identity cache
    pub cache: CacheConfig,

    /// Forged expiration horizons
    pub forgery: HorizonConfig,

    /// Hosts eligible for interception
    pub scope: ScopeConfig,

    /// Signing backend
    pub crypto: CryptoConfig,

    /// Diagnostic history
    pub diagnostics: DiagnosticsConfig,

    /// Export artifact history
    pub export: ExportConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of live forged identities
    pub capacity: usize,

    /// Identity lifetime in seconds
    pub ttl_secs: u64,

    /// Bounded wait on an in-flight generation, in milliseconds
    pub wait_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HorizonConfig {
    /// Cap on forged expiration past now, in seconds
    ///
    /// A still-valid original keeps `min(original, now + max)`, so with the
    /// defaults a one-hour token is forged to expire in one hour. Set this
    /// equal to `default_horizon_secs` to pin every forgery to `now + default`.
    pub max_horizon_secs: u64,

    /// Lifetime for forgeries of already-expired chains, in seconds
    pub default_horizon_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Host patterns (`host`, `*.domain`, `10.0.0.0/8`, `re:<regex>`); empty = all
    pub target_hosts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub backend: CryptoBackend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub max_records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub max_artifacts: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl_secs: 30 * 60,
            wait_timeout_ms: 2000,
        }
    }
}

impl Default for HorizonConfig {
    fn default() -> Self {
        Self {
            max_horizon_secs: 8 * 60 * 60,
            default_horizon_secs: 30 * 60,
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self { max_records: 500 }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self { max_artifacts: 50 }
    }
}

impl CacheConfig {
    pub fn store_config(&self) -> KeyStoreConfig {
        KeyStoreConfig {
            capacity: self.capacity,
            ttl: Duration::from_secs(self.ttl_secs),
            wait_timeout: Duration::from_millis(self.wait_timeout_ms),
        }
    }
}

impl HorizonConfig {
    pub fn engine_config(&self) -> ForgeryConfig {
        ForgeryConfig {
            max_horizon: Duration::from_secs(self.max_horizon_secs),
            default_horizon: Duration::from_secs(self.default_horizon_secs),
        }
    }
}

impl ScopeConfig {
    pub fn target_scope(&self) -> Result<TargetScope, ConfigError> {
        TargetScope::from_patterns(&self.target_hosts)
            .map_err(|e| ConfigError::invalid("scope.target_hosts", e.to_string()))
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(p),
            None => Self::default_config_path()?,
        };

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(|source| {
                ConfigError::ReadError {
                    path: config_path.display().to_string(),
                    source,
                }
            })?;

            let config: Config =
                toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

            tracing::info!("Loaded configuration from {:?}", config_path);
            Ok(config)
        } else {
            tracing::info!("No configuration file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: Option<&str>) -> Result<()> {
        let config_path = match path {
            Some(p) => PathBuf::from(p),
            None => Self::default_config_path()?,
        };

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config to {:?}", config_path))?;

        tracing::info!("Saved configuration to {:?}", config_path);
        Ok(())
    }

    /// Check value ranges and cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.capacity == 0 {
            return Err(ConfigError::invalid("cache.capacity", "must be at least 1"));
        }
        if self.cache.ttl_secs == 0 {
            return Err(ConfigError::invalid("cache.ttl_secs", "must be at least 1"));
        }
        if self.cache.wait_timeout_ms == 0 {
            return Err(ConfigError::invalid("cache.wait_timeout_ms", "must be at least 1"));
        }
        if self.forgery.max_horizon_secs == 0 {
            return Err(ConfigError::invalid("forgery.max_horizon_secs", "must be at least 1"));
        }
        if self.forgery.default_horizon_secs == 0 {
            return Err(ConfigError::invalid(
                "forgery.default_horizon_secs",
                "must be at least 1",
            ));
        }
        if self.forgery.default_horizon_secs > self.forgery.max_horizon_secs {
            return Err(ConfigError::invalid(
                "forgery.default_horizon_secs",
                format!(
                    "{} exceeds max_horizon_secs ({})",
                    self.forgery.default_horizon_secs, self.forgery.max_horizon_secs
                ),
            ));
        }
        if self.diagnostics.max_records == 0 {
            return Err(ConfigError::invalid("diagnostics.max_records", "must be at least 1"));
        }
        if self.export.max_artifacts == 0 {
            return Err(ConfigError::invalid("export.max_artifacts", "must be at least 1"));
        }
        self.scope.target_scope()?;
        Ok(())
    }

    /// Get default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("io", "delegation-forge", "delegation-forge")
            .context("Failed to determine config directory")?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Directory for rotated log files
    pub fn log_dir() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("io", "delegation-forge", "delegation-forge")
            .context("Failed to determine data directory")?;

        Ok(dirs.data_dir().join("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    use crate::crypto::ManagedProvider;
    use crate::forgery::ForgeryEngine;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.store_config().capacity, 256);
        assert_eq!(
            config.forgery.engine_config().default_horizon,
            Duration::from_secs(1800)
        );
        assert_eq!(config.crypto.backend, CryptoBackend::Auto);
    }

    #[test]
    fn test_default_horizons_keep_valid_original_expiry() {
        const HOUR: u64 = 3_600_000_000_000;
        const NOW: u64 = 1_700_000_000_000_000_000;

        let engine = |forgery: &HorizonConfig| {
            ForgeryEngine::new(Arc::new(ManagedProvider), forgery.engine_config())
        };

        let defaults = Config::default().forgery;
        assert_eq!(engine(&defaults).forged_expiration(NOW + HOUR, NOW), NOW + HOUR);

        let pinned = HorizonConfig {
            max_horizon_secs: 1800,
            default_horizon_secs: 1800,
        };
        assert_eq!(engine(&pinned).forged_expiration(NOW + HOUR, NOW), NOW + HOUR / 2);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");
        let config = Config::load(path.to_str()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.cache.capacity = 8;
        config.scope.target_hosts = vec!["*.icp0.io".into(), "re:^localhost$".into()];
        config.crypto.backend = CryptoBackend::Native;
        config.save(Some(path)).unwrap();

        assert_eq!(Config::load(Some(path)).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[forgery]\nmax_horizon_secs = 3600\n\n[crypto]\nbackend = \"managed\"\n").unwrap();

        let config = Config::load(path.to_str()).unwrap();
        assert_eq!(config.forgery.max_horizon_secs, 3600);
        assert_eq!(config.forgery.default_horizon_secs, 1800);
        assert_eq!(config.crypto.backend, CryptoBackend::Managed);
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    fn test_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cache\ncapacity = ").unwrap();

        let err = Config::load(path.to_str()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.forgery.default_horizon_secs = config.forgery.max_horizon_secs + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "forgery.default_horizon_secs"
        ));

        let mut config = Config::default();
        config.cache.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scope.target_hosts = vec!["re:(".into()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "scope.target_hosts"
        ));
    }
}
