//! Extension lifecycle
//!
//! All process-scoped state (provider, key store, interceptor, artifact
//! log) is built by [`Extension::activate`] and torn down by
//! [`Extension::deactivate`]. Nothing survives a deactivation, and a new
//! activation starts from empty state.

use std::sync::Arc;

use crate::app::Config;
use crate::crypto::{probe, select_provider, CryptoProvider};
use crate::delegation::Curve;
use crate::error::ForgeError;
use crate::export::ArtifactLog;
use crate::forgery::ForgeryEngine;
use crate::host::{Diagnostic, HandlerId, HostHooks, Severity};
use crate::intercept::{DelegationInterceptor, InterceptorStatsSnapshot};
use crate::keystore::{CacheStatsSnapshot, KeyMaterialStore};

/// Curve of every forged session key
pub const SESSION_CURVE: Curve = Curve::P256;

/// What deactivation released
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeactivationReport {
    pub identities_drained: usize,
    pub artifacts_dropped: usize,
}

pub struct Extension {
    host: Arc<dyn HostHooks>,
    handler: Option<HandlerId>,
    interceptor: Arc<DelegationInterceptor>,
    store: Option<Arc<KeyMaterialStore>>,
    artifacts: Arc<ArtifactLog>,
    backend: Option<&'static str>,
}

impl Extension {
    /// Build state from config with the configured crypto backend
    pub fn activate(config: &Config, host: Arc<dyn HostHooks>) -> Result<Self, ForgeError> {
        let provider = select_provider(config.crypto.backend, SESSION_CURVE);
        Self::activate_with_provider(config, host, provider)
    }

    /// Build state around an explicit provider
    ///
    /// A provider that fails its self-test is not an activation error: the
    /// extension comes up passthrough-only and tells the operator once.
    pub fn activate_with_provider(
        config: &Config,
        host: Arc<dyn HostHooks>,
        provider: Arc<dyn CryptoProvider>,
    ) -> Result<Self, ForgeError> {
        config.validate()?;
        let scope = config.scope.target_scope()?;
        let artifacts = Arc::new(ArtifactLog::new(config.export.max_artifacts));

        let (interceptor, store, backend) = match probe(provider.as_ref(), SESSION_CURVE) {
            Ok(()) => {
                let store = Arc::new(KeyMaterialStore::new(
                    provider.clone(),
                    SESSION_CURVE,
                    config.cache.store_config(),
                ));
                let engine = ForgeryEngine::new(provider.clone(), config.forgery.engine_config());
                let interceptor = DelegationInterceptor::new(
                    scope,
                    store.clone(),
                    engine,
                    host.clone(),
                    artifacts.clone(),
                );
                (interceptor, Some(store), Some(provider.name()))
            }
            Err(err) => {
                tracing::error!(backend = provider.name(), error = %err, "Crypto backend unavailable");
                host.record_diagnostic(Diagnostic::new(
                    "lifecycle",
                    Severity::Error,
                    format!("crypto backend '{}' failed its self-test: {}", provider.name(), err),
                ));
                host.notify_operator(
                    "Delegation forgery is disabled for this session: no working crypto backend. \
                     Traffic will pass through unmodified.",
                );
                let interceptor = DelegationInterceptor::passthrough_only(host.clone(), artifacts.clone());
                (interceptor, None, None)
            }
        };

        let interceptor = Arc::new(interceptor);
        let handler = host.register_handler(interceptor.clone());

        tracing::info!(
            backend = backend.unwrap_or("none"),
            forgery = interceptor.forgery_enabled(),
            scope_patterns = config.scope.target_hosts.len(),
            "Extension activated"
        );

        Ok(Self {
            host,
            handler: Some(handler),
            interceptor,
            store,
            artifacts,
            backend,
        })
    }

    /// Unregister, then drop every forged identity and artifact
    pub fn deactivate(mut self) -> DeactivationReport {
        self.shutdown()
    }

    fn shutdown(&mut self) -> DeactivationReport {
        let Some(handler) = self.handler.take() else {
            return DeactivationReport::default();
        };
        self.host.unregister_handler(handler);

        let report = DeactivationReport {
            identities_drained: self.store.as_ref().map(|s| s.drain()).unwrap_or(0),
            artifacts_dropped: self.artifacts.len(),
        };
        self.artifacts.clear();

        tracing::info!(
            identities = report.identities_drained,
            artifacts = report.artifacts_dropped,
            "Extension deactivated"
        );
        report
    }

    pub fn forgery_enabled(&self) -> bool {
        self.interceptor.forgery_enabled()
    }

    /// Name of the active crypto backend, if forgery is enabled
    pub fn backend(&self) -> Option<&'static str> {
        self.backend
    }

    pub fn interceptor(&self) -> &DelegationInterceptor {
        &self.interceptor
    }

    pub fn artifacts(&self) -> &ArtifactLog {
        &self.artifacts
    }

    pub fn store(&self) -> Option<&KeyMaterialStore> {
        self.store.as_deref()
    }

    pub fn interceptor_stats(&self) -> InterceptorStatsSnapshot {
        self.interceptor.stats()
    }

    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.store.as_ref().map(|s| s.stats()).unwrap_or_default()
    }
}

impl Drop for Extension {
    fn drop(&mut self) {
        self.shutdown();
    }
}
