//! Diagnostic records for exchanges that degraded to pass-through

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One diagnostic entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub timestamp: DateTime<Utc>,

    /// Exchange this relates to, if any
    pub exchange_id: Option<u64>,

    pub url: Option<String>,

    /// Pipeline stage that produced it ("parser", "crypto", "lifecycle", ...)
    pub stage: String,

    pub severity: Severity,

    pub message: String,
}

impl Diagnostic {
    pub fn new(stage: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            exchange_id: None,
            url: None,
            stage: stage.to_string(),
            severity,
            message: message.into(),
        }
    }

    /// Diagnostic for a pipeline failure on one exchange
    pub fn from_pipeline_error(exchange_id: u64, url: &str, err: &PipelineError) -> Self {
        Self {
            exchange_id: Some(exchange_id),
            url: Some(url.to_string()),
            ..Self::new(err.stage(), Severity::Warning, err.to_string())
        }
    }
}

/// Bounded in-memory diagnostic history, oldest dropped first
pub struct DiagnosticLog {
    records: RwLock<VecDeque<Diagnostic>>,
    max_records: usize,
}

impl DiagnosticLog {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            max_records,
        }
    }

    /// Store a record and mirror it to the tracing subscriber
    pub fn record(&self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Info => tracing::info!(
                stage = %diagnostic.stage,
                exchange = ?diagnostic.exchange_id,
                "{}",
                diagnostic.message
            ),
            Severity::Warning => tracing::warn!(
                stage = %diagnostic.stage,
                exchange = ?diagnostic.exchange_id,
                "{}",
                diagnostic.message
            ),
            Severity::Error => tracing::error!(
                stage = %diagnostic.stage,
                exchange = ?diagnostic.exchange_id,
                "{}",
                diagnostic.message
            ),
        }

        let mut records = self.records.write();
        records.push_back(diagnostic);
        while records.len() > self.max_records {
            records.pop_front();
        }
    }

    pub fn get_all(&self) -> Vec<Diagnostic> {
        self.records.read().iter().cloned().collect()
    }

    pub fn filter_by_stage(&self, stage: &str) -> Vec<Diagnostic> {
        self.records
            .read()
            .iter()
            .filter(|d| d.stage == stage)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self::new(500)
    }
}
