//! Host adapter
//!
//! The narrow contract between the pipeline and whatever proxy hosts it:
//! the host hands each exchange to registered [`ExchangeHandler`]s and
//! applies the returned [`ExchangeAction`]. Everything the pipeline needs
//! back from the host goes through [`HostHooks`].

mod diagnostics;
mod simulated;

pub use diagnostics::{Diagnostic, DiagnosticLog, Severity};
pub use simulated::SimulatedHost;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Which half of the exchange the host is dispatching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Request => f.write_str("request"),
            Direction::Response => f.write_str("response"),
        }
    }
}

/// Transient request or response handed over by the host. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptedExchange {
    /// Host-assigned exchange ID
    pub id: u64,

    pub direction: Direction,

    /// HTTP method of the originating request
    pub method: String,

    /// Full URL of the originating request
    pub url: String,

    /// Headers of this half of the exchange
    pub headers: HashMap<String, String>,

    pub body: Option<Vec<u8>>,

    /// Response status code (responses only)
    pub status: Option<u16>,
}

impl InterceptedExchange {
    pub fn new_request(id: u64, method: &str, url: &str) -> Self {
        Self {
            id,
            direction: Direction::Request,
            method: method.to_string(),
            url: url.to_string(),
            headers: HashMap::new(),
            body: None,
            status: None,
        }
    }

    pub fn new_response(id: u64, method: &str, url: &str, status: u16) -> Self {
        Self {
            direction: Direction::Response,
            status: Some(status),
            ..Self::new_request(id, method, url)
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    /// Lowercased host of the URL, if it parses
    pub fn host(&self) -> Option<String> {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> Option<String> {
        self.body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).to_string())
    }
}

/// A handler's verdict on one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeAction {
    /// Forward the exchange unmodified
    PassThrough,

    /// Forward with the body replaced
    ReplaceBody(Vec<u8>),
}

impl ExchangeAction {
    pub fn is_pass_through(&self) -> bool {
        matches!(self, ExchangeAction::PassThrough)
    }

    /// Apply the verdict, keeping `content-length` in step with the body
    pub fn apply(self, mut exchange: InterceptedExchange) -> InterceptedExchange {
        if let ExchangeAction::ReplaceBody(body) = self {
            let had_length = exchange
                .headers
                .keys()
                .any(|k| k.eq_ignore_ascii_case("content-length"));
            exchange
                .headers
                .retain(|k, _| !k.eq_ignore_ascii_case("content-length"));
            if had_length {
                exchange
                    .headers
                    .insert("content-length".into(), body.len().to_string());
            }
            exchange.body = Some(body);
        }
        exchange
    }
}

/// Per-exchange callback registered with the host
///
/// Hosts dispatch from their own worker pools, so implementations must be
/// reentrant and must never panic or block indefinitely.
pub trait ExchangeHandler: Send + Sync {
    fn name(&self) -> &str;

    fn on_exchange(&self, exchange: &InterceptedExchange) -> ExchangeAction;
}

/// Registration handle returned by [`HostHooks::register_handler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

/// Services the host offers to the pipeline
pub trait HostHooks: Send + Sync {
    fn register_handler(&self, handler: Arc<dyn ExchangeHandler>) -> HandlerId;

    /// Returns false when the handler was not registered
    fn unregister_handler(&self, id: HandlerId) -> bool;

    fn record_diagnostic(&self, diagnostic: Diagnostic);

    /// One-off operator-facing message (e.g. degraded mode)
    fn notify_operator(&self, message: &str);
}
