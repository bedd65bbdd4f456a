//! In-process host used by the CLI replay and by tests

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{Diagnostic, DiagnosticLog, ExchangeHandler, HandlerId, HostHooks, InterceptedExchange};

/// Host that dispatches exchanges through registered handlers in order
pub struct SimulatedHost {
    handlers: RwLock<Vec<(HandlerId, Arc<dyn ExchangeHandler>)>>,
    next_id: AtomicU64,
    diagnostics: DiagnosticLog,
    notices: Mutex<Vec<String>>,
}

impl SimulatedHost {
    pub fn new(max_diagnostics: usize) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            diagnostics: DiagnosticLog::new(max_diagnostics),
            notices: Mutex::new(Vec::new()),
        }
    }

    /// Run an exchange through every handler, returning what would be forwarded
    pub fn dispatch(&self, exchange: InterceptedExchange) -> InterceptedExchange {
        // Snapshot so handlers may (un)register without deadlocking
        let handlers: Vec<_> = self.handlers.read().iter().map(|(_, h)| h.clone()).collect();
        handlers
            .iter()
            .fold(exchange, |current, handler| handler.on_exchange(&current).apply(current))
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    /// Operator notices received so far
    pub fn notices(&self) -> Vec<String> {
        self.notices.lock().clone()
    }
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new(500)
    }
}

impl HostHooks for SimulatedHost {
    fn register_handler(&self, handler: Arc<dyn ExchangeHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(handler = handler.name(), id = id.0, "Registered exchange handler");
        self.handlers.write().push((id, handler));
        id
    }

    fn unregister_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }

    fn record_diagnostic(&self, diagnostic: Diagnostic) {
        self.diagnostics.record(diagnostic);
    }

    fn notify_operator(&self, message: &str) {
        tracing::warn!("{}", message);
        self.notices.lock().push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ExchangeAction;

    struct Suffix(&'static str);

    impl ExchangeHandler for Suffix {
        fn name(&self) -> &str {
            "suffix"
        }

        fn on_exchange(&self, exchange: &InterceptedExchange) -> ExchangeAction {
            let mut body = exchange.body.clone().unwrap_or_default();
            body.extend_from_slice(self.0.as_bytes());
            ExchangeAction::ReplaceBody(body)
        }
    }

    #[test]
    fn test_handlers_apply_in_order() {
        let host = SimulatedHost::default();
        host.register_handler(Arc::new(Suffix("a")));
        let second = host.register_handler(Arc::new(Suffix("b")));

        let out = host.dispatch(InterceptedExchange::new_request(1, "GET", "https://a.test/"));
        assert_eq!(out.body_text().as_deref(), Some("ab"));

        assert!(host.unregister_handler(second));
        assert!(!host.unregister_handler(second));
        let out = host.dispatch(InterceptedExchange::new_request(2, "GET", "https://a.test/"));
        assert_eq!(out.body_text().as_deref(), Some("a"));
    }

    #[test]
    fn test_notices_are_kept() {
        let host = SimulatedHost::default();
        host.notify_operator("forgery disabled");
        assert_eq!(host.notices(), vec!["forgery disabled".to_string()]);
    }
}
