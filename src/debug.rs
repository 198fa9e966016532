//! Pluggable debug handler: a second, user-facing channel distinct from
//! `tracing`, carrying severity-tagged messages, runtime errors with
//! contextual breadcrumbs, and statistics events.

use crate::stats::JobStats;
use std::sync::Arc;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Breadcrumbs attached to a runtime error: the object it concerns, the
/// method that raised it, and the offending parameter, when known.
#[derive(Clone, Debug, Default)]
pub struct ErrorContext {
    pub object_name: Option<String>,
    pub method: Option<&'static str>,
    pub parameter: Option<&'static str>,
}

#[derive(Clone, Debug)]
pub enum DebugMessage {
    Validation { severity: Severity, text: String, context: ErrorContext },
    RuntimeError { error: String, context: ErrorContext },
    Stats { job_name: Option<String>, stats: JobStats },
}

/// Implemented by a caller-supplied sink for debug messages. The default
/// implementation (`TracingDebugHandler`) forwards everything to `tracing`.
pub trait DebugHandler: Send + Sync {
    fn on_message(&self, message: &DebugMessage);
}

/// Default handler: routes validation/runtime messages through `tracing` at
/// a matching level, and drops stats events (callers that want them should
/// install their own handler or read `StatsHistory` directly).
pub struct TracingDebugHandler;

impl DebugHandler for TracingDebugHandler {
    fn on_message(&self, message: &DebugMessage) {
        match message {
            DebugMessage::Validation { severity, text, .. } => match severity {
                Severity::Info => tracing::info!("{}", text),
                Severity::Warning => tracing::warn!("{}", text),
                Severity::Error => tracing::error!("{}", text),
            },
            DebugMessage::RuntimeError { error, .. } => tracing::error!("{}", error),
            DebugMessage::Stats { .. } => {}
        }
    }
}

pub type SharedDebugHandler = Arc<dyn DebugHandler>;

pub fn default_handler() -> SharedDebugHandler {
    Arc::new(TracingDebugHandler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<String>>);
    impl DebugHandler for Recording {
        fn on_message(&self, message: &DebugMessage) {
            if let DebugMessage::Validation { text, .. } = message {
                self.0.lock().unwrap().push(text.clone());
            }
        }
    }

    #[test]
    fn handler_receives_validation_messages() {
        let rec = Recording(Mutex::new(Vec::new()));
        rec.on_message(&DebugMessage::Validation {
            severity: Severity::Error,
            text: "bad usage flags".into(),
            context: ErrorContext::default(),
        });
        assert_eq!(rec.0.lock().unwrap().as_slice(), &["bad usage flags".to_string()]);
    }
}
