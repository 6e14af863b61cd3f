//! Structured diagnostics routed to an external logging collaborator.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Verbose,
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Verbose => "verbose",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

/// One message from a validation callback or the asset loader.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Component that produced the message, e.g. `"validation"` or `"asset"`.
    pub source: String,
    pub text: String,
}

impl Diagnostic {
    pub fn new(severity: Severity, source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            severity,
            source: source.into(),
            text: text.into(),
        }
    }

    pub fn warning(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Severity::Warning, source, text)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.source, self.severity, self.text)
    }
}

/// Receiver of structured diagnostics. Formatting and destination are up to the implementor.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, diagnostic: Diagnostic);
}

/// Forwards diagnostics to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, d: Diagnostic) {
        match d.severity {
            Severity::Verbose => tracing::trace!(source = %d.source, "{}", d.text),
            Severity::Info => tracing::info!(source = %d.source, "{}", d.text),
            Severity::Warning => tracing::warn!(source = %d.source, "{}", d.text),
            Severity::Error => tracing::error!(source = %d.source, "{}", d.text),
        }
    }
}

/// Stores every diagnostic; used by tests and tools that report after the fact.
#[derive(Debug, Default)]
pub struct CollectingSink {
    messages: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Diagnostic> {
        self.messages.lock().clone()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, diagnostic: Diagnostic) {
        self.messages.lock().push(diagnostic);
    }
}
