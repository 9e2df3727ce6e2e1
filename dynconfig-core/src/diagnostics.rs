//! Diagnostics Channel
//!
//! Failures that the engine recovers from locally (a plugin object that
//! cannot be instrumented, a listener that failed during a deferred flush)
//! are never thrown at the caller. They are reported through an injected
//! [`DiagnosticLogger`] with a fixed severity and a stable message id, and
//! mirrored to `tracing` so they show up even when no logger is supplied.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Severity of a diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Severity {
    /// Something is broken and telemetry is affected.
    Critical = 1,
    /// Recovered failure worth surfacing.
    Warning = 2,
    /// Low severity, informational.
    Debug = 3,
}

/// Stable identifier of a diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub u16);

impl MessageId {
    /// A value could not be converted into a tracked container.
    pub const DYNAMIC_CONFIG_EXCEPTION: Self = Self(108);
    /// A listener failed during a deferred flush.
    pub const LISTENER_FAILURE: Self = Self(109);
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single diagnostic message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// How severe the condition is.
    pub severity: Severity,
    /// Stable message id.
    pub id: MessageId,
    /// Message text, including the underlying error text.
    pub message: String,
}

impl Diagnostic {
    /// Create a new diagnostic.
    pub fn new(severity: Severity, id: MessageId, message: impl Into<String>) -> Self {
        Self {
            severity,
            id,
            message: message.into(),
        }
    }
}

/// Sink for diagnostics emitted by the engine.
pub trait DiagnosticLogger: Send + Sync {
    /// Receive one diagnostic.
    fn log(&self, diagnostic: &Diagnostic);
}

/// Logger that forwards every diagnostic to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl DiagnosticLogger for TracingLogger {
    fn log(&self, diagnostic: &Diagnostic) {
        let id = diagnostic.id.0;
        match diagnostic.severity {
            Severity::Critical => tracing::error!(id, "{}", diagnostic.message),
            Severity::Warning => tracing::warn!(id, "{}", diagnostic.message),
            Severity::Debug => tracing::debug!(id, "{}", diagnostic.message),
        }
    }
}

/// Logger that keeps every diagnostic in memory.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    entries: Mutex<Vec<Diagnostic>>,
}

impl MemoryLogger {
    /// Create an empty logger, ready to be injected.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of the collected diagnostics.
    pub fn entries(&self) -> Vec<Diagnostic> {
        self.entries.lock().clone()
    }

    /// Remove everything collected so far.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl DiagnosticLogger for MemoryLogger {
    fn log(&self, diagnostic: &Diagnostic) {
        self.entries.lock().push(diagnostic.clone());
    }
}

/// Emit a diagnostic through the optional injected logger and `tracing`.
pub(crate) fn report(logger: Option<&Arc<dyn DiagnosticLogger>>, diagnostic: Diagnostic) {
    tracing::debug!(
        id = diagnostic.id.0,
        severity = ?diagnostic.severity,
        "{}",
        diagnostic.message
    );
    if let Some(logger) = logger {
        logger.log(&diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_logger_collects() {
        let logger = MemoryLogger::new();
        let injected: Arc<dyn DiagnosticLogger> = logger.clone();

        report(
            Some(&injected),
            Diagnostic::new(
                Severity::Debug,
                MessageId::DYNAMIC_CONFIG_EXCEPTION,
                "Cannot redefine property: x",
            ),
        );

        let entries = logger.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, MessageId::DYNAMIC_CONFIG_EXCEPTION);
        assert!(entries[0].message.contains("Cannot redefine property"));

        logger.clear();
        assert!(logger.entries().is_empty());
    }

    #[test]
    fn report_without_logger_is_silent() {
        report(
            None,
            Diagnostic::new(Severity::Warning, MessageId::LISTENER_FAILURE, "ignored"),
        );
    }
}
