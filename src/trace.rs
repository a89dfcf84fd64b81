//! Trace record model and writer abstraction.
//!
//! Producers describe what happened with a [`TraceEvent`]; the buffered
//! writer turns accepted events into immutable [`TraceRecord`]s that flow to
//! the configured sinks.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Property key marking host-internal diagnostics that must not surface in
/// per-function logs.
pub const SYSTEM_TRACE_KEY: &str = "isSystemTrace";

/// Severity of a trace event, ordered from most to least severe.
///
/// A writer configured at level `L` keeps events with `level <= L`, so
/// `Off` keeps nothing and `Verbose` keeps everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Off,
    Error,
    Warning,
    Info,
    Verbose,
}

impl fmt::Display for TraceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TraceLevel::Off => "Off",
            TraceLevel::Error => "Error",
            TraceLevel::Warning => "Warning",
            TraceLevel::Info => "Info",
            TraceLevel::Verbose => "Verbose",
        };
        f.write_str(name)
    }
}

/// A single trace emitted by a producer.
///
/// Events are consumed by [`TraceWriter::trace`]; the optional `error`
/// payload is flattened into additional record lines by the buffered
/// writer.
#[derive(Debug)]
pub struct TraceEvent {
    pub timestamp: DateTime<Utc>,
    pub level: TraceLevel,
    pub message: String,
    pub error: Option<anyhow::Error>,
    pub properties: HashMap<String, Value>,
}

impl TraceEvent {
    pub fn new(level: TraceLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            error: None,
            properties: HashMap::new(),
        }
    }

    pub fn verbose(message: impl Into<String>) -> Self {
        Self::new(TraceLevel::Verbose, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(TraceLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(TraceLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(TraceLevel::Error, message)
    }

    /// Attaches the error payload whose message lines follow the event
    /// message into the buffer.
    pub fn with_error(mut self, error: anyhow::Error) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Marks the event as host-internal. System traces are dropped by
    /// writers created with `system_traces_enabled = false`.
    pub fn system(self) -> Self {
        self.with_property(SYSTEM_TRACE_KEY, true)
    }

    pub fn is_system_trace(&self) -> bool {
        matches!(self.properties.get(SYSTEM_TRACE_KEY), Some(Value::Bool(true)))
    }
}

/// An immutable buffered line, stamped when it entered the buffer.
///
/// Records are consumed by sinks and never mutated.
#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub timestamp: DateTime<Utc>,
    pub level: TraceLevel,
    pub message: String,
    pub properties: HashMap<String, Value>,
}

/// Destination-agnostic trace output.
///
/// The lease manager depends on this seam only, never on a concrete writer,
/// so sinks can themselves report lease problems without forming a cycle.
pub trait TraceWriter: Send + Sync {
    fn trace(&self, event: TraceEvent);
}

/// A writer that discards every event.
#[derive(Debug, Default, Clone)]
pub struct NullTraceWriter;

impl TraceWriter for NullTraceWriter {
    fn trace(&self, _event: TraceEvent) {}
}

impl<T: TraceWriter + ?Sized> TraceWriter for std::sync::Arc<T> {
    fn trace(&self, event: TraceEvent) {
        (**self).trace(event);
    }
}

/// Wrapper raised when a hosted function fails.
///
/// Writers collapse this wrapper to the innermost cause message so that
/// script errors reach user logs without host plumbing noise.
#[derive(Debug, thiserror::Error)]
#[error("error while executing function '{function_name}'")]
pub struct FunctionInvocationError {
    pub function_name: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
}

impl FunctionInvocationError {
    pub fn new(
        function_name: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            source: source.into(),
        }
    }
}
