//! Function Host Coordination Core
//!
//! This crate implements the two infrastructure facilities a multi-instance
//! function host relies on: singleton leader election over a shared lease
//! store, and buffered trace shipping to pluggable sinks.
//!
//! # Features
//!
//! - `observability` - Enable Prometheus histograms for lease round-trips
//!   and sink flushes

mod builder;
pub mod buffered;
pub mod config;
pub mod factory;
pub mod file_sink;
pub mod lease;
pub mod manager;
pub mod metrics;
pub mod sinks;
pub mod sql_sink;
pub mod trace;

pub use builder::LeaseManagerBuilder;
pub use buffered::{BufferedTraceWriter, FLUSH_INTERVAL};
pub use config::{FileLoggingMode, HostConfig};
pub use factory::{
    ConnectionStringResolver, EnvConnectionStringResolver, FactoryError,
    StaticConnectionStringResolver, TraceWriterFactory, SQL_TRACER_CONNECTION,
};
pub use file_sink::FileSink;
pub use lease::{InMemoryLeaseProvider, LeaseDefinition, LeaseError, LeaseProvider};
pub use manager::{
    LeaseManager, DEFAULT_LEASE_TIMEOUT, DEFAULT_RETRY_INTERVAL, MAX_LEASE_TIMEOUT,
    MIN_LEASE_TIMEOUT,
};
pub use metrics::HostMetrics;
pub use sinks::{CompositeSink, NullSink, SinkError, TraceSink};
pub use sql_sink::SqlSink;
pub use trace::{
    FunctionInvocationError, NullTraceWriter, TraceEvent, TraceLevel, TraceRecord, TraceWriter,
};

/// Error returned when a constructor argument violates its documented
/// contract.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid argument `{name}`: {reason}")]
pub struct InvalidArgument {
    pub name: &'static str,
    pub reason: String,
}

impl InvalidArgument {
    pub fn new(name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            name,
            reason: reason.into(),
        }
    }
}
