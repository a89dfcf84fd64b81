//! Sink selection for per-function trace writers.
//!
//! The factory owns construction only; the returned writer takes over
//! ownership of the sinks it aggregates.

use std::collections::HashMap;
use std::sync::Arc;

use crate::buffered::{BufferedTraceWriter, FLUSH_INTERVAL};
use crate::config::{FileLoggingMode, HostConfig};
use crate::file_sink::FileSink;
use crate::metrics::HostMetrics;
use crate::sinks::{CompositeSink, NullSink, TraceSink};
use crate::sql_sink::SqlSink;
use crate::InvalidArgument;

/// Name of the connection string backing the relational log sink.
pub const SQL_TRACER_CONNECTION: &str = "SqlTracer";

/// Subdirectory of the root log path holding per-function logs.
pub const FUNCTION_LOG_DIRECTORY: &str = "Function";

/// Resolves named connection strings.
///
/// Passed to the factory explicitly so tests can substitute a static map
/// for the process environment.
pub trait ConnectionStringResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<String>;
}

/// Resolves `{name}` from the `FUNCHOST_CONNECTION_{NAME}` environment
/// variable.
#[derive(Debug, Default, Clone)]
pub struct EnvConnectionStringResolver;

impl ConnectionStringResolver for EnvConnectionStringResolver {
    fn resolve(&self, name: &str) -> Option<String> {
        let key = format!("FUNCHOST_CONNECTION_{}", name.to_uppercase());
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

/// Resolves from a fixed map.
#[derive(Debug, Default, Clone)]
pub struct StaticConnectionStringResolver {
    connections: HashMap<String, String>,
}

impl StaticConnectionStringResolver {
    pub fn new(connections: HashMap<String, String>) -> Self {
        Self { connections }
    }

    pub fn single(name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut connections = HashMap::new();
        connections.insert(name.into(), value.into());
        Self { connections }
    }
}

impl ConnectionStringResolver for StaticConnectionStringResolver {
    fn resolve(&self, name: &str) -> Option<String> {
        self.connections.get(name).cloned()
    }
}

/// Error raised while constructing a writer.
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgument),
    #[error("connection string '{0}' is not configured")]
    MissingConnectionString(String),
}

/// Chooses the sink configuration for a given function.
pub struct TraceWriterFactory {
    config: HostConfig,
    resolver: Arc<dyn ConnectionStringResolver>,
    metrics: Option<HostMetrics>,
}

impl TraceWriterFactory {
    pub fn new(config: HostConfig, resolver: Arc<dyn ConnectionStringResolver>) -> Self {
        Self {
            config,
            resolver,
            metrics: None,
        }
    }

    /// Wires the writers this factory creates to a shared metrics instance.
    pub fn with_metrics(mut self, metrics: HostMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Creates the buffered writer for `function_name`.
    ///
    /// Standalone deployments log to the relational table and the function
    /// file; otherwise the file logging mode decides between a file-only
    /// and a no-op writer.
    pub fn create(&self, function_name: &str) -> Result<Arc<BufferedTraceWriter>, FactoryError> {
        let sink = self.select_sink(function_name)?;
        Ok(BufferedTraceWriter::with_options(
            sink,
            self.config.console_level,
            true,
            FLUSH_INTERVAL,
            self.metrics.clone(),
        ))
    }

    fn select_sink(&self, function_name: &str) -> Result<Arc<dyn TraceSink>, FactoryError> {
        let level = self.config.console_level;
        let function_dir = self
            .config
            .root_log_path
            .join(FUNCTION_LOG_DIRECTORY)
            .join(function_name);

        if self.config.standalone_mode {
            let connection_string = self
                .resolver
                .resolve(SQL_TRACER_CONNECTION)
                .ok_or_else(|| {
                    FactoryError::MissingConnectionString(SQL_TRACER_CONNECTION.to_string())
                })?;
            let sql = SqlSink::new(
                connection_string,
                self.config.instance_id.clone(),
                self.config.site_name.clone(),
                Some(function_name.to_string()),
                level,
            )?;
            let file = FileSink::new(function_dir, level);
            tracing::debug!(
                function = function_name,
                "Standalone mode: logging to SQL and file sinks"
            );
            return Ok(Arc::new(CompositeSink::new(vec![
                Arc::new(sql),
                Arc::new(file),
            ])));
        }

        if self.config.file_logging_mode != FileLoggingMode::Never {
            Ok(Arc::new(FileSink::new(function_dir, level)))
        } else {
            Ok(Arc::new(NullSink))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HostConfig {
        HostConfig {
            host_id: "host-1".to_string(),
            instance_id: "instance-1".to_string(),
            site_name: "site-a".to_string(),
            ..HostConfig::default()
        }
    }

    fn resolver_with_sql() -> Arc<dyn ConnectionStringResolver> {
        Arc::new(StaticConnectionStringResolver::single(
            SQL_TRACER_CONNECTION,
            "sqlite::memory:",
        ))
    }

    #[tokio::test]
    async fn test_standalone_without_connection_string_fails() {
        let factory = TraceWriterFactory::new(
            HostConfig {
                standalone_mode: true,
                ..config()
            },
            Arc::new(StaticConnectionStringResolver::default()),
        );

        let result = factory.create("HttpTrigger");
        assert!(matches!(
            result,
            Err(FactoryError::MissingConnectionString(_))
        ));
    }

    #[tokio::test]
    async fn test_standalone_with_blank_instance_id_fails() {
        let factory = TraceWriterFactory::new(
            HostConfig {
                standalone_mode: true,
                instance_id: " ".to_string(),
                ..config()
            },
            resolver_with_sql(),
        );

        let result = factory.create("HttpTrigger");
        assert!(matches!(result, Err(FactoryError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_standalone_selects_composite_sink() {
        let factory = TraceWriterFactory::new(
            HostConfig {
                standalone_mode: true,
                ..config()
            },
            resolver_with_sql(),
        );

        let writer = factory.create("HttpTrigger").unwrap();
        writer.close().await;
    }

    #[tokio::test]
    async fn test_env_resolver_reads_prefixed_variable() {
        std::env::set_var("FUNCHOST_CONNECTION_UNITTEST", "sqlite::memory:");
        let resolver = EnvConnectionStringResolver;
        assert_eq!(
            resolver.resolve("UnitTest"),
            Some("sqlite::memory:".to_string())
        );
        assert_eq!(resolver.resolve("Absent"), None);
        std::env::remove_var("FUNCHOST_CONNECTION_UNITTEST");
    }
}
