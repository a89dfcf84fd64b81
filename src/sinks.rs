//! Flush backends for buffered trace records.
//!
//! A sink receives whole batches in insertion order. Batch delivery is
//! best-effort: a failed flush loses that batch and must never take the
//! host down with it.

use async_trait::async_trait;
use std::sync::Arc;

use crate::trace::TraceRecord;

/// Error raised by a sink while flushing a batch.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// A concrete destination for trace records.
///
/// Ordering within a batch is the order of insertion. Ordering across
/// batches is the writer's concern; sinks may assume their `flush_batch`
/// calls never overlap for one writer.
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn flush_batch(&self, records: &[TraceRecord]) -> Result<(), SinkError>;
}

/// Accepts and discards every batch.
#[derive(Debug, Default, Clone)]
pub struct NullSink;

#[async_trait]
impl TraceSink for NullSink {
    async fn flush_batch(&self, _records: &[TraceRecord]) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Fans a batch out to an ordered list of sinks.
///
/// Every sink is attempted even when an earlier one fails; the first
/// failure is surfaced after the fan-out completes.
pub struct CompositeSink {
    sinks: Vec<Arc<dyn TraceSink>>,
}

impl CompositeSink {
    pub fn new(sinks: Vec<Arc<dyn TraceSink>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl TraceSink for CompositeSink {
    async fn flush_batch(&self, records: &[TraceRecord]) -> Result<(), SinkError> {
        let mut first_error = None;

        for (index, sink) in self.sinks.iter().enumerate() {
            if let Err(err) = sink.flush_batch(records).await {
                tracing::warn!(
                    sink_index = index,
                    error = %err,
                    "Composite sink member failed to flush"
                );
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
