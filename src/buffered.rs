//! Buffered, batched trace writing.
//!
//! Producers append from any task or thread; a background timer drains the
//! buffer to the sink once per second. Flushes are serialized so a record
//! is delivered at most once and batches never overlap within one writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::metrics::HostMetrics;
use crate::sinks::TraceSink;
use crate::trace::{FunctionInvocationError, TraceEvent, TraceLevel, TraceRecord, TraceWriter};

/// Cadence of the background flush timer.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(1000);

/// Multiple-producer trace writer with timed batch flushing.
///
/// Dropping the writer stops the timer; records buffered after [`close`]
/// are accepted but only flushed on a best-effort basis.
///
/// [`close`]: BufferedTraceWriter::close
pub struct BufferedTraceWriter {
    level: TraceLevel,
    system_traces_enabled: bool,
    sink: Arc<dyn TraceSink>,
    buffer: Mutex<Vec<TraceRecord>>,
    // Swapping the buffer and invoking the sink happen under this lock, so
    // flushes are serialized and no record is delivered twice.
    flush_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    metrics: Option<HostMetrics>,
}

impl BufferedTraceWriter {
    /// Creates a writer flushing to `sink` every [`FLUSH_INTERVAL`], with
    /// system traces enabled.
    pub fn new(sink: Arc<dyn TraceSink>, level: TraceLevel) -> Arc<Self> {
        Self::with_options(sink, level, true, FLUSH_INTERVAL, None)
    }

    /// Creates a writer with explicit filtering, cadence and metrics wiring.
    pub fn with_options(
        sink: Arc<dyn TraceSink>,
        level: TraceLevel,
        system_traces_enabled: bool,
        flush_interval: Duration,
        metrics: Option<HostMetrics>,
    ) -> Arc<Self> {
        let writer = Arc::new(Self {
            level,
            system_traces_enabled,
            sink,
            buffer: Mutex::new(Vec::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            timer: Mutex::new(None),
            metrics,
        });

        let weak = Arc::downgrade(&writer);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the first flush waits a
            // full period.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(writer) = weak.upgrade() else { break };
                if writer.closed.load(Ordering::SeqCst) {
                    break;
                }
                writer.flush().await;
            }
        });
        *writer.timer.lock().unwrap() = Some(handle);

        writer
    }

    pub fn level(&self) -> TraceLevel {
        self.level
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of records currently waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    /// Drains the buffer to the sink.
    ///
    /// A no-op when the buffer is empty. Sink failures are logged and
    /// counted; the batch they carried is lost.
    pub async fn flush(&self) {
        if self.buffer.lock().unwrap().is_empty() {
            return;
        }

        let _guard = self.flush_lock.lock().await;
        let batch = {
            let mut buffer = self.buffer.lock().unwrap();
            std::mem::take(&mut *buffer)
        };
        if batch.is_empty() {
            return;
        }

        let flush_start = std::time::Instant::now();
        match self.sink.flush_batch(&batch).await {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_batches_flushed();
                    metrics.observe_flush(flush_start.elapsed());
                }
            }
            Err(err) => {
                tracing::error!(
                    records = batch.len(),
                    error = %err,
                    "Trace sink failed to flush batch"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.inc_flush_failures();
                }
            }
        }
    }

    /// Stops the timer and performs a final flush. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Drain before stopping the timer task; the flush lock serializes
        // with any flush already in flight, so no batch is torn.
        self.flush().await;
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn append(&self, records: Vec<TraceRecord>) {
        if records.is_empty() {
            return;
        }
        let count = records.len();
        self.buffer.lock().unwrap().extend(records);
        if let Some(metrics) = &self.metrics {
            metrics.add_records_buffered(count as u64);
        }
    }
}

impl TraceWriter for BufferedTraceWriter {
    fn trace(&self, event: TraceEvent) {
        if event.level == TraceLevel::Off {
            return;
        }
        if !self.system_traces_enabled && event.is_system_trace() {
            return;
        }
        if self.level < event.level {
            if let Some(metrics) = &self.metrics {
                metrics.inc_records_dropped();
            }
            return;
        }

        let mut records = Vec::with_capacity(2);
        records.push(TraceRecord {
            timestamp: Utc::now(),
            level: event.level,
            message: event.message.trim().to_string(),
            properties: event.properties.clone(),
        });
        if let Some(error) = &event.error {
            records.push(TraceRecord {
                timestamp: Utc::now(),
                level: event.level,
                message: flatten_error(error).trim().to_string(),
                properties: event.properties.clone(),
            });
        }

        self.append(records);
    }
}

impl Drop for BufferedTraceWriter {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Renders the extra record line carried by an event's error payload.
///
/// Invocation wrappers collapse to the innermost cause message; any other
/// error keeps its full multi-line cause chain.
fn flatten_error(error: &anyhow::Error) -> String {
    if error.downcast_ref::<FunctionInvocationError>().is_some() {
        error
            .chain()
            .last()
            .map(|cause| cause.to_string())
            .unwrap_or_else(|| error.to_string())
    } else {
        format!("{error:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::SinkError;
    use async_trait::async_trait;

    struct CaptureSink {
        batches: Mutex<Vec<Vec<TraceRecord>>>,
    }

    impl CaptureSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
            })
        }

        fn messages(&self) -> Vec<String> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .flatten()
                .map(|r| r.message.clone())
                .collect()
        }
    }

    #[async_trait]
    impl TraceSink for CaptureSink {
        async fn flush_batch(&self, records: &[TraceRecord]) -> Result<(), SinkError> {
            self.batches.lock().unwrap().push(records.to_vec());
            Ok(())
        }
    }

    fn quiet_writer(sink: Arc<dyn TraceSink>, level: TraceLevel) -> Arc<BufferedTraceWriter> {
        // A long cadence keeps the background timer out of these tests.
        BufferedTraceWriter::with_options(sink, level, true, Duration::from_secs(3600), None)
    }

    #[tokio::test]
    async fn test_level_filtering() {
        let sink = CaptureSink::new();
        let writer = quiet_writer(sink.clone(), TraceLevel::Info);

        writer.trace(TraceEvent::verbose("dropped"));
        writer.trace(TraceEvent::error("kept"));
        writer.flush().await;

        assert_eq!(sink.messages(), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_system_traces_can_be_disabled() {
        let sink = CaptureSink::new();
        let writer = BufferedTraceWriter::with_options(
            sink.clone(),
            TraceLevel::Verbose,
            false,
            Duration::from_secs(3600),
            None,
        );

        writer.trace(TraceEvent::info("internal").system());
        writer.trace(TraceEvent::info("visible"));
        writer.flush().await;

        assert_eq!(sink.messages(), vec!["visible"]);
    }

    #[tokio::test]
    async fn test_invocation_error_appends_innermost_cause() {
        let sink = CaptureSink::new();
        let writer = quiet_writer(sink.clone(), TraceLevel::Verbose);

        let cause = std::io::Error::new(std::io::ErrorKind::Other, "undefined is not a function");
        let error = anyhow::Error::from(FunctionInvocationError::new("QueueTrigger", cause));
        writer.trace(TraceEvent::error("Function failed").with_error(error));
        writer.flush().await;

        let messages = sink.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], "Function failed");
        assert_eq!(messages[1], "undefined is not a function");
    }

    #[tokio::test]
    async fn test_generic_error_keeps_full_chain() {
        let sink = CaptureSink::new();
        let writer = quiet_writer(sink.clone(), TraceLevel::Verbose);

        let error = anyhow::anyhow!("inner detail").context("outer failure");
        writer.trace(TraceEvent::error("Host error").with_error(error));
        writer.flush().await;

        let messages = sink.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[1].contains("outer failure"));
        assert!(messages[1].contains("inner detail"));
    }

    #[tokio::test]
    async fn test_messages_are_trimmed_and_ordered() {
        let sink = CaptureSink::new();
        let writer = quiet_writer(sink.clone(), TraceLevel::Verbose);

        writer.trace(TraceEvent::info("  first  "));
        writer.trace(TraceEvent::info("second"));
        writer.flush().await;

        assert_eq!(sink.messages(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_flush_delivers_each_record_once() {
        let sink = CaptureSink::new();
        let writer = quiet_writer(sink.clone(), TraceLevel::Verbose);

        writer.trace(TraceEvent::info("only once"));
        writer.flush().await;
        writer.flush().await;

        assert_eq!(sink.messages(), vec!["only once"]);
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_flushes_and_is_idempotent() {
        let sink = CaptureSink::new();
        let writer = quiet_writer(sink.clone(), TraceLevel::Verbose);

        writer.trace(TraceEvent::info("pending"));
        writer.close().await;
        writer.close().await;

        assert!(writer.is_closed());
        assert_eq!(sink.messages(), vec!["pending"]);
    }
}
