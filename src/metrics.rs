//! Host coordination metrics and observability.
//!
//! Always-on atomic counters and gauges with a Prometheus text exporter;
//! request and flush histograms are available behind the `observability`
//! feature.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Metrics for the lease loop and the trace pipeline.
///
/// Cheap to clone; all handles share one set of counters.
#[derive(Debug, Clone)]
pub struct HostMetrics {
    inner: Arc<HostMetricsInner>,
}

#[derive(Debug)]
struct HostMetricsInner {
    /// Instance ID label
    instance_id: String,

    // Gauges
    has_lease: AtomicU64, // 0=seeking, 1=holding
    last_renewal_latency_ms: AtomicI64,

    // Lease counters
    lease_requests: AtomicU64,
    leases_acquired: AtomicU64,
    renewals: AtomicU64,
    renewal_failures: AtomicU64,
    conflicts: AtomicU64,
    releases: AtomicU64,

    // Trace pipeline counters
    records_buffered: AtomicU64,
    records_dropped: AtomicU64,
    batches_flushed: AtomicU64,
    flush_failures: AtomicU64,

    // Histograms (Observability)
    #[cfg(feature = "observability")]
    lease_request_duration: prometheus::Histogram,
    #[cfg(feature = "observability")]
    flush_duration: prometheus::Histogram,
}

impl HostMetrics {
    /// Creates a new metrics instance labelled with the host instance ID.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HostMetricsInner {
                instance_id: instance_id.into(),
                has_lease: AtomicU64::new(0),
                last_renewal_latency_ms: AtomicI64::new(-1),
                lease_requests: AtomicU64::new(0),
                leases_acquired: AtomicU64::new(0),
                renewals: AtomicU64::new(0),
                renewal_failures: AtomicU64::new(0),
                conflicts: AtomicU64::new(0),
                releases: AtomicU64::new(0),
                records_buffered: AtomicU64::new(0),
                records_dropped: AtomicU64::new(0),
                batches_flushed: AtomicU64::new(0),
                flush_failures: AtomicU64::new(0),
                #[cfg(feature = "observability")]
                lease_request_duration: prometheus::register_histogram!(
                    "host_lease_request_duration_seconds",
                    "Lease acquire/renew round-trip in seconds",
                    prometheus::DEFAULT_BUCKETS.to_vec()
                )
                .unwrap_or_else(|_| {
                    prometheus::Histogram::with_opts(prometheus::HistogramOpts::new(
                        "host_lease_request_duration_seconds",
                        "Lease acquire/renew round-trip in seconds",
                    ))
                    .unwrap()
                }),
                #[cfg(feature = "observability")]
                flush_duration: prometheus::register_histogram!(
                    "host_trace_flush_duration_seconds",
                    "Trace batch flush duration in seconds",
                    prometheus::DEFAULT_BUCKETS.to_vec()
                )
                .unwrap_or_else(|_| {
                    prometheus::Histogram::with_opts(prometheus::HistogramOpts::new(
                        "host_trace_flush_duration_seconds",
                        "Trace batch flush duration in seconds",
                    ))
                    .unwrap()
                }),
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    // ========================================================================
    // GAUGES
    // ========================================================================

    /// Records whether this instance currently holds the host lock.
    pub fn set_has_lease(&self, held: bool) {
        self.inner.has_lease.store(u64::from(held), Ordering::Relaxed);
    }

    /// Records the round-trip time of the last successful lease request.
    pub fn set_last_renewal_latency(&self, latency: std::time::Duration) {
        self.inner
            .last_renewal_latency_ms
            .store(latency.as_millis() as i64, Ordering::Relaxed);
    }

    // ========================================================================
    // LEASE COUNTERS
    // ========================================================================

    pub fn inc_lease_requests(&self) {
        self.inner.lease_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_leases_acquired(&self) {
        self.inner.leases_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_renewals(&self) {
        self.inner.renewals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_renewal_failures(&self) {
        self.inner.renewal_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conflicts(&self) {
        self.inner.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_releases(&self) {
        self.inner.releases.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // TRACE PIPELINE COUNTERS
    // ========================================================================

    pub fn add_records_buffered(&self, count: u64) {
        self.inner
            .records_buffered
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_records_dropped(&self) {
        self.inner.records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_batches_flushed(&self) {
        self.inner.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flush_failures(&self) {
        self.inner.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // OBSERVABILITY
    // ========================================================================

    /// Observes a lease acquire/renew round-trip.
    pub fn observe_lease_request(&self, duration: std::time::Duration) {
        let _ = duration;
        #[cfg(feature = "observability")]
        self.inner
            .lease_request_duration
            .observe(duration.as_secs_f64());
    }

    /// Observes a sink flush duration.
    pub fn observe_flush(&self, duration: std::time::Duration) {
        let _ = duration;
        #[cfg(feature = "observability")]
        self.inner.flush_duration.observe(duration.as_secs_f64());
    }

    // ========================================================================
    // GETTERS (for export)
    // ========================================================================

    pub fn has_lease(&self) -> u64 {
        self.inner.has_lease.load(Ordering::Relaxed)
    }
    pub fn last_renewal_latency_ms(&self) -> i64 {
        self.inner.last_renewal_latency_ms.load(Ordering::Relaxed)
    }
    pub fn lease_requests(&self) -> u64 {
        self.inner.lease_requests.load(Ordering::Relaxed)
    }
    pub fn leases_acquired(&self) -> u64 {
        self.inner.leases_acquired.load(Ordering::Relaxed)
    }
    pub fn renewals(&self) -> u64 {
        self.inner.renewals.load(Ordering::Relaxed)
    }
    pub fn renewal_failures(&self) -> u64 {
        self.inner.renewal_failures.load(Ordering::Relaxed)
    }
    pub fn conflicts(&self) -> u64 {
        self.inner.conflicts.load(Ordering::Relaxed)
    }
    pub fn releases(&self) -> u64 {
        self.inner.releases.load(Ordering::Relaxed)
    }
    pub fn records_buffered(&self) -> u64 {
        self.inner.records_buffered.load(Ordering::Relaxed)
    }
    pub fn records_dropped(&self) -> u64 {
        self.inner.records_dropped.load(Ordering::Relaxed)
    }
    pub fn batches_flushed(&self) -> u64 {
        self.inner.batches_flushed.load(Ordering::Relaxed)
    }
    pub fn flush_failures(&self) -> u64 {
        self.inner.flush_failures.load(Ordering::Relaxed)
    }

    // ========================================================================
    // PROMETHEUS EXPORT
    // ========================================================================

    /// Exports metrics in Prometheus text format.
    pub fn to_prometheus_text(&self) -> String {
        let instance_id = self.instance_id();

        let mut output = String::new();

        macro_rules! gauge {
            ($name:expr, $help:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} gauge\n{}{{instance_id=\"{}\"}} {}\n",
                    $name, $help, $name, $name, instance_id, $value
                ));
            };
        }

        macro_rules! counter {
            ($name:expr, $help:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} counter\n{}{{instance_id=\"{}\"}} {}\n",
                    $name, $help, $name, $name, instance_id, $value
                ));
            };
        }

        // Gauges
        gauge!(
            "host_has_lease",
            "Whether this instance holds the host lock (0=seeking, 1=holding)",
            self.has_lease()
        );
        gauge!(
            "host_last_renewal_latency_ms",
            "Round-trip of the last successful lease request (-1 before the first)",
            self.last_renewal_latency_ms()
        );

        // Counters
        counter!(
            "host_lease_requests_total",
            "Lease acquire/renew attempts",
            self.lease_requests()
        );
        counter!(
            "host_leases_acquired_total",
            "Successful lease acquisitions",
            self.leases_acquired()
        );
        counter!(
            "host_lease_renewals_total",
            "Successful lease renewals",
            self.renewals()
        );
        counter!(
            "host_lease_renewal_failures_total",
            "Failed renewals while holding the lease",
            self.renewal_failures()
        );
        counter!(
            "host_lease_conflicts_total",
            "Requests rejected because another host holds the lease",
            self.conflicts()
        );
        counter!(
            "host_lease_releases_total",
            "Lease releases issued on dispose",
            self.releases()
        );
        counter!(
            "host_trace_records_buffered_total",
            "Trace records accepted into the buffer",
            self.records_buffered()
        );
        counter!(
            "host_trace_records_dropped_total",
            "Trace records dropped by level filtering",
            self.records_dropped()
        );
        counter!(
            "host_trace_batches_flushed_total",
            "Batches delivered to the sink",
            self.batches_flushed()
        );
        counter!(
            "host_trace_flush_failures_total",
            "Batches lost to sink failures",
            self.flush_failures()
        );

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = HostMetrics::new("instance-1");
        assert_eq!(metrics.instance_id(), "instance-1");
        assert_eq!(metrics.has_lease(), 0);
        assert_eq!(metrics.last_renewal_latency_ms(), -1);
    }

    #[test]
    fn test_gauges_and_counters() {
        let metrics = HostMetrics::new("instance-1");

        metrics.set_has_lease(true);
        assert_eq!(metrics.has_lease(), 1);

        metrics.inc_lease_requests();
        metrics.inc_lease_requests();
        assert_eq!(metrics.lease_requests(), 2);

        metrics.add_records_buffered(3);
        assert_eq!(metrics.records_buffered(), 3);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = HostMetrics::new("instance-1");
        let clone = metrics.clone();

        clone.inc_conflicts();
        assert_eq!(metrics.conflicts(), 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = HostMetrics::new("abc");
        metrics.set_has_lease(true);
        metrics.inc_leases_acquired();

        let output = metrics.to_prometheus_text();

        assert!(output.contains("host_has_lease{instance_id=\"abc\"} 1"));
        assert!(output.contains("host_leases_acquired_total{instance_id=\"abc\"} 1"));
    }
}
