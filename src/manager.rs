//! Singleton host lease management.
//!
//! Many instances of the function host run against the same storage
//! account; the one that holds the host lock lease acts as the primary for
//! that host identity. Each instance runs a [`LeaseManager`] that keeps
//! trying to take the lock, renews it while held, publishes ownership
//! transitions, and gives the lease back on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::builder::LeaseManagerBuilder;
use crate::lease::{LeaseDefinition, LeaseError, LeaseProvider};
use crate::metrics::HostMetrics;
use crate::trace::{TraceEvent, TraceWriter};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Shortest lease timeout the underlying store arbitrates reliably.
pub const MIN_LEASE_TIMEOUT: Duration = Duration::from_secs(15);

/// Longest lease timeout the underlying store accepts.
pub const MAX_LEASE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default lease timeout when none is configured.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(30);

/// Tick cadence while seeking the lease.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Renewals run this much ahead of the lease expiring.
pub const RENEWAL_MARGIN: Duration = Duration::from_secs(3);

/// ISO-8601 UTC, millisecond precision, used in renewal-loss messages.
const RENEWAL_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

type LeaseChangedCallback = Arc<dyn Fn() + Send + Sync>;

// ============================================================================
// STATE
// ============================================================================

/// Mutable core, guarded by one mutex. The lock is never held across an
/// await.
struct LeaseState {
    held_lease_id: Option<String>,
    last_renewal_at: Option<DateTime<Utc>>,
    last_renewal_latency: Duration,
    /// Current tick period: retry cadence while seeking, renewal cadence
    /// while holding.
    period: Duration,
}

struct Inner {
    provider: Arc<dyn LeaseProvider>,
    trace_writer: Arc<dyn TraceWriter>,
    metrics: HostMetrics,
    account_name: String,
    host_id: String,
    instance_id: String,
    lease_timeout: Duration,
    renewal_interval: Duration,
    retry_interval: Duration,
    state: Mutex<LeaseState>,
    /// Re-entry guard: at most one lease request is outstanding, even when
    /// ticks fire faster than the provider answers.
    in_flight: AtomicBool,
    disposed: AtomicBool,
    subscribers: Mutex<Vec<LeaseChangedCallback>>,
}

/// Maintains best-effort ownership of the host lock lease.
///
/// Construction starts the tick loop: an immediate first attempt, then
/// every retry interval until acquired, then every renewal interval while
/// held. [`dispose`] stops the loop and releases the lease best-effort.
///
/// [`dispose`]: LeaseManager::dispose
pub struct LeaseManager {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaseManager {
    pub fn builder() -> LeaseManagerBuilder {
        LeaseManagerBuilder::new()
    }

    /// Starts a manager with default cadences and a null trace writer; see
    /// [`LeaseManagerBuilder`] for the full construction surface.
    pub fn start(
        provider: Arc<dyn LeaseProvider>,
        account_name: impl Into<String>,
        host_id: impl Into<String>,
        instance_id: impl Into<String>,
        lease_timeout: Duration,
    ) -> Result<Self, crate::InvalidArgument> {
        Self::builder()
            .provider(provider)
            .account_name(account_name)
            .host_id(host_id)
            .instance_id(instance_id)
            .lease_timeout(lease_timeout)
            .build()
    }

    /// Validated construction entry point used by the builder.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn launch(
        provider: Arc<dyn LeaseProvider>,
        trace_writer: Arc<dyn TraceWriter>,
        metrics: HostMetrics,
        account_name: String,
        host_id: String,
        instance_id: String,
        lease_timeout: Duration,
        renewal_interval: Duration,
        retry_interval: Duration,
    ) -> Self {
        let inner = Arc::new(Inner {
            provider,
            trace_writer,
            metrics,
            account_name,
            host_id,
            instance_id,
            lease_timeout,
            renewal_interval,
            retry_interval,
            state: Mutex::new(LeaseState {
                held_lease_id: None,
                last_renewal_at: None,
                last_renewal_latency: Duration::ZERO,
                period: retry_interval,
            }),
            in_flight: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Inner::run(inner.clone(), shutdown_rx));

        tracing::info!(
            host_id = %inner.host_id,
            instance_id = %inner.instance_id,
            lease_timeout_ms = lease_timeout.as_millis() as u64,
            "Starting host lock lease manager"
        );

        Self {
            inner,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    // ========================================================================
    // PUBLIC SURFACE
    // ========================================================================

    /// True while this instance owns the host lock lease.
    pub fn has_lease(&self) -> bool {
        self.inner.has_lease()
    }

    /// The currently held lease ID, if any.
    pub fn lease_id(&self) -> Option<String> {
        self.inner.lease_id()
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn host_id(&self) -> &str {
        &self.inner.host_id
    }

    pub fn metrics(&self) -> HostMetrics {
        self.inner.metrics.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Subscribes to ownership transitions. The callback fires after the
    /// state change is visible and must not block; subscribers added while
    /// a notification is firing may miss that firing.
    pub fn on_lease_changed(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .push(Arc::new(callback));
    }

    /// Stops the tick loop and releases the lease if held. Idempotent; the
    /// release is best-effort because the store expires the lease on its
    /// own period anyway.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }

        let held = {
            let mut state = self.inner.state.lock().unwrap();
            state.period = self.inner.retry_interval;
            state.held_lease_id.take()
        };

        if let Some(lease_id) = held {
            self.inner.metrics.set_has_lease(false);
            self.inner.fire_lease_changed();

            let lease = self.inner.lease_definition().with_lease_id(lease_id);
            match self.inner.provider.release(&lease).await {
                Ok(()) => {
                    self.inner.metrics.inc_releases();
                    tracing::debug!(
                        instance_id = %self.inner.instance_id,
                        "Host lock lease released on dispose"
                    );
                }
                Err(err) => {
                    tracing::debug!(
                        instance_id = %self.inner.instance_id,
                        error = %err,
                        "Best-effort lease release failed on dispose"
                    );
                }
            }
        }
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        // Backstop only; an explicit dispose also releases the lease.
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

// ============================================================================
// TICK LOOP
// ============================================================================

impl Inner {
    async fn run(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
        let mut first_tick = true;
        loop {
            if !first_tick {
                let period = inner.current_period();
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = shutdown.changed() => break,
                }
            }
            first_tick = false;

            if inner.disposed.load(Ordering::SeqCst) {
                break;
            }
            // Drop the tick while a request is still outstanding.
            if inner.in_flight.swap(true, Ordering::SeqCst) {
                continue;
            }

            let worker = inner.clone();
            tokio::spawn(async move {
                worker.acquire_or_renew().await;
                worker.in_flight.store(false, Ordering::SeqCst);
            });
        }
    }

    fn current_period(&self) -> Duration {
        self.state.lock().unwrap().period
    }

    fn has_lease(&self) -> bool {
        self.state.lock().unwrap().held_lease_id.is_some()
    }

    fn lease_id(&self) -> Option<String> {
        self.state.lock().unwrap().held_lease_id.clone()
    }

    fn lease_definition(&self) -> LeaseDefinition {
        LeaseDefinition::host_lock(&self.account_name, &self.host_id, self.lease_timeout)
    }

    // ========================================================================
    // ACQUIRE / RENEW
    // ========================================================================

    async fn acquire_or_renew(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        let held = self.lease_id();
        let request_start = Instant::now();
        self.metrics.inc_lease_requests();

        let result = match &held {
            Some(lease_id) => {
                let lease = self.lease_definition().with_lease_id(lease_id.clone());
                self.provider.renew(&lease).await
            }
            None => {
                let lease = self
                    .lease_definition()
                    .with_lease_id(self.instance_id.clone());
                self.provider.acquire(&lease).await.map(|granted| {
                    self.on_acquired(granted, request_start);
                })
            }
        };

        match result {
            Ok(()) => {
                if held.is_some() {
                    self.on_renewed(request_start);
                }
            }
            Err(err) => self.handle_lease_error(err, held.is_some()),
        }
    }

    fn on_acquired(&self, lease_id: String, request_start: Instant) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        self.record_success(request_start);
        {
            let mut state = self.state.lock().unwrap();
            state.period = self.renewal_interval;
        }
        self.update_held_lease(Some(lease_id));
        self.metrics.inc_leases_acquired();

        tracing::info!(
            instance_id = %self.instance_id,
            host_id = %self.host_id,
            "Acquired host lock lease"
        );
        self.trace_writer.trace(
            TraceEvent::info(format!(
                "Host lock lease acquired by instance ID '{}'.",
                self.instance_id
            ))
            .system(),
        );
    }

    fn on_renewed(&self, request_start: Instant) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        self.record_success(request_start);
        self.metrics.inc_renewals();
        tracing::debug!(instance_id = %self.instance_id, "Renewed host lock lease");
    }

    fn record_success(&self, request_start: Instant) {
        let latency = request_start.elapsed();
        {
            let mut state = self.state.lock().unwrap();
            state.last_renewal_at = Some(Utc::now());
            state.last_renewal_latency = latency;
        }
        self.metrics.set_last_renewal_latency(latency);
        self.metrics.observe_lease_request(latency);
    }

    // ========================================================================
    // FAILURE ROUTING
    // ========================================================================

    fn handle_lease_error(&self, err: LeaseError, had_lease: bool) {
        match err {
            // Lease stolen out from under us.
            LeaseError::Conflict if had_lease => {
                self.metrics.inc_conflicts();
                self.metrics.inc_renewal_failures();

                let (completed_at, ago_ms, latency_ms) = {
                    let state = self.state.lock().unwrap();
                    let completed_at = state.last_renewal_at.unwrap_or_else(Utc::now);
                    let ago_ms = (Utc::now() - completed_at).num_milliseconds().max(0);
                    (
                        completed_at,
                        ago_ms,
                        state.last_renewal_latency.as_millis(),
                    )
                };
                self.process_error(format!(
                    "Another host has acquired the lease. The last successful renewal completed at {} ({} milliseconds ago) with a duration of {} milliseconds.",
                    completed_at.format(RENEWAL_TIMESTAMP_FORMAT),
                    ago_ms,
                    latency_ms
                ));
            }
            // Another host holds the lock; normal while seeking.
            LeaseError::Conflict => {
                self.metrics.inc_conflicts();
                tracing::debug!(
                    instance_id = %self.instance_id,
                    "Host lock lease is held by another instance"
                );
                self.process_error("Another host has an active lease.".to_string());
            }
            err => {
                if had_lease {
                    self.metrics.inc_renewal_failures();
                }
                tracing::warn!(
                    instance_id = %self.instance_id,
                    error = %err,
                    "Lease provider request failed"
                );
                self.process_error(format!("Server error. {err}"));
            }
        }
    }

    fn process_error(&self, reason: String) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        if self.has_lease() {
            self.reset();
            self.trace_writer.trace(
                TraceEvent::info(format!("Failed to renew host lock lease: {reason}")).system(),
            );
        } else {
            self.trace_writer.trace(
                TraceEvent::verbose(format!(
                    "Host instance '{}' failed to acquire host lock lease: {reason}",
                    self.instance_id
                ))
                .system(),
            );
        }
    }

    /// Gives up ownership locally and falls back to the seek cadence.
    fn reset(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.period = self.retry_interval;
        }
        self.update_held_lease(None);
    }

    // ========================================================================
    // CHANGE NOTIFICATION
    // ========================================================================

    /// Stores the new lease ID and fires the change notification exactly
    /// once per transition. Lease IDs compare case-insensitively.
    fn update_held_lease(&self, lease_id: Option<String>) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        let changed = {
            let mut state = self.state.lock().unwrap();
            let changed = !same_lease(state.held_lease_id.as_deref(), lease_id.as_deref());
            state.held_lease_id = lease_id;
            changed
        };

        if changed {
            self.metrics.set_has_lease(self.has_lease());
            self.fire_lease_changed();
        }
    }

    /// Invokes a snapshot of the subscriber list outside any lock, so
    /// publishers never block on subscriber work.
    fn fire_lease_changed(&self) {
        let callbacks: Vec<LeaseChangedCallback> =
            self.subscribers.lock().unwrap().iter().cloned().collect();
        for callback in callbacks {
            callback();
        }
    }
}

fn same_lease(current: Option<&str>, next: Option<&str>) -> bool {
    match (current, next) {
        (None, None) => true,
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}
