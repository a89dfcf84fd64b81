use std::sync::Arc;
use std::time::Duration;

use crate::lease::LeaseProvider;
use crate::manager::{
    LeaseManager, DEFAULT_LEASE_TIMEOUT, DEFAULT_RETRY_INTERVAL, MAX_LEASE_TIMEOUT,
    MIN_LEASE_TIMEOUT, RENEWAL_MARGIN,
};
use crate::metrics::HostMetrics;
use crate::trace::{NullTraceWriter, TraceWriter};
use crate::InvalidArgument;

/// Builder for [`LeaseManager`].
///
/// Provides a fluent API for configuring and starting a manager; `build()`
/// validates the arguments and starts the tick loop.
pub struct LeaseManagerBuilder {
    provider: Option<Arc<dyn LeaseProvider>>,
    account_name: Option<String>,
    host_id: Option<String>,
    instance_id: Option<String>,
    lease_timeout: Duration,
    renewal_interval: Option<Duration>,
    retry_interval: Duration,
    trace_writer: Arc<dyn TraceWriter>,
    metrics: Option<HostMetrics>,
}

impl LeaseManagerBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            account_name: None,
            host_id: None,
            instance_id: None,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            renewal_interval: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            trace_writer: Arc::new(NullTraceWriter),
            metrics: None,
        }
    }

    /// Sets the lease store client (Required).
    pub fn provider(mut self, provider: Arc<dyn LeaseProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Sets the storage account the lease lives in (Required).
    pub fn account_name(mut self, account_name: impl Into<String>) -> Self {
        self.account_name = Some(account_name.into());
        self
    }

    /// Sets the shared host identity the lock is named after (Required).
    pub fn host_id(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = Some(host_id.into());
        self
    }

    /// Sets this instance's unique identity (Required).
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Sets the lease timeout. Must lie within 15 to 60 seconds.
    pub fn lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    /// Overrides the renewal cadence (defaults to the lease timeout minus a
    /// fixed margin).
    pub fn renewal_interval(mut self, renewal_interval: Duration) -> Self {
        self.renewal_interval = Some(renewal_interval);
        self
    }

    /// Overrides the seek cadence (defaults to 5 seconds).
    pub fn retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Sets the writer the manager reports its own diagnostics to.
    pub fn trace_writer(mut self, trace_writer: Arc<dyn TraceWriter>) -> Self {
        self.trace_writer = trace_writer;
        self
    }

    /// Shares an existing metrics instance instead of creating one.
    pub fn metrics(mut self, metrics: HostMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validates the configuration and starts the manager.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidArgument`] when a required input is missing or
    /// blank, or when the lease timeout falls outside its allowed range.
    pub fn build(self) -> Result<LeaseManager, InvalidArgument> {
        let provider = self
            .provider
            .ok_or_else(|| InvalidArgument::new("provider", "a lease provider is required"))?;
        let account_name = required_string("account_name", self.account_name)?;
        let host_id = required_string("host_id", self.host_id)?;
        let instance_id = required_string("instance_id", self.instance_id)?;

        if self.lease_timeout < MIN_LEASE_TIMEOUT || self.lease_timeout > MAX_LEASE_TIMEOUT {
            return Err(InvalidArgument::new(
                "lease_timeout",
                format!(
                    "must lie within [{}s, {}s], got {}ms",
                    MIN_LEASE_TIMEOUT.as_secs(),
                    MAX_LEASE_TIMEOUT.as_secs(),
                    self.lease_timeout.as_millis()
                ),
            ));
        }

        let renewal_interval = self
            .renewal_interval
            .unwrap_or(self.lease_timeout - RENEWAL_MARGIN);
        if renewal_interval >= self.lease_timeout {
            return Err(InvalidArgument::new(
                "renewal_interval",
                "must be shorter than the lease timeout",
            ));
        }
        if self.retry_interval.is_zero() {
            return Err(InvalidArgument::new("retry_interval", "must be non-zero"));
        }

        let metrics = self
            .metrics
            .unwrap_or_else(|| HostMetrics::new(instance_id.clone()));

        Ok(LeaseManager::launch(
            provider,
            self.trace_writer,
            metrics,
            account_name,
            host_id,
            instance_id,
            self.lease_timeout,
            renewal_interval,
            self.retry_interval,
        ))
    }
}

impl Default for LeaseManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn required_string(name: &'static str, value: Option<String>) -> Result<String, InvalidArgument> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        Some(_) => Err(InvalidArgument::new(name, "must not be blank")),
        None => Err(InvalidArgument::new(name, "is required")),
    }
}
