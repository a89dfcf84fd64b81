//! Lease store abstraction.
//!
//! A lease is a time-bounded, server-arbitrated token granting exclusive
//! rights to a named resource. The store fences concurrent holders; the
//! manager built on top only has to keep renewing in time.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Namespace (container) the host lock leases live in.
pub const HOST_LOCK_NAMESPACE: &str = "hosts";

/// Describes what to lock. Immutable per attempt; a fresh definition is
/// built for every acquire/renew/release call.
#[derive(Debug, Clone)]
pub struct LeaseDefinition {
    pub account_name: String,
    pub namespace: String,
    pub name: String,
    pub period: Duration,
    pub lease_id: Option<String>,
}

impl LeaseDefinition {
    /// The lock definition for a host identity, named by the
    /// `locks/{host_id}/host` convention.
    pub fn host_lock(account_name: impl Into<String>, host_id: &str, period: Duration) -> Self {
        Self {
            account_name: account_name.into(),
            namespace: HOST_LOCK_NAMESPACE.to_string(),
            name: format!("locks/{host_id}/host"),
            period,
            lease_id: None,
        }
    }

    pub fn with_lease_id(mut self, lease_id: impl Into<String>) -> Self {
        self.lease_id = Some(lease_id.into());
        self
    }

    /// Store-wide key of the leased resource.
    pub fn resource_key(&self) -> String {
        format!("{}/{}/{}", self.account_name, self.namespace, self.name)
    }
}

/// Error raised by a lease store operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LeaseError {
    /// Another client holds the lease. Routine for seekers, notable for
    /// holders.
    #[error("the lease is held by another client")]
    Conflict,
    #[error("the lease resource was not found")]
    NotFound,
    #[error("transient server error: {0}")]
    TransientServer(String),
    #[error("{0}")]
    Other(String),
}

/// Capability set the lease manager consumes.
///
/// Cancellation is by future drop; implementations must leave the store
/// consistent when a call is abandoned mid-flight.
#[async_trait]
pub trait LeaseProvider: Send + Sync {
    /// Attempts to take the lease, proposing `lease_id` when one is set.
    /// Returns the granted lease ID.
    async fn acquire(&self, lease: &LeaseDefinition) -> Result<String, LeaseError>;

    /// Extends the lease identified by `lease.lease_id` by one period.
    async fn renew(&self, lease: &LeaseDefinition) -> Result<(), LeaseError>;

    /// Gives the lease back. Callers treating release as best-effort may
    /// ignore the result; the store expires the lease on its own anyway.
    async fn release(&self, lease: &LeaseDefinition) -> Result<(), LeaseError>;
}

struct HeldLease {
    lease_id: String,
    expires_at: Instant,
    period: Duration,
}

/// In-process lease store with TTL expiry and conflict detection.
///
/// Useful for tests and single-process deployments; the semantics mirror a
/// blob-style lease container.
#[derive(Default)]
pub struct InMemoryLeaseProvider {
    leases: Mutex<HashMap<String, HeldLease>>,
    next_id: AtomicU64,
}

impl InMemoryLeaseProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of the resource, if the lease has not expired.
    pub fn current_holder(&self, lease: &LeaseDefinition) -> Option<String> {
        let leases = self.leases.lock().unwrap();
        leases
            .get(&lease.resource_key())
            .filter(|held| held.expires_at > Instant::now())
            .map(|held| held.lease_id.clone())
    }
}

#[async_trait]
impl LeaseProvider for InMemoryLeaseProvider {
    async fn acquire(&self, lease: &LeaseDefinition) -> Result<String, LeaseError> {
        let now = Instant::now();
        let mut leases = self.leases.lock().unwrap();

        if let Some(held) = leases.get(&lease.resource_key()) {
            let same_holder = lease
                .lease_id
                .as_deref()
                .is_some_and(|id| id.eq_ignore_ascii_case(&held.lease_id));
            if held.expires_at > now && !same_holder {
                return Err(LeaseError::Conflict);
            }
        }

        let lease_id = lease.lease_id.clone().unwrap_or_else(|| {
            format!("lease-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
        });
        leases.insert(
            lease.resource_key(),
            HeldLease {
                lease_id: lease_id.clone(),
                expires_at: now + lease.period,
                period: lease.period,
            },
        );
        Ok(lease_id)
    }

    async fn renew(&self, lease: &LeaseDefinition) -> Result<(), LeaseError> {
        let lease_id = lease
            .lease_id
            .as_deref()
            .ok_or_else(|| LeaseError::Other("renew requires a lease id".to_string()))?;

        let mut leases = self.leases.lock().unwrap();
        match leases.get_mut(&lease.resource_key()) {
            None => Err(LeaseError::NotFound),
            Some(held) if held.lease_id.eq_ignore_ascii_case(lease_id) => {
                held.expires_at = Instant::now() + held.period;
                Ok(())
            }
            Some(_) => Err(LeaseError::Conflict),
        }
    }

    async fn release(&self, lease: &LeaseDefinition) -> Result<(), LeaseError> {
        let lease_id = lease
            .lease_id
            .as_deref()
            .ok_or_else(|| LeaseError::Other("release requires a lease id".to_string()))?;

        let mut leases = self.leases.lock().unwrap();
        match leases.get(&lease.resource_key()) {
            None => Err(LeaseError::NotFound),
            Some(held) if held.lease_id.eq_ignore_ascii_case(lease_id) => {
                leases.remove(&lease.resource_key());
                Ok(())
            }
            Some(_) => Err(LeaseError::Conflict),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(host_id: &str) -> LeaseDefinition {
        LeaseDefinition::host_lock("account-1", host_id, Duration::from_millis(100))
    }

    #[test]
    fn test_host_lock_naming_convention() {
        let lease = definition("host-a");
        assert_eq!(lease.name, "locks/host-a/host");
        assert_eq!(lease.namespace, HOST_LOCK_NAMESPACE);
        assert_eq!(lease.resource_key(), "account-1/hosts/locks/host-a/host");
    }

    #[tokio::test]
    async fn test_acquire_then_conflict() {
        let provider = InMemoryLeaseProvider::new();
        let lease = definition("host-a");

        let granted = provider
            .acquire(&lease.clone().with_lease_id("instance-1"))
            .await
            .unwrap();
        assert_eq!(granted, "instance-1");

        let second = provider
            .acquire(&lease.clone().with_lease_id("instance-2"))
            .await;
        assert!(matches!(second, Err(LeaseError::Conflict)));
    }

    #[tokio::test]
    async fn test_acquire_after_expiry() {
        let provider = InMemoryLeaseProvider::new();
        let lease = definition("host-a");

        provider
            .acquire(&lease.clone().with_lease_id("instance-1"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let second = provider
            .acquire(&lease.clone().with_lease_id("instance-2"))
            .await;
        assert_eq!(second.unwrap(), "instance-2");
    }

    #[tokio::test]
    async fn test_renew_refreshes_expiry() {
        let provider = InMemoryLeaseProvider::new();
        let lease = definition("host-a");

        let id = provider
            .acquire(&lease.clone().with_lease_id("instance-1"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        provider
            .renew(&lease.clone().with_lease_id(id))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Still held because the renewal pushed the expiry out.
        assert_eq!(
            provider.current_holder(&lease),
            Some("instance-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_renew_with_wrong_id_conflicts() {
        let provider = InMemoryLeaseProvider::new();
        let lease = definition("host-a");

        provider
            .acquire(&lease.clone().with_lease_id("instance-1"))
            .await
            .unwrap();
        let result = provider.renew(&lease.clone().with_lease_id("intruder")).await;
        assert!(matches!(result, Err(LeaseError::Conflict)));
    }

    #[tokio::test]
    async fn test_lease_ids_compare_case_insensitively() {
        let provider = InMemoryLeaseProvider::new();
        let lease = definition("host-a");

        provider
            .acquire(&lease.clone().with_lease_id("Instance-1"))
            .await
            .unwrap();
        provider
            .renew(&lease.clone().with_lease_id("instance-1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_release_removes_lease() {
        let provider = InMemoryLeaseProvider::new();
        let lease = definition("host-a");

        provider
            .acquire(&lease.clone().with_lease_id("instance-1"))
            .await
            .unwrap();
        provider
            .release(&lease.clone().with_lease_id("instance-1"))
            .await
            .unwrap();

        assert_eq!(provider.current_holder(&lease), None);
        let result = provider.release(&lease.clone().with_lease_id("instance-1")).await;
        assert!(matches!(result, Err(LeaseError::NotFound)));
    }
}
