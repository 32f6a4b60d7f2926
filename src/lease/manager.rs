// Lease manager - acquisition, renewal and release against a lease backend

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{LeaseBackend, LeaseDescriptor, LeaseKey};
use crate::{ElectionConfig, Error, Result};

/// Translates "try to hold leadership" into backend reads and writes.
///
/// Acquisition and renewal share one path: a holder renewing differs from
/// a newcomer acquiring only in that it is already the recorded holder.
/// The manager never retries; the election loop's cadence does that.
#[derive(Debug)]
pub struct LeaseManager {
    config: Arc<ElectionConfig>,
    key: LeaseKey,
    backend: Arc<dyn LeaseBackend>,
}

impl LeaseManager {
    pub fn new(config: Arc<ElectionConfig>, backend: Arc<dyn LeaseBackend>) -> Result<Self> {
        if config.identity.trim().is_empty() {
            return Err(Error::EmptyIdentity);
        }

        let key = LeaseKey::new(config.namespace.clone(), config.name.clone());
        Ok(Self { config, key, backend })
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn key(&self) -> &LeaseKey {
        &self.key
    }

    /// Acquire the lease, or renew it if we already hold it.
    ///
    /// `Ok(false)` means another holder's lease is still valid, or another
    /// writer won a concurrent create/update. Neither is an error.
    pub async fn try_acquire(&self) -> Result<bool> {
        let now = Utc::now();

        match self.backend.get(&self.key).await? {
            None => self.create_lease(now).await,
            Some(lease) if self.can_acquire(&lease, now) => self.update_lease(lease, now).await,
            Some(lease) => {
                debug!(
                    identity = %self.config.identity,
                    holder = ?lease.holder_identity,
                    lease = %self.key,
                    "Lease held by another instance"
                );
                Ok(false)
            }
        }
    }

    /// Whether this instance may write itself into `lease` at `now`
    pub fn can_acquire(&self, lease: &LeaseDescriptor, now: DateTime<Utc>) -> bool {
        is_eligible(&self.config.identity, lease, now, self.config.lease_duration)
    }

    /// Current lease record
    pub async fn get_info(&self) -> Result<LeaseDescriptor> {
        self.backend
            .get(&self.key)
            .await?
            .ok_or_else(|| Error::LeaseNotFound {
                namespace: self.key.namespace.clone(),
                name: self.key.name.clone(),
            })
    }

    /// Give the lease up if we hold it. Never clears another holder.
    pub async fn release(&self) -> Result<()> {
        let Some(mut lease) = self.backend.get(&self.key).await? else {
            return Ok(());
        };

        if !lease.is_held_by(&self.config.identity) {
            debug!(
                identity = %self.config.identity,
                holder = ?lease.holder_identity,
                "Not releasing lease held by another instance"
            );
            return Ok(());
        }

        lease.clear_holder();
        match self.backend.update(&lease).await {
            Ok(_) => {
                info!(identity = %self.config.identity, lease = %self.key, "Released lease");
                Ok(())
            }
            Err(e) if e.is_contention() => {
                debug!(
                    identity = %self.config.identity,
                    lease = %self.key,
                    "Lease changed before release, leaving it untouched"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_lease(&self, now: DateTime<Utc>) -> Result<bool> {
        let lease = LeaseDescriptor::held_by(
            self.key.clone(),
            &self.config.identity,
            self.config.lease_duration_seconds(),
            now,
        );

        match self.backend.create(&lease).await {
            Ok(_) => {
                info!(identity = %self.config.identity, lease = %self.key, "Created lease");
                Ok(true)
            }
            Err(e) if e.is_contention() => {
                debug!(identity = %self.config.identity, "Lost lease creation race");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_lease(&self, mut lease: LeaseDescriptor, now: DateTime<Utc>) -> Result<bool> {
        let was_holder = lease.is_held_by(&self.config.identity);

        lease.holder_identity = Some(self.config.identity.clone());
        lease.renew_time = Some(now);
        if lease.lease_duration_seconds.is_none() {
            lease.lease_duration_seconds = Some(self.config.lease_duration_seconds());
        }
        if !was_holder {
            lease.acquire_time = Some(now);
            lease.lease_transitions = lease.lease_transitions.saturating_add(1);
        }

        match self.backend.update(&lease).await {
            Ok(_) => {
                if !was_holder {
                    info!(
                        identity = %self.config.identity,
                        transitions = lease.lease_transitions,
                        "Took over lease"
                    );
                }
                Ok(true)
            }
            Err(e) if e.is_contention() => {
                debug!(identity = %self.config.identity, "Lost lease update race");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Eligibility rule: we already hold it, nobody holds it, it was never
/// renewed, or it expired (`now > renew_time + duration`).
pub fn is_eligible(
    identity: &str,
    lease: &LeaseDescriptor,
    now: DateTime<Utc>,
    default_duration: Duration,
) -> bool {
    if lease.is_held_by(identity) {
        return true;
    }
    if lease.holder().is_none() {
        return true;
    }
    if lease.renew_time.is_none() {
        return true;
    }
    lease.is_expired(now, default_duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::InMemoryLeaseBackend;
    use proptest::prelude::*;

    fn config(identity: &str) -> Arc<ElectionConfig> {
        Arc::new(ElectionConfig::new(identity).with_lease("default", "talos-kms-leader"))
    }

    fn manager(identity: &str, backend: &Arc<InMemoryLeaseBackend>) -> LeaseManager {
        LeaseManager::new(config(identity), backend.clone()).unwrap()
    }

    fn key() -> LeaseKey {
        LeaseKey::new("default", "talos-kms-leader")
    }

    #[test]
    fn test_empty_identity() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let err = LeaseManager::new(config(""), backend).unwrap_err();
        assert!(matches!(err, Error::EmptyIdentity));
    }

    #[tokio::test]
    async fn test_acquire_absent_then_contend() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let a = manager("a", &backend);
        let b = manager("b", &backend);

        assert!(a.try_acquire().await.unwrap());
        let lease = backend.snapshot(&key()).unwrap();
        assert!(lease.is_held_by("a"));
        assert_eq!(lease.lease_transitions, 0);
        assert_eq!(lease.lease_duration_seconds, Some(15));

        assert!(!b.try_acquire().await.unwrap());
        assert!(backend.snapshot(&key()).unwrap().is_held_by("a"));
    }

    #[tokio::test]
    async fn test_renewal_keeps_acquire_time() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let a = manager("a", &backend);

        assert!(a.try_acquire().await.unwrap());
        let first = backend.snapshot(&key()).unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(a.try_acquire().await.unwrap());
        let second = backend.snapshot(&key()).unwrap();

        assert_eq!(second.acquire_time, first.acquire_time);
        assert_eq!(second.lease_transitions, first.lease_transitions);
        assert!(second.renew_time > first.renew_time);
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let stale = Utc::now() - chrono::Duration::seconds(20);
        backend.put(LeaseDescriptor::held_by(key(), "a", 15, stale));

        let b = manager("b", &backend);
        assert!(b.try_acquire().await.unwrap());

        let lease = backend.snapshot(&key()).unwrap();
        assert!(lease.is_held_by("b"));
        assert_eq!(lease.lease_transitions, 1);
        assert!(lease.acquire_time.unwrap() > stale);
    }

    #[tokio::test]
    async fn test_released_lease_is_acquirable() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let a = manager("a", &backend);
        let b = manager("b", &backend);

        assert!(a.try_acquire().await.unwrap());
        a.release().await.unwrap();

        let lease = backend.snapshot(&key()).unwrap();
        assert_eq!(lease.holder(), None);
        assert!(lease.renew_time.is_none());

        assert!(b.try_acquire().await.unwrap());
        let lease = backend.snapshot(&key()).unwrap();
        assert!(lease.is_held_by("b"));
        assert_eq!(lease.lease_transitions, 1);
    }

    #[tokio::test]
    async fn test_release_leaves_other_holder_alone() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let a = manager("a", &backend);
        let b = manager("b", &backend);

        assert!(a.try_acquire().await.unwrap());
        b.release().await.unwrap();
        assert!(backend.snapshot(&key()).unwrap().is_held_by("a"));
    }

    #[tokio::test]
    async fn test_release_without_lease_is_noop() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        manager("a", &backend).release().await.unwrap();
        assert!(backend.snapshot(&key()).is_none());
    }

    #[tokio::test]
    async fn test_get_info_missing_lease() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let err = manager("a", &backend).get_info().await.unwrap_err();
        assert!(matches!(err, Error::LeaseNotFound { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_create_has_one_winner() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        backend.set_latency(Duration::from_millis(5));
        let a = manager("a", &backend);
        let b = manager("b", &backend);

        let (ra, rb) = tokio::join!(a.try_acquire(), b.try_acquire());
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert!(ra ^ rb, "exactly one acquirer must win: a={ra} b={rb}");

        let holder = backend.snapshot(&key()).unwrap().holder_identity.unwrap();
        assert_eq!(holder, if ra { "a" } else { "b" });
    }

    #[tokio::test]
    async fn test_concurrent_takeover_has_one_winner() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let stale = Utc::now() - chrono::Duration::seconds(60);
        backend.put(LeaseDescriptor::held_by(key(), "old", 15, stale));
        backend.set_latency(Duration::from_millis(5));

        let a = manager("a", &backend);
        let b = manager("b", &backend);
        let (ra, rb) = tokio::join!(a.try_acquire(), b.try_acquire());
        assert!(ra.unwrap() ^ rb.unwrap());
        assert_eq!(backend.snapshot(&key()).unwrap().lease_transitions, 1);
    }

    #[tokio::test]
    async fn test_backend_errors_propagate() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        backend.set_available(false);

        let err = manager("a", &backend).try_acquire().await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[test]
    fn test_eligibility_rules() {
        let now = Utc::now();
        let default = Duration::from_secs(15);

        let held = LeaseDescriptor::held_by(key(), "a", 15, now);
        assert!(is_eligible("a", &held, now, default));
        assert!(!is_eligible("b", &held, now, default));

        let mut unheld = held.clone();
        unheld.holder_identity = None;
        assert!(is_eligible("b", &unheld, now, default));

        let mut never_renewed = held.clone();
        never_renewed.renew_time = None;
        assert!(is_eligible("b", &never_renewed, now, default));
    }

    proptest! {
        #[test]
        fn prop_foreign_lease_eligible_only_after_expiry(age_ms in 0i64..60_000, duration_s in 1i32..30) {
            let now = Utc::now();
            let renewed = now - chrono::Duration::milliseconds(age_ms);
            let lease = LeaseDescriptor::held_by(key(), "a", duration_s, renewed);

            let expired = age_ms > i64::from(duration_s) * 1000;
            prop_assert_eq!(is_eligible("b", &lease, now, Duration::from_secs(15)), expired);
            prop_assert!(is_eligible("a", &lease, now, Duration::from_secs(15)));
        }
    }
}
