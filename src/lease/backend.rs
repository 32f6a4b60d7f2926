// Lease backend - Get / Create / Update over lease descriptors

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use super::{LeaseDescriptor, LeaseKey};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("lease {0} already exists")]
    AlreadyExists(LeaseKey),

    #[error("lease {0} was modified concurrently")]
    Conflict(LeaseKey),

    #[error("lease {0} does not exist")]
    NotFound(LeaseKey),

    #[error("lease backend unavailable: {0}")]
    Unavailable(String),

    #[cfg(feature = "kubernetes")]
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl BackendError {
    /// Another writer got there first; losing such a race is not a failure
    pub fn is_contention(&self) -> bool {
        matches!(self, BackendError::AlreadyExists(_) | BackendError::Conflict(_))
    }
}

/// A linearizable store of lease descriptors keyed by (namespace, name).
///
/// `update` replaces the whole document. When the descriptor carries a
/// `version`, implementations that support conditional writes must reject
/// the update with [`BackendError::Conflict`] if the stored version differs.
#[async_trait]
pub trait LeaseBackend: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &LeaseKey) -> Result<Option<LeaseDescriptor>, BackendError>;
    async fn create(&self, lease: &LeaseDescriptor) -> Result<LeaseDescriptor, BackendError>;
    async fn update(&self, lease: &LeaseDescriptor) -> Result<LeaseDescriptor, BackendError>;
}

/// Process-local backend.
///
/// Writes to one key are serialized by the map shard lock, and every
/// successful write bumps the version, so concurrent read-modify-write
/// cycles resolve to exactly one winner. Availability and latency can be
/// changed at runtime to exercise failure paths.
#[derive(Debug, Default)]
pub struct InMemoryLeaseBackend {
    leases: DashMap<LeaseKey, LeaseDescriptor>,
    next_version: AtomicU64,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

impl InMemoryLeaseBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `Unavailable` (or succeed again)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delay every subsequent call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Overwrite a lease unconditionally, bypassing availability checks
    pub fn put(&self, mut lease: LeaseDescriptor) -> LeaseDescriptor {
        lease.version = Some(self.bump_version());
        self.leases.insert(lease.key.clone(), lease.clone());
        lease
    }

    /// Current record, bypassing availability checks
    pub fn snapshot(&self, key: &LeaseKey) -> Option<LeaseDescriptor> {
        self.leases.get(key).map(|entry| entry.clone())
    }

    fn bump_version(&self) -> String {
        (self.next_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    async fn simulate(&self) -> Result<(), BackendError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(
                "in-memory backend marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseBackend for InMemoryLeaseBackend {
    async fn get(&self, key: &LeaseKey) -> Result<Option<LeaseDescriptor>, BackendError> {
        self.simulate().await?;
        Ok(self.snapshot(key))
    }

    async fn create(&self, lease: &LeaseDescriptor) -> Result<LeaseDescriptor, BackendError> {
        self.simulate().await?;
        match self.leases.entry(lease.key.clone()) {
            Entry::Occupied(_) => Err(BackendError::AlreadyExists(lease.key.clone())),
            Entry::Vacant(slot) => {
                let mut stored = lease.clone();
                stored.version = Some(self.bump_version());
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn update(&self, lease: &LeaseDescriptor) -> Result<LeaseDescriptor, BackendError> {
        self.simulate().await?;
        let mut current = self
            .leases
            .get_mut(&lease.key)
            .ok_or_else(|| BackendError::NotFound(lease.key.clone()))?;

        if lease.version.is_some() && lease.version != current.version {
            return Err(BackendError::Conflict(lease.key.clone()));
        }

        let mut stored = lease.clone();
        stored.version = Some(self.bump_version());
        *current = stored.clone();
        Ok(stored)
    }
}
