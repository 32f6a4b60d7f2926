// Lease descriptor - the record the backend stores per (namespace, name)

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies a lease resource in the backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseKey {
    pub namespace: String,
    pub name: String,
}

impl LeaseKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Snapshot of a lease as stored in the backend.
///
/// At most one holder is recorded at a time. The backend cannot stop two
/// well-meaning writers from racing unless it honours `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseDescriptor {
    /// Which lease this is
    pub key: LeaseKey,

    /// Current holder, if any
    pub holder_identity: Option<String>,

    /// Validity window after each renewal, in whole seconds
    pub lease_duration_seconds: Option<i32>,

    /// When the current holder first acquired the lease
    pub acquire_time: Option<DateTime<Utc>>,

    /// When the current holder last renewed the lease
    pub renew_time: Option<DateTime<Utc>>,

    /// Number of times the holder identity has changed
    pub lease_transitions: u32,

    /// Opaque token for conditional updates; `None` means unconditional
    pub version: Option<String>,
}

impl LeaseDescriptor {
    /// A freshly created lease held by `identity`
    pub fn held_by(key: LeaseKey, identity: &str, lease_duration_seconds: i32, now: DateTime<Utc>) -> Self {
        Self {
            key,
            holder_identity: Some(identity.to_string()),
            lease_duration_seconds: Some(lease_duration_seconds),
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: 0,
            version: None,
        }
    }

    /// Whether `identity` is the recorded holder
    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder_identity.as_deref() == Some(identity)
    }

    /// Recorded holder, treating an empty string as no holder
    pub fn holder(&self) -> Option<&str> {
        self.holder_identity.as_deref().filter(|holder| !holder.is_empty())
    }

    pub fn lease_duration(&self) -> Option<Duration> {
        self.lease_duration_seconds
            .map(|secs| Duration::from_secs(u64::try_from(secs).unwrap_or(0)))
    }

    /// When the lease lapses, falling back to `default_duration` if the
    /// record carries no duration of its own
    pub fn expires_at(&self, default_duration: Duration) -> Option<DateTime<Utc>> {
        let duration = self.lease_duration().unwrap_or(default_duration);
        let duration = chrono::Duration::from_std(duration).ok()?;
        self.renew_time.map(|renewed| renewed + duration)
    }

    /// Expired means strictly past `renew_time + duration`
    pub fn is_expired(&self, now: DateTime<Utc>, default_duration: Duration) -> bool {
        match self.expires_at(default_duration) {
            Some(expiry) => now > expiry,
            None => true,
        }
    }

    /// Drop holder and timestamps, keeping duration and transition count
    pub fn clear_holder(&mut self) {
        self.holder_identity = None;
        self.acquire_time = None;
        self.renew_time = None;
    }
}
