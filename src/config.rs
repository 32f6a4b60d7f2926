// Election configuration and environment-derived defaults

use std::env;
use std::time::Duration;

use tracing::warn;

use crate::{Error, Result};

/// Lease name used when nothing else is configured
pub const DEFAULT_LEASE_NAME: &str = "talos-kms-leader";

/// Namespace used when nothing else is configured
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default lease duration (15 seconds)
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);

/// Default renew deadline (10 seconds)
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);

/// Default retry period (2 seconds)
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Default grace period for releasing the lease on shutdown
pub const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Immutable per-controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionConfig {
    /// Name of the lease resource
    pub name: String,

    /// Namespace the lease lives in
    pub namespace: String,

    /// Identity of this instance (usually pod name or hostname)
    pub identity: String,

    /// How long a lease stays valid after its last renewal
    pub lease_duration: Duration,

    /// Upper bound on one acquire/renew round against the backend
    pub renew_deadline: Duration,

    /// Interval between election rounds
    pub retry_period: Duration,

    /// Grace period for releasing the lease when the loop exits
    pub release_timeout: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_LEASE_NAME.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            identity: String::new(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
        }
    }
}

impl ElectionConfig {
    /// Create a configuration with default timings for the given identity
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Self::default()
        }
    }

    /// Configuration resolved from the environment, the way a pod sees it
    pub fn from_env() -> Self {
        Self {
            name: lease_name_from_env(),
            namespace: namespace_from_env(),
            identity: default_identity(),
            ..Self::default()
        }
    }

    pub fn with_lease(mut self, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self.name = name.into();
        self
    }

    pub fn with_timings(
        mut self,
        lease_duration: Duration,
        renew_deadline: Duration,
        retry_period: Duration,
    ) -> Self {
        self.lease_duration = lease_duration;
        self.renew_deadline = renew_deadline;
        self.retry_period = retry_period;
        self
    }

    pub fn with_release_timeout(mut self, release_timeout: Duration) -> Self {
        self.release_timeout = release_timeout;
        self
    }

    /// Reject configurations the election loop cannot run with.
    ///
    /// Only an empty identity and a zero retry period are fatal. A timing
    /// order other than `lease_duration > renew_deadline > retry_period`
    /// weakens failover guarantees, so it is logged instead.
    pub fn validate(&self) -> Result<()> {
        if self.identity.trim().is_empty() {
            return Err(Error::EmptyIdentity);
        }
        if self.retry_period.is_zero() {
            return Err(Error::ZeroRetryPeriod);
        }

        if self.lease_duration <= self.renew_deadline || self.renew_deadline <= self.retry_period {
            warn!(
                identity = %self.identity,
                lease_duration = ?self.lease_duration,
                renew_deadline = ?self.renew_deadline,
                retry_period = ?self.retry_period,
                "Leader election timings are not ordered lease_duration > renew_deadline > retry_period"
            );
        }
        Ok(())
    }

    /// Lease duration as stored on the lease resource, rounded up to
    /// whole seconds and never below one
    pub fn lease_duration_seconds(&self) -> i32 {
        let mut secs = self.lease_duration.as_secs();
        if self.lease_duration.subsec_nanos() > 0 {
            secs += 1;
        }
        i32::try_from(secs.max(1)).unwrap_or(i32::MAX)
    }
}

/// Identity for this instance.
///
/// Checked in order: `LEADER_ELECTION_IDENTITY`, `POD_NAME`, the hostname.
pub fn default_identity() -> String {
    if let Some(identity) = non_empty_var("LEADER_ELECTION_IDENTITY") {
        return identity;
    }
    if let Some(pod_name) = non_empty_var("POD_NAME") {
        return pod_name;
    }

    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    if hostname.is_empty() {
        "unknown".to_string()
    } else {
        hostname
    }
}

pub fn namespace_from_env() -> String {
    non_empty_var("LEADER_ELECTION_NAMESPACE")
        .or_else(|| non_empty_var("POD_NAMESPACE"))
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
}

pub fn lease_name_from_env() -> String {
    non_empty_var("LEADER_ELECTION_NAME").unwrap_or_else(|| DEFAULT_LEASE_NAME.to_string())
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}
