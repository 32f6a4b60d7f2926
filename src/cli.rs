use std::net::SocketAddr;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use kms_leader::config::{
    DEFAULT_LEASE_DURATION, DEFAULT_RELEASE_TIMEOUT, DEFAULT_RENEW_DEADLINE, DEFAULT_RETRY_PERIOD,
};
use kms_leader::ElectionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Process-local store, only useful for a single instance or testing
    Memory,
    /// coordination.k8s.io/v1 Lease objects (needs the `kubernetes` feature)
    Kubernetes,
}

#[derive(Debug, Parser)]
#[command(name = "kms-elector", version, about, long_about = None)]
pub struct Cli {
    /// Address for the health, readiness and metrics endpoints
    #[arg(long, env = "KMS_HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    pub health_addr: SocketAddr,

    /// Where the lease is stored
    #[arg(long, value_enum, env = "KMS_LEASE_BACKEND", default_value_t = BackendKind::Memory)]
    pub backend: BackendKind,

    /// Name of the leader election lease [default: $LEADER_ELECTION_NAME or talos-kms-leader]
    #[arg(long)]
    pub lease_name: Option<String>,

    /// Namespace of the lease [default: $LEADER_ELECTION_NAMESPACE, $POD_NAMESPACE or default]
    #[arg(long)]
    pub lease_namespace: Option<String>,

    /// Identity of this instance [default: $LEADER_ELECTION_IDENTITY, $POD_NAME or hostname]
    #[arg(long)]
    pub identity: Option<String>,

    /// Lease duration in seconds
    #[arg(long, default_value_t = DEFAULT_LEASE_DURATION.as_secs())]
    pub lease_duration: u64,

    /// Deadline for one acquire/renew round in seconds
    #[arg(long, default_value_t = DEFAULT_RENEW_DEADLINE.as_secs())]
    pub renew_deadline: u64,

    /// Interval between election rounds in seconds
    #[arg(long, default_value_t = DEFAULT_RETRY_PERIOD.as_secs())]
    pub retry_period: u64,

    /// Upper bound on each leadership transition hook in seconds
    #[arg(long, default_value_t = 10)]
    pub callback_timeout: u64,

    /// Verbose mode (-v, -vv, -vvv)
    #[arg(short, action = ArgAction::Count)]
    pub verbosity: u8,
}

impl Cli {
    /// Flags override the environment-derived defaults
    pub fn election_config(&self) -> ElectionConfig {
        let mut config = ElectionConfig::from_env();
        if let Some(name) = &self.lease_name {
            config.name = name.clone();
        }
        if let Some(namespace) = &self.lease_namespace {
            config.namespace = namespace.clone();
        }
        if let Some(identity) = &self.identity {
            config.identity = identity.clone();
        }
        config
            .with_timings(
                Duration::from_secs(self.lease_duration),
                Duration::from_secs(self.renew_deadline),
                Duration::from_secs(self.retry_period),
            )
            .with_release_timeout(DEFAULT_RELEASE_TIMEOUT)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout)
    }

    /// Default filter directive when RUST_LOG is unset
    pub fn log_level(&self) -> &'static str {
        match self.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
