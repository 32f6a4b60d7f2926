// Leadership gate - admits seal/unseal requests only on the active leader

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::election::{CallbackBuilder, ElectionController, LeadershipCallbacks};
use crate::Result;

/// Whether this instance has finished becoming active.
///
/// Holding the lease and being ready to serve are separate facts: the flag
/// is raised when the become-leader hook starts and lowered the moment the
/// lose-leadership hook runs.
#[derive(Debug, Clone, Default)]
pub struct ActivationFlag(Arc<RwLock<bool>>);

impl ActivationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&self) {
        *self.0.write() = true;
    }

    pub fn deactivate(&self) {
        *self.0.write() = false;
    }

    pub fn is_active(&self) -> bool {
        *self.0.read()
    }

    /// Callbacks that flip this flag around `inner`.
    ///
    /// `inner` is wrapped by [`CallbackBuilder::build_bounded_callbacks`]
    /// first, so slow activation work never delays the flag itself.
    pub fn gate_callbacks(
        &self,
        builder: &CallbackBuilder,
        inner: LeadershipCallbacks,
        timeout: Duration,
    ) -> LeadershipCallbacks {
        let bounded = builder.build_bounded_callbacks(inner, timeout);
        let started = bounded.on_started_leading.clone();
        let stopped = bounded.on_stopped_leading.clone();
        let (on_start, on_stop) = (self.clone(), self.clone());

        LeadershipCallbacks {
            on_new_leader: bounded.on_new_leader,
            ..LeadershipCallbacks::new()
        }
        .with_started_leading(move |ctx| {
            let started = started.clone();
            let flag = on_start.clone();
            async move {
                flag.activate();
                info!("Became leader - KMS service is now active");
                if let Some(started) = started {
                    started(ctx).await;
                }
            }
        })
        .with_stopped_leading(move || {
            let stopped = stopped.clone();
            let flag = on_stop.clone();
            async move {
                flag.deactivate();
                info!("Lost leadership - KMS service is now passive");
                if let Some(stopped) = stopped {
                    stopped().await;
                }
            }
        })
    }
}

/// Read-only view combining election state with the activation flag
#[derive(Debug, Clone)]
pub struct LeadershipStatus {
    controller: ElectionController,
    activation: ActivationFlag,
}

impl LeadershipStatus {
    pub fn new(controller: ElectionController, activation: ActivationFlag) -> Self {
        Self { controller, activation }
    }

    /// Running, leading and active. Never blocks on the election loop.
    pub fn admit(&self) -> bool {
        self.controller.is_leading() && self.activation.is_active()
    }

    pub fn current_leader(&self) -> Option<String> {
        self.controller.current_leader()
    }

    pub fn controller(&self) -> &ElectionController {
        &self.controller
    }

    pub fn info(&self) -> LeadershipInfo {
        let metrics = self.controller.metrics();
        LeadershipInfo {
            is_leader: metrics.is_leader,
            is_active: self.activation.is_active(),
            current_leader: metrics.current_leader,
            leadership_changes: metrics.leadership_changes,
            acquisition_errors: metrics.acquisition_errors,
            renewal_errors: metrics.renewal_errors,
            last_leader_change: metrics.last_transition_time,
        }
    }

    /// Rejection to hand back when [`admit`](Self::admit) said no
    fn rejection<E>(&self, operation: GatedOperation) -> GateError<E> {
        match self.current_leader() {
            Some(leader) => GateError::NotLeader { operation, leader },
            None => GateError::NoLeader { operation },
        }
    }
}

/// Leadership snapshot served by the introspection endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadershipInfo {
    pub is_leader: bool,
    pub is_active: bool,
    pub current_leader: Option<String>,
    pub leadership_changes: u64,
    pub acquisition_errors: u64,
    pub renewal_errors: u64,
    pub last_leader_change: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatedOperation {
    Seal,
    Unseal,
}

impl GatedOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatedOperation::Seal => "seal",
            GatedOperation::Unseal => "unseal",
        }
    }
}

impl fmt::Display for GatedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reason a request was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    NotLeader,
    NoLeader,
}

impl RejectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionKind::NotLeader => "not_leader",
            RejectionKind::NoLeader => "no_leader",
        }
    }
}

#[derive(Error, Debug)]
pub enum GateError<E> {
    #[error("{operation} rejected: not the leader, current leader is {leader}")]
    NotLeader { operation: GatedOperation, leader: String },

    #[error("{operation} rejected: no leader elected, service unavailable")]
    NoLeader { operation: GatedOperation },

    #[error("{0}")]
    Service(E),
}

impl<E> GateError<E> {
    /// `None` when the error came from the wrapped service
    pub fn kind(&self) -> Option<RejectionKind> {
        match self {
            GateError::NotLeader { .. } => Some(RejectionKind::NotLeader),
            GateError::NoLeader { .. } => Some(RejectionKind::NoLeader),
            GateError::Service(_) => None,
        }
    }

    /// Redirect target for the caller, if one is known
    pub fn leader_identity(&self) -> Option<&str> {
        match self {
            GateError::NotLeader { leader, .. } => Some(leader),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KmsRequest {
    pub node_uuid: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KmsResponse {
    pub data: Vec<u8>,
}

/// The seal/unseal operations a KMS backend exposes
#[async_trait]
pub trait KmsService: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn seal(&self, request: KmsRequest) -> std::result::Result<KmsResponse, Self::Error>;

    async fn unseal(&self, request: KmsRequest) -> std::result::Result<KmsResponse, Self::Error>;
}

/// Wraps a [`KmsService`] so only the active leader serves it.
///
/// Admitted calls are forwarded unchanged and their results returned
/// verbatim; everything else gets a [`GateError`] rejection.
#[derive(Debug)]
pub struct LeadershipGate<S> {
    service: S,
    status: LeadershipStatus,
}

impl<S: KmsService> LeadershipGate<S> {
    pub fn new(service: S, controller: ElectionController, activation: ActivationFlag) -> Self {
        Self {
            service,
            status: LeadershipStatus::new(controller, activation),
        }
    }

    pub fn status(&self) -> &LeadershipStatus {
        &self.status
    }

    pub fn admit(&self) -> bool {
        self.status.admit()
    }

    pub fn start(&self, ctx: &CancellationToken) -> Result<()> {
        info!("Starting leader-aware KMS service");
        self.status.controller.start(ctx)
    }

    /// Drop admission immediately, then stop the election loop
    pub async fn shutdown(&self) {
        info!("Stopping leader-aware KMS service");
        self.status.activation.deactivate();
        self.status.controller.stop().await;
    }

    fn check(&self, operation: GatedOperation) -> std::result::Result<(), GateError<S::Error>> {
        if self.status.admit() {
            debug!(%operation, "Processing request as leader");
            return Ok(());
        }
        let rejection = self.status.rejection(operation);
        debug!(%operation, error = %rejection, "Rejecting request");
        Err(rejection)
    }
}

#[async_trait]
impl<S: KmsService> KmsService for LeadershipGate<S> {
    type Error = GateError<S::Error>;

    async fn seal(&self, request: KmsRequest) -> std::result::Result<KmsResponse, Self::Error> {
        self.check(GatedOperation::Seal)?;
        self.service.seal(request).await.map_err(GateError::Service)
    }

    async fn unseal(&self, request: KmsRequest) -> std::result::Result<KmsResponse, Self::Error> {
        self.check(GatedOperation::Unseal)?;
        self.service.unseal(request).await.map_err(GateError::Service)
    }
}
