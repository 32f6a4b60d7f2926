// Leadership callbacks - hook bundles, builders and the dispatch worker

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Called when this instance becomes leader. The token is cancelled when
/// that leadership term ends.
pub type StartedLeadingFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called when this instance stops being leader
pub type StoppedLeadingFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Called when a different leader identity is observed (including self)
pub type NewLeaderFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Optional hooks invoked by the election controller on leadership changes
#[derive(Clone, Default)]
pub struct LeadershipCallbacks {
    pub on_started_leading: Option<StartedLeadingFn>,
    pub on_stopped_leading: Option<StoppedLeadingFn>,
    pub on_new_leader: Option<NewLeaderFn>,
}

impl fmt::Debug for LeadershipCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeadershipCallbacks")
            .field("on_started_leading", &self.on_started_leading.is_some())
            .field("on_stopped_leading", &self.on_stopped_leading.is_some())
            .field("on_new_leader", &self.on_new_leader.is_some())
            .finish()
    }
}

impl LeadershipCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_started_leading<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: StartedLeadingFn = Arc::new(move |ctx| f(ctx).boxed());
        self.on_started_leading = Some(callback);
        self
    }

    pub fn with_stopped_leading<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: StoppedLeadingFn = Arc::new(move || f().boxed());
        self.on_stopped_leading = Some(callback);
        self
    }

    pub fn with_new_leader<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: NewLeaderFn = Arc::new(move |identity| f(identity).boxed());
        self.on_new_leader = Some(callback);
        self
    }

    pub async fn started_leading(&self, ctx: CancellationToken) {
        if let Some(callback) = &self.on_started_leading {
            callback(ctx).await;
        }
    }

    pub async fn stopped_leading(&self) {
        if let Some(callback) = &self.on_stopped_leading {
            callback().await;
        }
    }

    pub async fn new_leader(&self, identity: String) {
        if let Some(callback) = &self.on_new_leader {
            callback(identity).await;
        }
    }
}

/// Builds callback bundles with the common logging and timeout patterns.
#[derive(Debug, Clone)]
pub struct CallbackBuilder {
    identity: String,
}

impl CallbackBuilder {
    /// `identity` is this instance's election identity, used to tell
    /// "we won" apart from "someone else won" in logs
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }

    /// Log every transition, then forward to `inner`
    pub fn build_server_callbacks(&self, inner: LeadershipCallbacks) -> LeadershipCallbacks {
        let started = inner.on_started_leading.clone();
        let stopped = inner.on_stopped_leading.clone();

        LeadershipCallbacks::new()
            .with_started_leading(move |ctx| {
                let started = started.clone();
                async move {
                    info!("Started leading - becoming active");
                    if let Some(started) = started {
                        started(ctx).await;
                    }
                }
            })
            .with_stopped_leading(move || {
                let stopped = stopped.clone();
                async move {
                    info!("Stopped leading - becoming passive");
                    if let Some(stopped) = stopped {
                        stopped().await;
                    }
                }
            })
            .with_new_leader(self.logged_new_leader(inner.on_new_leader))
    }

    /// Callbacks that only log
    pub fn build_logging_callbacks(&self) -> LeadershipCallbacks {
        LeadershipCallbacks::new()
            .with_started_leading(|_ctx| async {
                info!("Leadership acquired - this instance is now the leader");
            })
            .with_stopped_leading(|| async {
                info!("Leadership lost - this instance is no longer the leader");
            })
            .with_new_leader(self.logged_new_leader(None))
    }

    /// Wrap `inner` so each started/stopped hook gets at most `timeout`.
    ///
    /// A hook that overruns is logged and left running in the background;
    /// control returns to the caller either way. New-leader notifications
    /// are logged and forwarded without a bound.
    pub fn build_bounded_callbacks(&self, inner: LeadershipCallbacks, timeout: Duration) -> LeadershipCallbacks {
        let started = inner.on_started_leading.clone();
        let stopped = inner.on_stopped_leading.clone();

        LeadershipCallbacks::new()
            .with_started_leading(move |ctx| {
                let started = started.clone();
                async move {
                    info!("Acquired leadership - transitioning to active state");
                    if let Some(started) = started {
                        run_bounded(started(ctx), timeout, "active").await;
                    }
                }
            })
            .with_stopped_leading(move || {
                let stopped = stopped.clone();
                async move {
                    info!("Lost leadership - beginning graceful transition to passive state");
                    if let Some(stopped) = stopped {
                        run_bounded(stopped(), timeout, "passive").await;
                    }
                }
            })
            .with_new_leader(self.logged_new_leader(inner.on_new_leader))
    }

    fn logged_new_leader(
        &self,
        inner: Option<NewLeaderFn>,
    ) -> impl Fn(String) -> BoxFuture<'static, ()> + Send + Sync + 'static {
        let own_identity = self.identity.clone();
        move |identity: String| {
            let inner = inner.clone();
            let is_self = identity == own_identity;
            async move {
                info!(leader = %identity, is_self, "New leader elected");
                if let Some(inner) = inner {
                    inner(identity).await;
                }
            }
            .boxed()
        }
    }
}

/// Run `work` on its own task and wait at most `timeout` for it
async fn run_bounded(work: BoxFuture<'static, ()>, timeout: Duration, target_state: &'static str) {
    let task = tokio::spawn(work);
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(())) => info!("Successfully transitioned to {} state", target_state),
        Ok(Err(e)) => error!(error = %e, "Transition to {} state failed", target_state),
        Err(_) => error!(?timeout, "Timeout while transitioning to {} state", target_state),
    }
}

/// Leadership change queued for the dispatch workers
#[derive(Debug)]
pub(crate) enum LeadershipEvent {
    StartedLeading(CancellationToken),
    StoppedLeading,
    NewLeader(String),
}

/// Sending side of the dispatch queues.
///
/// Started/stopped events share one ordered queue; new-leader
/// notifications have their own, so a started hook that runs for the
/// whole term never holds them back.
#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    lifecycle: mpsc::UnboundedSender<LeadershipEvent>,
    leaders: mpsc::UnboundedSender<String>,
}

impl EventSender {
    /// Fails, handing the event back, once the workers are gone
    pub fn send(&self, event: LeadershipEvent) -> Result<(), LeadershipEvent> {
        match event {
            LeadershipEvent::NewLeader(identity) => self
                .leaders
                .send(identity)
                .map_err(|rejected| LeadershipEvent::NewLeader(rejected.0)),
            event => self.lifecycle.send(event).map_err(|rejected| rejected.0),
        }
    }
}

/// Join handles of the dispatch workers
#[derive(Debug)]
pub(crate) struct DispatchWorkers {
    lifecycle: JoinHandle<()>,
    leaders: JoinHandle<()>,
}

impl DispatchWorkers {
    /// Wait until both queues are drained. Close them first by dropping
    /// every [`EventSender`].
    pub async fn join(self) {
        let (lifecycle, leaders) = tokio::join!(self.lifecycle, self.leaders);
        for result in [lifecycle, leaders] {
            if let Err(e) = result {
                error!(error = %e, "Leadership callback worker failed");
            }
        }
    }
}

/// Start the workers that deliver leadership events.
///
/// The election loop only enqueues; it never waits on a callback. Each
/// queue is delivered in order by its own worker. A `StartedLeading` whose
/// term already ended by the time it is dequeued is dropped as stale.
pub(crate) fn spawn_dispatcher(callbacks: Arc<LeadershipCallbacks>) -> (EventSender, DispatchWorkers) {
    let (lifecycle_tx, mut lifecycle_rx) = mpsc::unbounded_channel::<LeadershipEvent>();
    let (leaders_tx, mut leaders_rx) = mpsc::unbounded_channel::<String>();

    let lifecycle_callbacks = callbacks.clone();
    let lifecycle = tokio::spawn(async move {
        while let Some(event) = lifecycle_rx.recv().await {
            let delivery = match event {
                LeadershipEvent::StartedLeading(term) if term.is_cancelled() => {
                    debug!("Skipping stale started-leading notification");
                    continue;
                }
                LeadershipEvent::StartedLeading(term) => lifecycle_callbacks.started_leading(term).boxed(),
                LeadershipEvent::StoppedLeading => lifecycle_callbacks.stopped_leading().boxed(),
                LeadershipEvent::NewLeader(identity) => lifecycle_callbacks.new_leader(identity).boxed(),
            };
            deliver(delivery).await;
        }
    });

    let leaders = tokio::spawn(async move {
        while let Some(identity) = leaders_rx.recv().await {
            deliver(callbacks.new_leader(identity).boxed()).await;
        }
    });

    let sender = EventSender {
        lifecycle: lifecycle_tx,
        leaders: leaders_tx,
    };
    (sender, DispatchWorkers { lifecycle, leaders })
}

async fn deliver(delivery: BoxFuture<'_, ()>) {
    if AssertUnwindSafe(delivery).catch_unwind().await.is_err() {
        error!("Leadership callback panicked");
    }
}
