// Election controller - the periodic election loop and its lifecycle

use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::callbacks::{spawn_dispatcher, DispatchWorkers, EventSender, LeadershipCallbacks, LeadershipEvent};
use super::state::{ElectionMetrics, ElectionState};
use crate::lease::{LeaseBackend, LeaseDescriptor, LeaseManager};
use crate::{ElectionConfig, Error, Result};

/// Runs leader election for one instance.
///
/// Cheap to clone; clones share the same loop and state. The loop is the
/// only writer of the leadership state and never holds the state lock
/// across a backend call.
#[derive(Clone)]
pub struct ElectionController {
    config: Arc<ElectionConfig>,
    lease_manager: Arc<LeaseManager>,
    callbacks: Arc<LeadershipCallbacks>,
    state: Arc<RwLock<ElectionState>>,
    runtime: Arc<Mutex<Option<LoopHandle>>>,
}

/// Present from `start` until the loop task has fully exited
struct LoopHandle {
    stop: CancellationToken,
    /// Cancelled when the loop task finishes, panics included
    exited: CancellationToken,
    /// Taken by the first `stop` caller, which then awaits it
    task: Option<JoinHandle<()>>,
}

/// Per-run bookkeeping owned by the loop task
struct LoopContext {
    shutdown: CancellationToken,
    events: EventSender,
    term: Option<CancellationToken>,
}

impl LoopContext {
    fn notify(&self, event: LeadershipEvent) {
        if self.events.send(event).is_err() {
            warn!("Leadership callback dispatcher is gone, dropping notification");
        }
    }

    fn begin_term(&mut self) {
        let term = self.shutdown.child_token();
        self.term = Some(term.clone());
        self.notify(LeadershipEvent::StartedLeading(term));
    }

    fn end_term(&mut self) {
        if let Some(term) = self.term.take() {
            term.cancel();
        }
        self.notify(LeadershipEvent::StoppedLeading);
    }
}

impl std::fmt::Debug for ElectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectionController")
            .field("identity", &self.config.identity)
            .field("lease", self.lease_manager.key())
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl ElectionController {
    /// Validates `config` (non-empty identity, non-zero retry period)
    pub fn new(
        config: ElectionConfig,
        backend: Arc<dyn LeaseBackend>,
        callbacks: LeadershipCallbacks,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let lease_manager = Arc::new(LeaseManager::new(config.clone(), backend)?);

        Ok(Self {
            config,
            lease_manager,
            callbacks: Arc::new(callbacks),
            state: Arc::new(RwLock::new(ElectionState::default())),
            runtime: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Launch the election loop and return immediately.
    ///
    /// Cancelling `ctx` stops the loop just like [`stop`](Self::stop) does,
    /// including the release of a held lease.
    pub fn start(&self, ctx: &CancellationToken) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if let Some(handle) = runtime.as_ref() {
            if !handle.exited.is_cancelled() {
                return Err(Error::AlreadyRunning);
            }
        }

        info!(
            identity = %self.config.identity,
            lease = %self.config.name,
            namespace = %self.config.namespace,
            "Starting leader election"
        );

        let stop = ctx.child_token();
        let exited = CancellationToken::new();
        let exit_guard = exited.clone().drop_guard();
        let election = self.clone();
        let shutdown = stop.clone();

        self.state.write().running = true;
        let task = tokio::spawn(async move {
            let _exit_guard = exit_guard;
            election.run(shutdown).await;
        });
        *runtime = Some(LoopHandle {
            stop,
            exited,
            task: Some(task),
        });
        Ok(())
    }

    /// Signal the loop to exit and wait until it has released leadership.
    ///
    /// Safe to call repeatedly, concurrently or before `start`. Until the
    /// loop has exited, `start` keeps failing with `AlreadyRunning`.
    pub async fn stop(&self) {
        let (stop, exited, task) = {
            let mut runtime = self.runtime.lock();
            let Some(handle) = runtime.as_mut() else {
                return;
            };
            (handle.stop.clone(), handle.exited.clone(), handle.task.take())
        };

        stop.cancel();
        match task {
            Some(task) => {
                info!(identity = %self.config.identity, "Stopping leader election");
                if let Err(e) = task.await {
                    error!(identity = %self.config.identity, error = %e, "Election loop terminated abnormally");
                    let mut state = self.state.write();
                    state.step_down(Utc::now());
                    state.running = false;
                }
            }
            // another caller is already waiting on the task
            None => exited.cancelled().await,
        }

        let mut runtime = self.runtime.lock();
        if runtime.as_ref().is_some_and(|handle| handle.exited.is_cancelled()) {
            *runtime = None;
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.read().running
    }

    pub fn is_leader(&self) -> bool {
        self.state.read().is_leader
    }

    /// Running and leading, read under a single lock
    pub fn is_leading(&self) -> bool {
        let state = self.state.read();
        state.running && state.is_leader
    }

    /// Identity of the last observed lease holder, if any
    pub fn current_leader(&self) -> Option<String> {
        self.state.read().current_leader.clone()
    }

    pub fn metrics(&self) -> ElectionMetrics {
        self.state.read().metrics()
    }

    async fn run(self, shutdown: CancellationToken) {
        let (events, dispatcher) = spawn_dispatcher(self.callbacks.clone());
        let mut ctx = LoopContext {
            shutdown: shutdown.clone(),
            events,
            term: None,
        };

        let mut ticker = tokio::time::interval(self.config.retry_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = self.run_round(&mut ctx) => {}
            }
        }

        info!(identity = %self.config.identity, "Election loop exiting");
        self.release_on_exit(ctx, dispatcher).await;
    }

    /// One acquire-or-renew attempt followed by a read of the lease
    async fn run_round(&self, ctx: &mut LoopContext) {
        let deadline = self.config.renew_deadline;

        let acquired = timeout(deadline, self.lease_manager.try_acquire())
            .await
            .unwrap_or(Err(Error::Timeout(deadline)));

        let acquired = match acquired {
            Ok(acquired) => acquired,
            Err(e) => {
                self.handle_round_error(&e, ctx);
                return;
            }
        };

        // A second read tells us whose write actually landed.
        let lease = timeout(deadline, self.lease_manager.get_info())
            .await
            .unwrap_or(Err(Error::Timeout(deadline)));

        match lease {
            Ok(lease) => self.apply_round(acquired, &lease, ctx),
            Err(e) => {
                error!(identity = %self.config.identity, error = %e, "Failed to get lease info");
            }
        }
    }

    fn handle_round_error(&self, err: &Error, ctx: &mut LoopContext) {
        let stepped_down = {
            let mut state = self.state.write();
            state.record_attempt_error();
            state.step_down(Utc::now())
        };

        error!(identity = %self.config.identity, error = %err, "Failed to acquire/renew lease");

        if stepped_down {
            warn!(
                identity = %self.config.identity,
                "Stepping down from leadership due to lease renewal failure"
            );
            ctx.end_term();
        }
    }

    fn apply_round(&self, acquired: bool, lease: &LeaseDescriptor, ctx: &mut LoopContext) {
        let is_leader = acquired && lease.is_held_by(&self.config.identity);
        let current_leader = lease.holder().map(str::to_string);

        let (transition, was_leader) = {
            let mut state = self.state.write();
            let was_leader = state.is_leader;
            (state.observe(is_leader, current_leader.clone(), Utc::now()), was_leader)
        };

        if transition.became_leader || transition.lost_leadership || transition.leader_changed {
            info!(
                identity = %self.config.identity,
                was_leader,
                is_leader,
                current_leader = ?current_leader,
                transitions = lease.lease_transitions,
                "Leadership state changed"
            );
        }

        if transition.became_leader {
            info!(
                identity = %self.config.identity,
                transitions = lease.lease_transitions,
                "Became leader"
            );
            ctx.begin_term();
        }

        if transition.lost_leadership {
            info!(
                identity = %self.config.identity,
                current_leader = ?current_leader,
                "Lost leadership"
            );
            ctx.end_term();
        }

        if transition.leader_changed {
            if let Some(leader) = current_leader {
                ctx.notify(LeadershipEvent::NewLeader(leader));
            }
        }
    }

    async fn release_on_exit(&self, mut ctx: LoopContext, dispatcher: DispatchWorkers) {
        let was_leader = {
            let mut state = self.state.write();
            let was_leader = state.step_down(Utc::now());
            state.running = false;
            was_leader
        };

        if was_leader {
            info!(identity = %self.config.identity, "Releasing leadership on exit");

            match timeout(self.config.release_timeout, self.lease_manager.release()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(identity = %self.config.identity, error = %e, "Failed to release lease on exit");
                }
                Err(_) => {
                    error!(
                        identity = %self.config.identity,
                        timeout = ?self.config.release_timeout,
                        "Timed out releasing lease on exit"
                    );
                }
            }

            ctx.end_term();
        }

        // Closing the queue lets the dispatcher drain and finish.
        drop(ctx);
        if timeout(self.config.release_timeout, dispatcher.join()).await.is_err() {
            warn!(
                identity = %self.config.identity,
                "Leadership callbacks still running after shutdown grace period"
            );
        }

        info!(identity = %self.config.identity, "Leader election stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::{InMemoryLeaseBackend, LeaseKey};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_config(identity: &str) -> ElectionConfig {
        ElectionConfig::new(identity)
            .with_lease("default", "test-lease")
            .with_timings(Duration::from_secs(2), Duration::from_millis(500), Duration::from_millis(20))
            .with_release_timeout(Duration::from_secs(1))
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[test]
    fn test_new_rejects_empty_identity() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let err = ElectionController::new(ElectionConfig::default(), backend, LeadershipCallbacks::new())
            .unwrap_err();
        assert!(matches!(err, Error::EmptyIdentity));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let controller =
            ElectionController::new(fast_config("a"), backend, LeadershipCallbacks::new()).unwrap();
        let ctx = CancellationToken::new();

        controller.start(&ctx).unwrap();
        assert!(matches!(controller.start(&ctx), Err(Error::AlreadyRunning)));

        controller.stop().await;
        controller.stop().await;
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn test_single_instance_becomes_leader_and_releases() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let (s1, s2) = (started.clone(), stopped.clone());

        let callbacks = LeadershipCallbacks::new()
            .with_started_leading(move |_| {
                let s = s1.clone();
                async move {
                    s.fetch_add(1, Ordering::SeqCst);
                }
            })
            .with_stopped_leading(move || {
                let s = s2.clone();
                async move {
                    s.fetch_add(1, Ordering::SeqCst);
                }
            });

        let controller = ElectionController::new(fast_config("a"), backend.clone(), callbacks).unwrap();
        controller.start(&CancellationToken::new()).unwrap();

        wait_for(|| controller.is_leader()).await;
        wait_for(|| started.load(Ordering::SeqCst) == 1).await;
        assert_eq!(controller.current_leader().as_deref(), Some("a"));
        assert_eq!(controller.metrics().leadership_changes, 1);

        controller.stop().await;
        assert!(!controller.is_leader());
        assert_eq!(stopped.load(Ordering::SeqCst), 1);

        let lease = backend.snapshot(&LeaseKey::new("default", "test-lease")).unwrap();
        assert_eq!(lease.holder(), None);
    }

    #[tokio::test]
    async fn test_step_down_on_renewal_failure() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let stopped = Arc::new(AtomicUsize::new(0));
        let s = stopped.clone();
        let callbacks = LeadershipCallbacks::new().with_stopped_leading(move || {
            let s = s.clone();
            async move {
                s.fetch_add(1, Ordering::SeqCst);
            }
        });

        let controller = ElectionController::new(fast_config("a"), backend.clone(), callbacks).unwrap();
        controller.start(&CancellationToken::new()).unwrap();
        wait_for(|| controller.is_leader()).await;

        backend.set_available(false);
        wait_for(|| !controller.is_leader()).await;
        wait_for(|| stopped.load(Ordering::SeqCst) == 1).await;

        let metrics = controller.metrics();
        assert!(metrics.acquisition_errors >= 1);
        assert!(metrics.current_leader.is_none());

        // further failures while following do not fire the hook again
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(controller.metrics().renewal_errors >= 1);

        controller.stop().await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_renew_deadline_overrun_steps_down() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let stopped = Arc::new(AtomicUsize::new(0));
        let s = stopped.clone();
        let callbacks = LeadershipCallbacks::new().with_stopped_leading(move || {
            let s = s.clone();
            async move {
                s.fetch_add(1, Ordering::SeqCst);
            }
        });

        let config = fast_config("a").with_timings(
            Duration::from_secs(2),
            Duration::from_millis(100),
            Duration::from_millis(20),
        );
        let controller = ElectionController::new(config, backend.clone(), callbacks).unwrap();
        controller.start(&CancellationToken::new()).unwrap();
        wait_for(|| controller.is_leader()).await;

        // every backend call now outlives the renew deadline
        backend.set_latency(Duration::from_millis(300));
        wait_for(|| !controller.is_leader()).await;
        wait_for(|| stopped.load(Ordering::SeqCst) == 1).await;

        let metrics = controller.metrics();
        assert_eq!(metrics.acquisition_errors, 1);
        assert!(metrics.current_leader.is_none());

        // the lease was neither released nor taken over
        let lease = backend.snapshot(&LeaseKey::new("default", "test-lease")).unwrap();
        assert_eq!(lease.holder(), Some("a"));

        controller.stop().await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_fails_while_stop_in_progress() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let controller =
            ElectionController::new(fast_config("a"), backend.clone(), LeadershipCallbacks::new()).unwrap();
        let ctx = CancellationToken::new();

        controller.start(&ctx).unwrap();
        wait_for(|| controller.is_leader()).await;

        // releasing now takes two slow backend calls
        backend.set_latency(Duration::from_millis(100));
        let stopping = tokio::spawn({
            let controller = controller.clone();
            async move { controller.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(controller.start(&ctx), Err(Error::AlreadyRunning)));

        // a second stop waits for the first one to finish
        controller.stop().await;
        assert!(!controller.is_running());
        stopping.await.unwrap();

        let lease = backend.snapshot(&LeaseKey::new("default", "test-lease")).unwrap();
        assert_eq!(lease.holder(), None);

        backend.set_latency(Duration::ZERO);
        controller.start(&ctx).unwrap();
        wait_for(|| controller.is_leader()).await;
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_loop() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let controller =
            ElectionController::new(fast_config("a"), backend.clone(), LeadershipCallbacks::new()).unwrap();
        let ctx = CancellationToken::new();

        controller.start(&ctx).unwrap();
        wait_for(|| controller.is_leader()).await;

        ctx.cancel();
        wait_for(|| !controller.is_running()).await;
        assert!(!controller.is_leader());

        let lease = backend.snapshot(&LeaseKey::new("default", "test-lease")).unwrap();
        assert_eq!(lease.holder(), None);
    }

    #[tokio::test]
    async fn test_hung_backend_does_not_block_stop() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let controller =
            ElectionController::new(fast_config("a"), backend.clone(), LeadershipCallbacks::new()).unwrap();

        backend.set_latency(Duration::from_secs(30));
        controller.start(&CancellationToken::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopped = timeout(Duration::from_secs(2), controller.stop()).await;
        assert!(stopped.is_ok());
        assert!(!controller.is_running());
    }
}
