//! The worker: one cooperative loop, one job in flight.
//!
//! ```text
//! NotStarted → Subscribing → Running → Stopping → Stopped
//! ```
//!
//! The loop waits for a work signal (push notification, start-up check, or
//! the tick ceiling), claims a job, runs the handler against `job_timeout`,
//! and commits the outcome. Nothing that happens to a single job can take
//! the loop down: store failures are logged and the loop carries on.

use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use jobworker_core::{Job, WorkerId};
use jobworker_events::{EventBus, SubscriptionStatus};
use jobworker_infra::jobs::JobStore;

use crate::claim::ClaimProtocol;
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::handler::JobHandler;
use crate::outcome::{JobFailure, Outcome};
use crate::retry::RetryPolicy;
use crate::schedule::{LoopAction, LoopState};
use crate::signal::WorkSignal;
use crate::subscription::SubscriptionSupervisor;

/// Lifecycle state of a worker.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WorkerState {
    NotStarted,
    Subscribing,
    Running,
    Stopping,
    Stopped,
}

impl WorkerState {
    pub fn is_stopping(&self) -> bool {
        matches!(self, WorkerState::Stopping | WorkerState::Stopped)
    }
}

impl core::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            WorkerState::NotStarted => "not_started",
            WorkerState::Subscribing => "subscribing",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        })
    }
}

/// Request a stop. Returns `false` if the worker was already stopping.
pub(crate) fn begin_stop(state: &watch::Sender<WorkerState>) -> bool {
    state.send_if_modified(|s| match s {
        WorkerState::NotStarted => {
            *s = WorkerState::Stopped;
            true
        }
        WorkerState::Subscribing | WorkerState::Running => {
            *s = WorkerState::Stopping;
            true
        }
        WorkerState::Stopping | WorkerState::Stopped => false,
    })
}

/// A queue worker.
pub struct Worker<S> {
    id: WorkerId,
    config: WorkerConfig,
    claims: ClaimProtocol<S>,
    retry: RetryPolicy,
    handler: Arc<dyn JobHandler>,
    bus: Option<Arc<dyn EventBus>>,
    signal: Arc<WorkSignal>,
    state: Arc<watch::Sender<WorkerState>>,
    subscription_status: Arc<watch::Sender<Option<SubscriptionStatus>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<S> Worker<S>
where
    S: JobStore + 'static,
{
    /// Validate `config` and build a worker. Nothing runs until [`Worker::start`].
    pub fn new(
        config: WorkerConfig,
        store: S,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        if config.max_ticks == 0 {
            warn!(
                queue = %config.queue,
                "max_ticks is 0: polling backstop disabled, jobs are only picked up on push notifications"
            );
        }

        let (state, _) = watch::channel(WorkerState::NotStarted);
        let (subscription_status, _) = watch::channel(None);

        Ok(Self {
            id: WorkerId::new(),
            claims: ClaimProtocol::new(store, config.queue.clone()),
            retry: RetryPolicy::new(config.max_attempts),
            config,
            handler,
            bus: None,
            signal: Arc::new(WorkSignal::new()),
            state: Arc::new(state),
            subscription_status: Arc::new(subscription_status),
            supervisor: Mutex::new(None),
        })
    }

    /// Push channel for row-change notifications.
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_id(mut self, id: WorkerId) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        self.claims.store()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Last reported push-channel status; `None` until a subscription was attempted.
    pub fn subscription_status(&self) -> Option<SubscriptionStatus> {
        *self.subscription_status.borrow()
    }

    /// Run the worker until it is stopped.
    ///
    /// Idempotent: calling it on a worker that has already been started (or
    /// stopped) returns immediately. Never fails; every error is logged.
    pub async fn start(self: &Arc<Self>) {
        let span = info_span!("worker", queue = %self.config.queue, worker_id = %self.id);
        self.run().instrument(span).await
    }

    /// Spawn [`Worker::start`] on the runtime.
    pub fn spawn(self: Arc<Self>) -> WorkerHandle<S> {
        let worker = Arc::clone(&self);
        let join = tokio::spawn(async move { worker.start().await });
        WorkerHandle { worker: self, join }
    }

    /// Stop claiming new jobs. A job in flight runs to completion.
    ///
    /// Idempotent. A worker that was never started goes straight to `Stopped`.
    pub fn stop(&self) {
        if !begin_stop(&self.state) {
            debug!(worker_id = %self.id, "stop ignored, worker already stopping");
            return;
        }
        info!(queue = %self.config.queue, worker_id = %self.id, "worker stopping");
        self.abort_supervisor();
    }

    async fn run(self: &Arc<Self>) {
        let began = self.state.send_if_modified(|s| {
            if *s == WorkerState::NotStarted {
                *s = WorkerState::Subscribing;
                true
            } else {
                false
            }
        });
        if !began {
            info!(state = %self.state(), "start ignored, worker already started");
            return;
        }
        info!("worker starting");

        self.subscribe().await;

        let running = self.state.send_if_modified(|s| {
            if *s == WorkerState::Subscribing {
                *s = WorkerState::Running;
                true
            } else {
                false
            }
        });

        if running {
            info!(
                max_ticks = self.config.max_ticks,
                tick_interval_ms = self.config.tick_interval.as_millis() as u64,
                "worker running"
            );
            let worker = Arc::clone(self);
            let result = tokio::spawn(
                async move { worker.run_loop().await }.instrument(Span::current()),
            )
            .await;

            if let Err(e) = result {
                error!(error = %e, "worker loop crashed");
                self.stop();
            }
        }

        self.finish();
    }

    async fn subscribe(&self) {
        if !self.config.realtime_enabled {
            debug!("realtime disabled, polling only");
            return;
        }
        let Some(bus) = self.bus.clone() else {
            warn!("realtime enabled but no event bus configured, polling only");
            return;
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let supervisor = SubscriptionSupervisor::new(
            &self.config,
            bus,
            Arc::clone(&self.signal),
            Arc::clone(&self.subscription_status),
            Arc::clone(&self.state),
        );
        let task = tokio::spawn(supervisor.run(ready_tx).instrument(Span::current()));
        if let Ok(mut slot) = self.supervisor.lock() {
            *slot = Some(task);
        }
        // stop() may have run before the handle was stored.
        if self.state().is_stopping() {
            self.abort_supervisor();
        }

        if !ready_rx.await.unwrap_or(false) {
            debug!("continuing without a live subscription");
        }
    }

    async fn run_loop(&self) {
        let mut state = self.state.subscribe();
        let mut schedule = LoopState::new(self.config.max_ticks);

        while *state.borrow_and_update() == WorkerState::Running {
            if self.signal.take() {
                schedule.signal();
            }

            match schedule.next_action() {
                LoopAction::Claim => {
                    let found = match self.claims.claim().await {
                        Some(job) => {
                            self.process(job).await;
                            true
                        }
                        None => false,
                    };
                    schedule.record_claim(found);
                }
                LoopAction::Tick => {
                    // Only a full idle interval counts toward the tick ceiling.
                    tokio::select! {
                        _ = sleep(self.config.tick_interval) => schedule.record_tick(),
                        _ = self.signal.notified() => {}
                        _ = state.changed() => {}
                    }
                }
            }
        }
    }

    async fn process(&self, job: Job) {
        let token = job.claim_token();
        debug!(job_id = %job.id, attempts = job.attempts, "claimed job");

        let outcome = match self.claims.begin_attempt(&job, &token).await {
            Ok(attempted) => match self.execute(attempted.clone()).await {
                Ok(()) => Outcome::Succeeded,
                Err(failure) => {
                    let reason = failure.to_string();
                    let outcome =
                        Outcome::after_failure(failure, self.retry.decide_for(&attempted));
                    warn!(
                        job_id = %job.id,
                        attempts = attempted.attempts,
                        max_attempts = self.retry.max_attempts_for(&attempted),
                        next = %outcome.job_status(),
                        error = %reason,
                        "job attempt failed"
                    );
                    outcome
                }
            },
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to record attempt, failing job");
                Outcome::Failed(JobFailure::attempts_unavailable(&e))
            }
        };

        match self.claims.commit(&job, &token, &outcome).await {
            Ok(committed) => info!(
                job_id = %committed.id,
                status = %committed.status,
                attempts = committed.attempts,
                "job outcome committed"
            ),
            Err(WorkerError::ClaimConflict { job_id }) => {
                warn!(job_id = %job_id, "claim lost to a concurrent writer, outcome abandoned")
            }
            Err(e) => error!(job_id = %job.id, error = %e, "failed to commit job outcome"),
        }
    }

    /// Race the handler against `job_timeout`. The handler runs on its own
    /// task and is left running if the timer wins.
    async fn execute(&self, job: Job) -> Result<(), JobFailure> {
        let handler = Arc::clone(&self.handler);
        let budget = self.config.job_timeout;
        let task = tokio::spawn(async move { handler.handle(job).await }.instrument(Span::current()));

        if budget.is_zero() {
            return Err(JobFailure::TimedOut { after: budget });
        }

        match timeout(budget, task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(JobFailure::from_handler_error(e.as_ref())),
            Ok(Err(e)) => Err(JobFailure::from_join_error(e)),
            Err(_) => Err(JobFailure::TimedOut { after: budget }),
        }
    }

    fn abort_supervisor(&self) {
        if let Ok(mut slot) = self.supervisor.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }

    fn finish(&self) {
        self.abort_supervisor();
        self.subscription_status.send_if_modified(|s| match s {
            Some(SubscriptionStatus::Subscribed) => {
                *s = Some(SubscriptionStatus::Closed);
                true
            }
            _ => false,
        });
        self.state.send_replace(WorkerState::Stopped);
        info!("worker stopped");
    }
}

/// Handle to a spawned worker.
pub struct WorkerHandle<S> {
    worker: Arc<Worker<S>>,
    join: JoinHandle<()>,
}

impl<S> WorkerHandle<S>
where
    S: JobStore + 'static,
{
    pub fn worker(&self) -> &Arc<Worker<S>> {
        &self.worker
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    /// Wait for [`Worker::start`] to return.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            error!(worker_id = %self.worker.id(), error = %e, "worker task failed");
        }
    }

    /// Request graceful shutdown and wait for it.
    pub async fn shutdown(self) {
        self.stop();
        self.join().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use jobworker_infra::jobs::InMemoryJobStore;

    use crate::handler::handler_fn;

    fn noop() -> Arc<dyn JobHandler> {
        Arc::new(handler_fn(|_job: Job| async { Ok::<(), crate::handler::HandlerError>(()) }))
    }

    #[test]
    fn invalid_config_fails_construction() {
        let config = WorkerConfig::new("q").with_tick_interval(Duration::from_millis(10));
        assert!(matches!(
            Worker::new(config, InMemoryJobStore::arc(), noop()),
            Err(WorkerError::Config(_))
        ));
    }

    #[test]
    fn stop_before_start_goes_straight_to_stopped() {
        let worker = Worker::new(WorkerConfig::new("q"), InMemoryJobStore::arc(), noop()).unwrap();
        worker.stop();
        assert_eq!(worker.state(), WorkerState::Stopped);
        worker.stop();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn start_after_stop_is_a_no_op() {
        let store = InMemoryJobStore::arc();
        let worker = Arc::new(Worker::new(WorkerConfig::new("q"), Arc::clone(&store), noop()).unwrap());
        worker.stop();
        worker.start().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(store.claim_calls(), 0);
    }

    #[test]
    fn injected_id_is_kept() {
        let id = WorkerId::new();
        let worker = Worker::new(WorkerConfig::new("q"), InMemoryJobStore::arc(), noop())
            .unwrap()
            .with_id(id);
        assert_eq!(worker.id(), id);
    }

    #[test]
    fn stop_transitions() {
        let (tx, _) = watch::channel(WorkerState::Running);
        assert!(begin_stop(&tx));
        assert_eq!(*tx.borrow(), WorkerState::Stopping);
        assert!(!begin_stop(&tx));
    }
}
