//! Job storage implementations.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use jobworker_core::{
    ClaimToken, DomainError, Job, JobId, JobStatus, LogEntry, LogId, NewJob, NewLogEntry,
};
use jobworker_events::{EventBus, RowChange};

/// Job store abstraction.
///
/// Every write that follows a claim is conditional on the [`ClaimToken`]
/// observed at claim time. A write whose token no longer matches the row is
/// rejected with [`StoreError::Conflict`], which is never conflated with
/// [`StoreError::NotFound`].
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new PENDING job.
    async fn enqueue(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Atomically claim at most one eligible job on `queue`.
    ///
    /// Eligible means enabled, status PENDING or RETRY, not claimed.
    async fn claim(&self, queue: &str) -> Result<Option<Job>, StoreError>;

    /// `attempts += 1` while the row still matches `token` and is not terminal.
    async fn increment_attempts(&self, id: JobId, token: &ClaimToken) -> Result<Job, StoreError>;

    /// Conditional status write. RETRY also clears `claimed_at`.
    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        token: &ClaimToken,
    ) -> Result<Job, StoreError>;

    /// Append an outcome record.
    async fn insert_log(&self, entry: NewLogEntry) -> Result<LogEntry, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Outcome records for a job, oldest first.
    async fn logs_for(&self, id: JobId) -> Result<Vec<LogEntry>, StoreError>;

    async fn set_enabled(&self, id: JobId, enabled: bool) -> Result<Job, StoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// A conditional write matched zero rows.
    #[error("job {id} was modified concurrently")]
    Conflict { id: JobId },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error(transparent)]
    Invalid(#[from] DomainError),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn enqueue(&self, job: NewJob) -> Result<Job, StoreError> {
        (**self).enqueue(job).await
    }

    async fn claim(&self, queue: &str) -> Result<Option<Job>, StoreError> {
        (**self).claim(queue).await
    }

    async fn increment_attempts(&self, id: JobId, token: &ClaimToken) -> Result<Job, StoreError> {
        (**self).increment_attempts(id, token).await
    }

    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        token: &ClaimToken,
    ) -> Result<Job, StoreError> {
        (**self).update_status(id, status, token).await
    }

    async fn insert_log(&self, entry: NewLogEntry) -> Result<LogEntry, StoreError> {
        (**self).insert_log(entry).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(id).await
    }

    async fn logs_for(&self, id: JobId) -> Result<Vec<LogEntry>, StoreError> {
        (**self).logs_for(id).await
    }

    async fn set_enabled(&self, id: JobId, enabled: bool) -> Result<Job, StoreError> {
        (**self).set_enabled(id, enabled).await
    }
}

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<JobId, Job>,
    logs: Vec<LogEntry>,
    next_job_id: i64,
    next_log_id: i64,
}

#[derive(Debug, Default)]
struct Faults {
    claims: AtomicUsize,
    increments: AtomicUsize,
    status_updates: AtomicUsize,
    log_inserts: AtomicUsize,
}

impl Faults {
    fn trip(counter: &AtomicUsize, what: &str) -> Result<(), StoreError> {
        match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => Err(StoreError::Storage(format!("injected {what} failure"))),
            Err(_) => Ok(()),
        }
    }
}

/// In-memory job store for tests/dev.
///
/// Claims are FIFO by id. A single mutex makes each operation atomic, which
/// is what the conditional-update contract needs.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
    faults: Faults,
    claim_calls: AtomicUsize,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of `claim` calls served so far (including failed ones).
    pub fn claim_calls(&self) -> usize {
        self.claim_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_claims(&self, n: usize) {
        self.faults.claims.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_increments(&self, n: usize) {
        self.faults.increments.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_status_updates(&self, n: usize) {
        self.faults.status_updates.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_log_inserts(&self, n: usize) {
        self.faults.log_inserts.store(n, Ordering::SeqCst);
    }

    /// Replace a row out of band, bypassing every check. Simulates another
    /// writer touching the row.
    pub fn overwrite(&self, job: Job) -> Result<(), StoreError> {
        self.lock()?.jobs.insert(job.id, job);
        Ok(())
    }

    pub fn jobs(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.lock()?.jobs.values().cloned().collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Storage("in-memory store lock poisoned".into()))
    }
}

fn guarded<'a>(
    state: &'a mut State,
    id: JobId,
    token: &ClaimToken,
) -> Result<&'a mut Job, StoreError> {
    let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
    if !job.matches(token) {
        return Err(StoreError::Conflict { id });
    }
    Ok(job)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<Job, StoreError> {
        job.validate()?;
        let mut state = self.lock()?;
        state.next_job_id += 1;
        let id = JobId::new(state.next_job_id);
        let job = Job::from_new(id, job, Utc::now());
        state.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn claim(&self, queue: &str) -> Result<Option<Job>, StoreError> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        Faults::trip(&self.faults.claims, "claim")?;

        let mut state = self.lock()?;
        let Some(job) = state
            .jobs
            .values_mut()
            .find(|j| j.queue == queue && j.is_claimable())
        else {
            return Ok(None);
        };

        job.mark_claimed(Utc::now())?;
        Ok(Some(job.clone()))
    }

    async fn increment_attempts(&self, id: JobId, token: &ClaimToken) -> Result<Job, StoreError> {
        Faults::trip(&self.faults.increments, "increment")?;

        let mut state = self.lock()?;
        let job = guarded(&mut state, id, token)?;
        job.record_attempt(Utc::now())
            .map_err(|_| StoreError::Conflict { id })?;
        Ok(job.clone())
    }

    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        token: &ClaimToken,
    ) -> Result<Job, StoreError> {
        Faults::trip(&self.faults.status_updates, "status update")?;

        let mut state = self.lock()?;
        let job = guarded(&mut state, id, token)?;
        job.transition_to(status, Utc::now())
            .map_err(|_| StoreError::Conflict { id })?;
        Ok(job.clone())
    }

    async fn insert_log(&self, entry: NewLogEntry) -> Result<LogEntry, StoreError> {
        Faults::trip(&self.faults.log_inserts, "log insert")?;

        let mut state = self.lock()?;
        if !state.jobs.contains_key(&entry.job_id) {
            return Err(StoreError::NotFound(entry.job_id));
        }
        state.next_log_id += 1;
        let log = LogEntry::from_new(LogId::new(state.next_log_id), entry, Utc::now());
        state.logs.push(log.clone());
        Ok(log)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn logs_for(&self, id: JobId) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self
            .lock()?
            .logs
            .iter()
            .filter(|l| l.job_id == id)
            .cloned()
            .collect())
    }

    async fn set_enabled(&self, id: JobId, enabled: bool) -> Result<Job, StoreError> {
        let mut state = self.lock()?;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.enabled = enabled;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }
}

/// Adapter that publishes row changes to an `EventBus` after a successful write.
///
/// Ordering invariant: **publish happens only after the write succeeds**.
/// Publish failures are logged and never fail the write.
pub struct PublishingJobStore<S, B> {
    store: S,
    bus: B,
}

impl<S, B> PublishingJobStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }
}

impl<S, B> PublishingJobStore<S, B>
where
    B: EventBus,
{
    async fn announce(&self, change: RowChange) {
        let job_id = change.job_id;
        if let Err(e) = self.bus.publish(change).await {
            warn!(job_id = %job_id, error = %e, "row change publish failed");
        }
    }
}

#[async_trait]
impl<S, B> JobStore for PublishingJobStore<S, B>
where
    S: JobStore,
    B: EventBus,
{
    async fn enqueue(&self, job: NewJob) -> Result<Job, StoreError> {
        let job = self.store.enqueue(job).await?;
        self.announce(RowChange::insert(job.queue.clone(), job.id, job.enabled))
            .await;
        Ok(job)
    }

    async fn claim(&self, queue: &str) -> Result<Option<Job>, StoreError> {
        self.store.claim(queue).await
    }

    async fn increment_attempts(&self, id: JobId, token: &ClaimToken) -> Result<Job, StoreError> {
        self.store.increment_attempts(id, token).await
    }

    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        token: &ClaimToken,
    ) -> Result<Job, StoreError> {
        let job = self.store.update_status(id, status, token).await?;
        self.announce(RowChange::update(job.queue.clone(), job.id, job.enabled))
            .await;
        Ok(job)
    }

    async fn insert_log(&self, entry: NewLogEntry) -> Result<LogEntry, StoreError> {
        self.store.insert_log(entry).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.store.get(id).await
    }

    async fn logs_for(&self, id: JobId) -> Result<Vec<LogEntry>, StoreError> {
        self.store.logs_for(id).await
    }

    async fn set_enabled(&self, id: JobId, enabled: bool) -> Result<Job, StoreError> {
        let job = self.store.set_enabled(id, enabled).await?;
        self.announce(RowChange::update(job.queue.clone(), job.id, job.enabled))
            .await;
        Ok(job)
    }
}
