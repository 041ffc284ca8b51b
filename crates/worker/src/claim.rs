//! Claim protocol: claim a job, account for the attempt, commit the outcome.
//!
//! Every write after the claim carries the [`ClaimToken`] observed at claim
//! time. When a write finds the row changed (`ClaimConflict`), the worker has
//! lost the job and must not write anything else for it.

use tracing::{error, warn};

use jobworker_core::{ClaimToken, Job, NewLogEntry};
use jobworker_infra::jobs::{JobStore, StoreError};

use crate::error::WorkerError;
use crate::outcome::Outcome;

pub struct ClaimProtocol<S> {
    store: S,
    queue: String,
}

impl<S> ClaimProtocol<S>
where
    S: JobStore,
{
    pub fn new(store: S, queue: impl Into<String>) -> Self {
        Self {
            store,
            queue: queue.into(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Claim the next eligible job. Store failures are transient: they are
    /// logged and reported as "no job".
    pub async fn claim(&self) -> Option<Job> {
        match self.store.claim(&self.queue).await {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "failed to claim job");
                None
            }
        }
    }

    /// Record the attempt before the handler runs.
    pub async fn begin_attempt(&self, job: &Job, token: &ClaimToken) -> Result<Job, WorkerError> {
        Ok(self.store.increment_attempts(job.id, token).await?)
    }

    /// Write the outcome: status first, then the log entry.
    ///
    /// A conflict on the status write abandons the whole outcome. Any other
    /// status failure is logged and the log entry is still appended.
    pub async fn commit(
        &self,
        job: &Job,
        token: &ClaimToken,
        outcome: &Outcome,
    ) -> Result<Job, WorkerError> {
        let status = match self
            .store
            .update_status(job.id, outcome.job_status(), token)
            .await
        {
            Err(StoreError::Conflict { id }) => {
                return Err(WorkerError::ClaimConflict { job_id: id });
            }
            other => other,
        };

        if let Err(e) = &status {
            warn!(job_id = %job.id, error = %e, "status write failed, appending log anyway");
        }

        self.store
            .insert_log(NewLogEntry {
                job_id: job.id,
                status: outcome.log_status(),
                error: outcome.error_detail(),
            })
            .await?;

        Ok(status?)
    }
}
