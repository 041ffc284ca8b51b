//! Postgres-backed job store.
//!
//! Every state transition is a single conditional statement, so the database
//! row is the only arbiter between competing workers:
//!
//! - `claim` goes through `jobworker.dequeue`, which uses
//!   `FOR UPDATE SKIP LOCKED` to hand an eligible row to exactly one caller;
//! - `increment_attempts` and `update_status` match on the claim token
//!   (`status`, `claimed_at IS NOT DISTINCT FROM ...`). Zero affected rows is
//!   reported as `Conflict` when the row exists and `NotFound` otherwise.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (foreign key violation) | `23503` | `NotFound` (log insert for a missing job) |
//! | Database (check constraint violation) | `23514` | `Storage` |
//! | Database (other) | Any other | `Storage` |
//! | ColumnDecode / Decode | N/A | `Serialization` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use jobworker_core::{
    ClaimToken, ErrorDetail, Job, JobId, JobOptions, JobStatus, LogEntry, LogId, LogStatus, NewJob,
    NewLogEntry,
};

use super::store::{JobStore, StoreError};

/// Schema, functions and notify trigger. Idempotent.
pub const MIGRATION: &str = include_str!("../../migrations/0001_jobworker.sql");

/// Notification channel the `jobworker.jobs` trigger publishes on.
pub const NOTIFY_CHANNEL: &str = "jobworker_jobs";

const JOB_COLUMNS: &str =
    "id, created_at, updated_at, queue, payload, status, attempts, claimed_at, enabled, options";

/// Postgres job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Install (or refresh) the schema.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Resolve a zero-row conditional update into `Conflict` or `NotFound`.
    async fn conflict_or_missing(&self, id: JobId) -> StoreError {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM jobworker.jobs WHERE id = $1)",
        )
        .bind(id.get())
        .fetch_one(&*self.pool)
        .await;

        match exists {
            Ok(true) => StoreError::Conflict { id },
            Ok(false) => StoreError::NotFound(id),
            Err(e) => map_sqlx_error("conflict_or_missing", e),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(queue = %job.queue), err)]
    async fn enqueue(&self, job: NewJob) -> Result<Job, StoreError> {
        job.validate()?;
        let options = serde_json::to_value(&job.options)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let query = format!(
            "INSERT INTO jobworker.jobs (queue, payload, enabled, options) \
             VALUES ($1, $2, $3, $4) RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(&job.queue)
            .bind(&job.payload)
            .bind(job.enabled)
            .bind(options)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;

        job_from_row(&row)
    }

    #[instrument(skip(self), err)]
    async fn claim(&self, queue: &str) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobworker.dequeue($1)");
        let row = sqlx::query(&query)
            .bind(queue)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, token), fields(job_id = %id), err)]
    async fn increment_attempts(&self, id: JobId, token: &ClaimToken) -> Result<Job, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobworker.increment_attempts($1, $2, $3)");
        let row = sqlx::query(&query)
            .bind(id.get())
            .bind(token.status.as_str())
            .bind(token.claimed_at)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("increment_attempts", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.conflict_or_missing(id).await),
        }
    }

    #[instrument(skip(self, token), fields(job_id = %id, status = %status), err)]
    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        token: &ClaimToken,
    ) -> Result<Job, StoreError> {
        if status == JobStatus::Pending {
            return Err(StoreError::Invalid(jobworker_core::DomainError::invariant(
                "a job never returns to PENDING",
            )));
        }

        let query = format!(
            "UPDATE jobworker.jobs \
             SET status = $2::text, \
                 claimed_at = CASE WHEN $2::text = 'RETRY' THEN NULL ELSE claimed_at END, \
                 updated_at = now() \
             WHERE id = $1 \
               AND status = $3 \
               AND claimed_at IS NOT DISTINCT FROM $4 \
               AND status NOT IN ('SUCCESS', 'ERROR') \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(id.get())
            .bind(status.as_str())
            .bind(token.status.as_str())
            .bind(token.claimed_at)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_status", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.conflict_or_missing(id).await),
        }
    }

    #[instrument(skip(self, entry), fields(job_id = %entry.job_id, status = %entry.status), err)]
    async fn insert_log(&self, entry: NewLogEntry) -> Result<LogEntry, StoreError> {
        let job_id = entry.job_id;
        let error = entry
            .error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO jobworker.logs (job_id, status, error)
            VALUES ($1, $2, $3)
            RETURNING id, created_at, job_id, status, error
            "#,
        )
        .bind(job_id.get())
        .bind(entry.status.as_str())
        .bind(error)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| match e {
            e if is_foreign_key_violation(&e) => StoreError::NotFound(job_id),
            e => map_sqlx_error("insert_log", e),
        })?;

        log_from_row(&row)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobworker.jobs WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn logs_for(&self, id: JobId) -> Result<Vec<LogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, created_at, job_id, status, error
            FROM jobworker.logs
            WHERE job_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("logs_for", e))?;

        rows.iter().map(log_from_row).collect()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn set_enabled(&self, id: JobId, enabled: bool) -> Result<Job, StoreError> {
        let query = format!(
            "UPDATE jobworker.jobs SET enabled = $2, updated_at = now() \
             WHERE id = $1 RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(id.get())
            .bind(enabled)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_enabled", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(StoreError::NotFound(id)),
        }
    }
}

/// Raw `jobworker.jobs` row.
struct JobRow {
    id: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    queue: String,
    payload: Option<serde_json::Value>,
    status: String,
    attempts: i32,
    claimed_at: Option<DateTime<Utc>>,
    enabled: bool,
    options: serde_json::Value,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            queue: row.try_get("queue")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            claimed_at: row.try_get("claimed_at")?,
            enabled: row.try_get("enabled")?,
            options: row.try_get("options")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let options: JobOptions = serde_json::from_value(row.options)
            .map_err(|e| StoreError::Serialization(format!("job {} options: {e}", row.id)))?;
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| StoreError::Serialization(format!("job {} has negative attempts", row.id)))?;

        Ok(Job {
            id: JobId::new(row.id),
            created_at: row.created_at,
            updated_at: row.updated_at,
            queue: row.queue,
            payload: row.payload,
            status: row.status.parse()?,
            attempts,
            claimed_at: row.claimed_at,
            enabled: row.enabled,
            options,
        })
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    JobRow::from_row(row)
        .map_err(|e| StoreError::Serialization(format!("failed to decode job row: {e}")))?
        .try_into()
}

fn log_from_row(row: &PgRow) -> Result<LogEntry, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Serialization(format!("failed to decode log row: {e}"));

    let status: String = row.try_get("status").map_err(decode)?;
    let error: Option<serde_json::Value> = row.try_get("error").map_err(decode)?;
    let error = error
        .map(serde_json::from_value::<ErrorDetail>)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(LogEntry {
        id: LogId::new(row.try_get("id").map_err(decode)?),
        job_id: JobId::new(row.try_get("job_id").map_err(decode)?),
        status: status.parse::<LogStatus>()?,
        error,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23503";
        }
    }
    false
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
