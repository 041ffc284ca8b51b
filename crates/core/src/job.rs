//! Job rows and their status lifecycle.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Status of a job row.
///
/// Serialized with the upper-case names the store uses (`PENDING`, `RETRY`,
/// `SUCCESS`, `ERROR`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Created by a producer, never attempted.
    Pending,
    /// Failed at least once and waiting to be claimed again.
    Retry,
    /// Handler completed.
    Success,
    /// Out of attempts (or attempt accounting failed).
    Error,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Retry => "RETRY",
            JobStatus::Success => "SUCCESS",
            JobStatus::Error => "ERROR",
        }
    }

    /// SUCCESS and ERROR accept no further claims or attempts.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }

    pub const fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retry)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            s if s.eq_ignore_ascii_case("PENDING") => Ok(JobStatus::Pending),
            s if s.eq_ignore_ascii_case("RETRY") => Ok(JobStatus::Retry),
            s if s.eq_ignore_ascii_case("SUCCESS") => Ok(JobStatus::Success),
            s if s.eq_ignore_ascii_case("ERROR") => Ok(JobStatus::Error),
            other => Err(DomainError::unknown_status(other)),
        }
    }
}

/// Per-job overrides of worker behaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Overrides the worker's default attempt ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl JobOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// The (status, claimed_at) pair observed when a job was claimed.
///
/// Every conditional write carries the token; the store applies the write
/// only while the row still holds exactly these values.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimToken {
    pub status: JobStatus,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// A job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub queue: String,
    /// Handler-defined payload, stored and returned verbatim.
    pub payload: Option<serde_json::Value>,
    pub status: JobStatus,
    pub attempts: u32,
    /// `None` means the row is not currently claimed.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Disabled rows are never claimed.
    pub enabled: bool,
    pub options: JobOptions,
}

impl Job {
    /// Materialize a freshly enqueued row.
    pub fn from_new(id: JobId, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at: now,
            updated_at: now,
            queue: new.queue,
            payload: new.payload,
            status: JobStatus::Pending,
            attempts: 0,
            claimed_at: None,
            enabled: new.enabled,
            options: new.options,
        }
    }

    pub fn is_claimable(&self) -> bool {
        self.enabled && self.claimed_at.is_none() && self.status.is_claimable()
    }

    pub fn claim_token(&self) -> ClaimToken {
        ClaimToken {
            status: self.status,
            claimed_at: self.claimed_at,
        }
    }

    /// True while the row still holds the values captured in `token`.
    pub fn matches(&self, token: &ClaimToken) -> bool {
        self.status == token.status && self.claimed_at == token.claimed_at
    }

    /// Attempt ceiling for this job: per-job override, else `default`.
    pub fn max_attempts_or(&self, default: u32) -> u32 {
        self.options.max_attempts.unwrap_or(default)
    }

    pub fn mark_claimed(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_claimable() {
            return Err(DomainError::invariant(format!(
                "job {} is not claimable (status {}, claimed: {})",
                self.id,
                self.status,
                self.claimed_at.is_some()
            )));
        }
        self.claimed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn record_attempt(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "job {} is {} and takes no further attempts",
                self.id, self.status
            )));
        }
        self.attempts = self.attempts.saturating_add(1);
        self.updated_at = now;
        Ok(())
    }

    /// Apply an outcome status. RETRY releases the claim.
    pub fn transition_to(&mut self, status: JobStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "job {} is already {}",
                self.id, self.status
            )));
        }
        if status == JobStatus::Pending {
            return Err(DomainError::invariant("a job never returns to PENDING"));
        }
        if status == JobStatus::Retry {
            self.claimed_at = None;
        }
        self.status = status;
        self.updated_at = now;
        Ok(())
    }
}

/// A job as submitted by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub queue: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub options: JobOptions,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl NewJob {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            payload: None,
            options: JobOptions::default(),
            enabled: true,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.options.max_attempts = Some(max_attempts);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.queue.trim().is_empty() {
            return Err(DomainError::validation("queue must not be empty"));
        }
        if self.options.max_attempts == Some(0) {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        Ok(())
    }
}
