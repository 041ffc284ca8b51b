//! Append-only outcome records.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{JobId, LogId};
use crate::job::JobStatus;

/// Outcome recorded for one processing attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogStatus {
    Success,
    Error,
    Retry,
}

impl LogStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Success => "SUCCESS",
            LogStatus::Error => "ERROR",
            LogStatus::Retry => "RETRY",
        }
    }

    /// The job status written alongside this outcome.
    pub const fn job_status(&self) -> JobStatus {
        match self {
            LogStatus::Success => JobStatus::Success,
            LogStatus::Error => JobStatus::Error,
            LogStatus::Retry => JobStatus::Retry,
        }
    }
}

impl core::fmt::Display for LogStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            s if s.eq_ignore_ascii_case("SUCCESS") => Ok(LogStatus::Success),
            s if s.eq_ignore_ascii_case("ERROR") => Ok(LogStatus::Error),
            s if s.eq_ignore_ascii_case("RETRY") => Ok(LogStatus::Retry),
            other => Err(DomainError::unknown_status(other)),
        }
    }
}

/// Error message plus optional trace (source chain, panic payload, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl ErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

/// A log row to append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLogEntry {
    pub job_id: JobId,
    pub status: LogStatus,
    pub error: Option<ErrorDetail>,
}

/// A stored log row. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: LogId,
    pub job_id: JobId,
    pub status: LogStatus,
    pub error: Option<ErrorDetail>,
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn from_new(id: LogId, new: NewLogEntry, now: DateTime<Utc>) -> Self {
        Self {
            id,
            job_id: new.job_id,
            status: new.status,
            error: new.error,
            created_at: now,
        }
    }
}
