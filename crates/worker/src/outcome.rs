//! Attempt failures and the outcome written for them.

use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;

use jobworker_core::{ErrorDetail, JobStatus, LogStatus};

use crate::retry::RetryDecision;

/// Why an attempt failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobFailure {
    #[error("{message}")]
    Handler {
        message: String,
        trace: Option<String>,
    },

    #[error("job timed out after {}ms", .after.as_millis())]
    TimedOut { after: Duration },

    #[error("handler panicked: {message}")]
    Panicked { message: String },

    /// Attempt accounting failed before the handler ran.
    #[error("could not record attempt: {message}")]
    AttemptsUnavailable { message: String },
}

impl JobFailure {
    /// Message plus the `source()` chain, one `caused by:` line per link.
    pub fn from_handler_error(err: &(dyn StdError + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {cause}"));
            source = cause.source();
        }

        JobFailure::Handler {
            message: err.to_string(),
            trace: (!chain.is_empty()).then(|| chain.join("\n")),
        }
    }

    pub fn from_join_error(err: JoinError) -> Self {
        if !err.is_panic() {
            return JobFailure::Panicked {
                message: err.to_string(),
            };
        }

        let payload = err.into_panic();
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        JobFailure::Panicked { message }
    }

    pub fn attempts_unavailable(err: &dyn core::fmt::Display) -> Self {
        JobFailure::AttemptsUnavailable {
            message: err.to_string(),
        }
    }

    /// Failures that never get another attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, JobFailure::AttemptsUnavailable { .. })
    }

    pub fn detail(&self) -> ErrorDetail {
        let detail = ErrorDetail::new(self.to_string());
        match self {
            JobFailure::Handler {
                trace: Some(trace), ..
            } => detail.with_trace(trace.clone()),
            _ => detail,
        }
    }
}

/// The result of one processing attempt, as committed to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Retrying(JobFailure),
    Failed(JobFailure),
}

impl Outcome {
    pub fn after_failure(failure: JobFailure, decision: RetryDecision) -> Self {
        match decision {
            RetryDecision::Retry if !failure.is_fatal() => Outcome::Retrying(failure),
            _ => Outcome::Failed(failure),
        }
    }

    pub fn job_status(&self) -> JobStatus {
        self.log_status().job_status()
    }

    pub fn log_status(&self) -> LogStatus {
        match self {
            Outcome::Succeeded => LogStatus::Success,
            Outcome::Retrying(_) => LogStatus::Retry,
            Outcome::Failed(_) => LogStatus::Error,
        }
    }

    /// Only terminal failures carry detail into the log.
    pub fn error_detail(&self) -> Option<ErrorDetail> {
        match self {
            Outcome::Failed(failure) => Some(failure.detail()),
            _ => None,
        }
    }
}
