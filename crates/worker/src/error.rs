//! Worker error model.

use thiserror::Error;

use jobworker_core::JobId;
use jobworker_events::BusError;
use jobworker_infra::jobs::StoreError;

/// Invalid worker configuration. Raised at construction, never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    MissingRequired(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(key: &'static str, value: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("store operation failed: {0}")]
    Store(StoreError),

    /// A conditional write matched zero rows: another writer owns the row now.
    #[error("claim on job {job_id} was lost to a concurrent writer")]
    ClaimConflict { job_id: JobId },

    #[error("subscription failed: {0}")]
    Subscription(#[from] BusError),
}

impl From<StoreError> for WorkerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { id } => WorkerError::ClaimConflict { job_id: id },
            other => WorkerError::Store(other),
        }
    }
}
