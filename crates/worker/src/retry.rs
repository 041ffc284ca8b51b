//! Retry policy: pure attempt accounting.

use jobworker_core::Job;

use crate::config::DEFAULT_MAX_ATTEMPTS;

/// What to do with a job whose attempt just failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Release the claim and let the job be picked up again.
    Retry,
    /// Give up: the job becomes ERROR.
    Fail,
}

/// Retry policy configuration.
///
/// `attempts` is the number of attempts already made, including the one
/// that just failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Default attempt ceiling for jobs without an override.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    pub fn decide(attempts: u32, max_attempts: u32) -> RetryDecision {
        if attempts < max_attempts {
            RetryDecision::Retry
        } else {
            RetryDecision::Fail
        }
    }

    /// The job's own ceiling when it has one, else the default.
    pub fn max_attempts_for(&self, job: &Job) -> u32 {
        job.max_attempts_or(self.max_attempts)
    }

    pub fn decide_for(&self, job: &Job) -> RetryDecision {
        Self::decide(job.attempts, self.max_attempts_for(job))
    }
}
