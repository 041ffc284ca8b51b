//! `jobworker-worker` — the queue worker.
//!
//! A [`Worker`] claims jobs from a [`JobStore`](jobworker_infra::jobs::JobStore),
//! runs a user [`JobHandler`] under a timeout, and commits the outcome
//! (status + log entry) conditionally on its claim. Push notifications from an
//! [`EventBus`](jobworker_events::EventBus) wake it up; a tick ceiling
//! (`max_ticks`) forces a periodic re-check when pushes go missing.

pub mod claim;
pub mod config;
pub mod error;
pub mod handler;
pub mod outcome;
pub mod pool;
pub mod retry;
pub mod schedule;
pub mod signal;
mod subscription;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use config::{SubscriptionFallback, WorkerConfig};
pub use error::{ConfigError, WorkerError};
pub use handler::{FnHandler, HandlerError, JobHandler, handler_fn};
pub use outcome::{JobFailure, Outcome};
pub use pool::WorkerPool;
pub use retry::{RetryDecision, RetryPolicy};
pub use worker::{Worker, WorkerHandle, WorkerState};
