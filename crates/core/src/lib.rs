//! `jobworker-core` — job queue building blocks.
//!
//! This crate contains **pure** types (no store, no transport, no async).

pub mod error;
pub mod id;
pub mod job;
pub mod log;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, LogId, WorkerId};
pub use job::{ClaimToken, Job, JobOptions, JobStatus, NewJob};
pub use log::{ErrorDetail, LogEntry, LogStatus, NewLogEntry};
