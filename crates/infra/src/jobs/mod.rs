//! Job persistence: the store contract and its adapters.
//!
//! ## Components
//!
//! - `JobStore`: claim / attempt / outcome operations, all conditional on a claim token
//! - `InMemoryJobStore`: single-process store for tests and dev
//! - `PublishingJobStore`: wraps a store and announces row changes on an `EventBus`
//! - `PostgresJobStore`: durable store backed by the `jobworker` schema

pub mod postgres;
pub mod store;

pub use postgres::{MIGRATION, NOTIFY_CHANNEL, PostgresJobStore};
pub use store::{InMemoryJobStore, JobStore, PublishingJobStore, StoreError};
