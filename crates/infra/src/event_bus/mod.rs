//! Infrastructure event bus implementations.
//!
//! The event bus abstraction lives in `jobworker-events` as pure mechanics.
//! This module provides infrastructure-backed implementations (Postgres
//! `LISTEN`/`NOTIFY`, and Redis pub/sub behind the `redis` feature).

pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis_pubsub;

pub use postgres::PgNotifyEventBus;
#[cfg(feature = "redis")]
pub use redis_pubsub::RedisPubSubEventBus;
