//! Infrastructure layer: job stores and event bus transports.

pub mod event_bus;
pub mod jobs;
