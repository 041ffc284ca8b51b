//! `jobworker-events` — row-change notifications between job writers and workers.

pub mod bus;
pub mod in_memory_bus;

pub use bus::{
    BusError, EventBus, RowChange, RowChangeKind, Subscription, SubscriptionEvent,
    SubscriptionStatus,
};
pub use in_memory_bus::InMemoryEventBus;
