//! In-memory event bus for tests/dev.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::{BusError, EventBus, RowChange, Subscription, SubscriptionEvent, SubscriptionStatus};

#[derive(Debug)]
struct Subscriber {
    queue: String,
    sender: mpsc::UnboundedSender<SubscriptionEvent>,
}

/// In-memory pub/sub bus.
///
/// - Fan-out to every live subscriber of the change's queue
/// - Dead subscribers are dropped while publishing
/// - Fault injection hooks for exercising subscription supervision
#[derive(Debug, Default)]
pub struct InMemoryEventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    failing_subscribes: AtomicUsize,
    hanging_subscribes: AtomicUsize,
    subscribe_calls: AtomicUsize,
    muted: AtomicBool,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls to `subscribe` fail with a transport error.
    pub fn fail_next_subscribes(&self, n: usize) {
        self.failing_subscribes.store(n, Ordering::SeqCst);
    }

    /// The next `n` calls to `subscribe` never resolve.
    pub fn hang_next_subscribes(&self, n: usize) {
        self.hanging_subscribes.store(n, Ordering::SeqCst);
    }

    /// While muted, published changes are silently dropped.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    /// Deliver a status event to every live subscriber.
    pub fn inject_status(&self, status: SubscriptionStatus) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|s| s.sender.send(SubscriptionEvent::Status(status)).is_ok());
        }
    }

    /// End every live subscription stream.
    pub fn close_all(&self) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.clear();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|mut subs| {
                subs.retain(|s| !s.sender.is_closed());
                subs.len()
            })
            .unwrap_or(0)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, change: RowChange) -> Result<(), BusError> {
        if self.muted.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut subs = self.subscribers.lock().map_err(|_| BusError::Poisoned)?;

        // Drop any dead subscribers while publishing.
        subs.retain(|s| {
            if s.queue != change.queue {
                return !s.sender.is_closed();
            }
            s.sender
                .send(SubscriptionEvent::Change(change.clone()))
                .is_ok()
        });

        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Subscription, BusError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        if Self::take_one(&self.hanging_subscribes) {
            std::future::pending::<()>().await;
        }
        if Self::take_one(&self.failing_subscribes) {
            return Err(BusError::Transport("injected subscribe failure".into()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .map_err(|_| BusError::Poisoned)?
            .push(Subscriber {
                queue: queue.to_string(),
                sender,
            });

        Ok(Subscription::new(receiver))
    }
}
