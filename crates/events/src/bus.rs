//! Row-change publish/subscribe abstraction (mechanics only).
//!
//! The bus carries "a job row changed" notifications from whoever writes the
//! job table to the workers polling it. Delivery is best effort:
//!
//! - notifications may be dropped, duplicated or reordered;
//! - a subscription may end at any time (the transport reports `Closed`);
//! - workers never depend on the bus for liveness, it only shortens the time
//!   between an enqueue and the next claim.
//!
//! The store stays the source of truth. A notification only says "look
//! again", it never carries the work itself.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use jobworker_core::JobId;

/// What happened to the row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowChangeKind {
    Insert,
    Update,
}

/// A "row changed" notification for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowChange {
    pub kind: RowChangeKind,
    pub queue: String,
    pub job_id: JobId,
    /// Mirrors the row's `enabled` column at the time of the change.
    pub enabled: bool,
}

impl RowChange {
    pub fn insert(queue: impl Into<String>, job_id: JobId, enabled: bool) -> Self {
        Self {
            kind: RowChangeKind::Insert,
            queue: queue.into(),
            job_id,
            enabled,
        }
    }

    pub fn update(queue: impl Into<String>, job_id: JobId, enabled: bool) -> Self {
        Self {
            kind: RowChangeKind::Update,
            queue: queue.into(),
            job_id,
            enabled,
        }
    }
}

/// Lifecycle status of a subscription.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Subscribed,
    Closed,
    ChannelError,
    TimedOut,
}

impl SubscriptionStatus {
    /// `Closed`, `ChannelError` and `TimedOut` all end the subscription.
    pub const fn is_failure(&self) -> bool {
        !matches!(self, SubscriptionStatus::Subscribed)
    }
}

impl core::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            SubscriptionStatus::Subscribed => "SUBSCRIBED",
            SubscriptionStatus::Closed => "CLOSED",
            SubscriptionStatus::ChannelError => "CHANNEL_ERROR",
            SubscriptionStatus::TimedOut => "TIMED_OUT",
        })
    }
}

/// Item delivered on a subscription stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// The transport reports a lifecycle change.
    Status(SubscriptionStatus),
    Change(RowChange),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("bus transport error: {0}")]
    Transport(String),

    #[error("bus message could not be encoded or decoded: {0}")]
    Serialization(String),

    #[error("bus state poisoned")]
    Poisoned,
}

type CancelFn = Box<dyn FnOnce() + Send + 'static>;

/// A live subscription to row changes for one queue.
///
/// Dropping the subscription (or calling [`Subscription::unsubscribe`])
/// releases the transport resources behind it. A stream that returns `None`
/// has been closed by the transport.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<SubscriptionEvent>,
    cancel: Option<CancelFn>,
}

impl Subscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<SubscriptionEvent>) -> Self {
        Self {
            receiver,
            cancel: None,
        }
    }

    /// Run `cancel` when the subscription is released.
    pub fn with_cancel(
        receiver: mpsc::UnboundedReceiver<SubscriptionEvent>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            receiver,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Abort `task` (the forwarding task feeding `receiver`) on release.
    pub fn with_task(
        receiver: mpsc::UnboundedReceiver<SubscriptionEvent>,
        task: JoinHandle<()>,
    ) -> Self {
        Self::with_cancel(receiver, move || task.abort())
    }

    /// Wait for the next event. `None` means the stream has ended.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        self.receiver.recv().await
    }

    /// Take an already-buffered event without waiting.
    pub fn try_next(&mut self) -> Option<SubscriptionEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.receiver.close();
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("cancel", &self.cancel.is_some())
            .finish_non_exhaustive()
    }
}

/// Row-change pub/sub.
///
/// `subscribe` resolves once the transport has confirmed the subscription;
/// callers bound it with their own timeout. `publish` is best effort and is
/// typically called after the store write has committed.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, change: RowChange) -> Result<(), BusError>;

    async fn subscribe(&self, queue: &str) -> Result<Subscription, BusError>;
}

#[async_trait]
impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    async fn publish(&self, change: RowChange) -> Result<(), BusError> {
        (**self).publish(change).await
    }

    async fn subscribe(&self, queue: &str) -> Result<Subscription, BusError> {
        (**self).subscribe(queue).await
    }
}
