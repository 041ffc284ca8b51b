//! Postgres `LISTEN`/`NOTIFY` event bus.
//!
//! Row changes are published by the `jobworker.jobs` trigger (see the
//! migration) or explicitly through [`EventBus::publish`], which issues
//! `pg_notify` on the same channel.
//!
//! # Delivery Guarantees
//!
//! - Notifications sent before the `LISTEN` command is issued are not delivered.
//! - Notifications are lost while the listener connection is down. A lost
//!   connection ends the subscription with `ChannelError` so the worker
//!   resubscribes.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use jobworker_events::{
    BusError, EventBus, RowChange, Subscription, SubscriptionEvent, SubscriptionStatus,
};

use crate::jobs::postgres::NOTIFY_CHANNEL;

#[derive(Debug, Clone)]
pub struct PgNotifyEventBus {
    pool: Arc<PgPool>,
}

impl PgNotifyEventBus {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl EventBus for PgNotifyEventBus {
    #[tracing::instrument(skip_all, fields(job_id = %change.job_id), err)]
    async fn publish(&self, change: RowChange) -> Result<(), BusError> {
        let payload =
            serde_json::to_string(&change).map_err(|e| BusError::Serialization(e.to_string()))?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(payload)
            .execute(&*self.pool)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn subscribe(&self, queue: &str) -> Result<Subscription, BusError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        listener
            .listen(NOTIFY_CHANNEL)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = queue.to_string();
        let task = tokio::spawn(forward(listener, queue, tx));

        Ok(Subscription::with_task(rx, task))
    }
}

/// Forward notifications for `queue` until the connection drops or the
/// subscriber goes away.
async fn forward(
    mut listener: PgListener,
    queue: String,
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
) {
    loop {
        let notification = match listener.try_recv().await {
            Ok(Some(n)) => n,
            Ok(None) => {
                warn!(queue = %queue, "listener connection lost");
                let _ = tx.send(SubscriptionEvent::Status(SubscriptionStatus::ChannelError));
                return;
            }
            Err(e) => {
                warn!(queue = %queue, error = %e, "listener failed");
                let _ = tx.send(SubscriptionEvent::Status(SubscriptionStatus::ChannelError));
                return;
            }
        };

        let change: RowChange = match serde_json::from_str(notification.payload()) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "ignoring undecodable notification");
                continue;
            }
        };
        if change.queue != queue {
            continue;
        }
        if tx.send(SubscriptionEvent::Change(change)).is_err() {
            return;
        }
    }
}
