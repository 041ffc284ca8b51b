//! Redis pub/sub-backed event bus (optional).
//!
//! Note: Redis pub/sub is not durable (messages are dropped while a
//! subscriber is offline). Workers keep polling regardless, so a lost
//! message only delays a claim until the next tick ceiling.
//!
//! One Redis channel per queue: `<prefix>:<queue>`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use redis::Commands;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use jobworker_events::{
    BusError, EventBus, RowChange, Subscription, SubscriptionEvent, SubscriptionStatus,
};

/// How often the reader thread wakes to check whether it was released.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Redis pub/sub bus for JSON row changes.
#[derive(Debug, Clone)]
pub struct RedisPubSubEventBus {
    client: redis::Client,
    prefix: String,
}

impl RedisPubSubEventBus {
    pub fn new(redis_url: impl AsRef<str>, prefix: impl Into<String>) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BusError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }

    fn channel(&self, queue: &str) -> String {
        format!("{}:{}", self.prefix, queue)
    }
}

#[async_trait]
impl EventBus for RedisPubSubEventBus {
    async fn publish(&self, change: RowChange) -> Result<(), BusError> {
        let payload =
            serde_json::to_string(&change).map_err(|e| BusError::Serialization(e.to_string()))?;
        let client = self.client.clone();
        let channel = self.channel(&change.queue);

        tokio::task::spawn_blocking(move || {
            let mut conn = client
                .get_connection()
                .map_err(|e| BusError::Transport(e.to_string()))?;
            let _: i64 = conn
                .publish(channel.as_str(), payload)
                .map_err(|e| BusError::Transport(e.to_string()))?;
            Ok::<(), BusError>(())
        })
        .await
        .map_err(|e| BusError::Transport(e.to_string()))?
    }

    async fn subscribe(&self, queue: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let released = Arc::new(AtomicBool::new(false));

        let client = self.client.clone();
        let channel = self.channel(queue);
        let stop = Arc::clone(&released);

        // Background thread that receives pub/sub messages and forwards them.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    let _ = ready_tx.send(Err(BusError::Transport(e.to_string())));
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            let subscribed = pubsub
                .subscribe(channel.as_str())
                .and_then(|_| pubsub.set_read_timeout(Some(READ_TIMEOUT)));
            if let Err(e) = subscribed {
                let _ = ready_tx.send(Err(BusError::Transport(e.to_string())));
                return;
            }
            if ready_tx.send(Ok(())).is_err() {
                return;
            }

            while !stop.load(Ordering::SeqCst) {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(e) if e.is_timeout() => continue,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "redis subscription failed");
                        let _ = tx.send(SubscriptionEvent::Status(SubscriptionStatus::ChannelError));
                        return;
                    }
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let change: RowChange = match serde_json::from_str(&payload) {
                    Ok(c) => c,
                    Err(e) => {
                        debug!(error = %e, "ignoring undecodable message");
                        continue;
                    }
                };

                if tx.send(SubscriptionEvent::Change(change)).is_err() {
                    return;
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(Subscription::with_cancel(rx, move || {
                released.store(true, Ordering::SeqCst)
            })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BusError::Transport("redis subscriber thread exited".into())),
        }
    }
}
