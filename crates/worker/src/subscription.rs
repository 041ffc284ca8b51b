//! Push-channel supervision.
//!
//! Keeps one subscription alive for the worker's queue, turns row changes
//! into work signals, and resubscribes with a fixed delay when the channel
//! fails. Consecutive failures are counted; a healthy subscription resets the
//! count. Past `subscribe_retries` the configured fallback applies.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use jobworker_events::{EventBus, Subscription, SubscriptionEvent, SubscriptionStatus};

use crate::config::{SubscriptionFallback, WorkerConfig};
use crate::error::WorkerError;
use crate::signal::WorkSignal;
use crate::worker::{WorkerState, begin_stop};

pub(crate) struct SubscriptionSupervisor {
    bus: Arc<dyn EventBus>,
    queue: String,
    signal: Arc<WorkSignal>,
    retries: u32,
    retry_delay: Duration,
    subscribe_timeout: Duration,
    fallback: SubscriptionFallback,
    status: Arc<watch::Sender<Option<SubscriptionStatus>>>,
    state: Arc<watch::Sender<WorkerState>>,
}

impl SubscriptionSupervisor {
    pub(crate) fn new(
        config: &WorkerConfig,
        bus: Arc<dyn EventBus>,
        signal: Arc<WorkSignal>,
        status: Arc<watch::Sender<Option<SubscriptionStatus>>>,
        state: Arc<watch::Sender<WorkerState>>,
    ) -> Self {
        Self {
            bus,
            queue: config.queue.clone(),
            signal,
            retries: config.subscribe_retries,
            retry_delay: config.subscribe_retry_delay,
            subscribe_timeout: config.subscribe_timeout,
            fallback: config.on_subscription_exhausted,
            status,
            state,
        }
    }

    /// Supervise until the retry budget is spent (or the task is aborted).
    ///
    /// `ready` resolves `true` on the first successful subscription, `false`
    /// if the budget runs out before one succeeds.
    pub(crate) async fn run(self, ready: oneshot::Sender<bool>) {
        let mut ready = Some(ready);
        let mut failures: u32 = 0;

        loop {
            let status = match self.connect().await {
                Ok(mut subscription) => {
                    failures = 0;
                    self.report(SubscriptionStatus::Subscribed);
                    info!("subscribed to row changes");
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(true);
                    }
                    self.pump(&mut subscription).await
                }
                Err(status) => status,
            };

            self.report(status);
            failures = failures.saturating_add(1);

            if failures > self.retries {
                self.exhausted(failures);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(false);
                }
                return;
            }

            warn!(
                status = %status,
                failures,
                retries = self.retries,
                delay_ms = self.retry_delay.as_millis() as u64,
                "subscription failed, resubscribing"
            );
            sleep(self.retry_delay).await;
        }
    }

    async fn connect(&self) -> Result<Subscription, SubscriptionStatus> {
        match timeout(self.subscribe_timeout, self.bus.subscribe(&self.queue)).await {
            Ok(Ok(subscription)) => Ok(subscription),
            Ok(Err(e)) => {
                error!(error = %WorkerError::Subscription(e), "subscribe failed");
                Err(SubscriptionStatus::ChannelError)
            }
            Err(_) => {
                error!(
                    timeout_ms = self.subscribe_timeout.as_millis() as u64,
                    "subscribe timed out"
                );
                Err(SubscriptionStatus::TimedOut)
            }
        }
    }

    /// Forward row changes until the subscription fails. A stream ended by
    /// the transport counts as `Closed`.
    async fn pump(&self, subscription: &mut Subscription) -> SubscriptionStatus {
        while let Some(event) = subscription.next().await {
            match event {
                SubscriptionEvent::Change(change) => {
                    if change.queue != self.queue {
                        continue;
                    }
                    if !change.enabled {
                        debug!(job_id = %change.job_id, "ignoring change for disabled job");
                        continue;
                    }
                    debug!(job_id = %change.job_id, kind = ?change.kind, "row changed");
                    self.signal.raise();
                }
                SubscriptionEvent::Status(status) if status.is_failure() => return status,
                SubscriptionEvent::Status(_) => {}
            }
        }
        SubscriptionStatus::Closed
    }

    fn exhausted(&self, failures: u32) {
        match self.fallback {
            SubscriptionFallback::Stop => {
                error!(failures, "subscription retries exhausted, stopping worker");
                begin_stop(&self.state);
            }
            SubscriptionFallback::PollOnly => {
                warn!(failures, "subscription retries exhausted, continuing on polling only");
            }
        }
    }

    fn report(&self, status: SubscriptionStatus) {
        self.status.send_replace(Some(status));
    }
}
