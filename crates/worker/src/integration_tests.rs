//! End-to-end worker behaviour over the in-memory store and bus.
//!
//! Every test runs on a paused clock: timers fire as soon as the runtime is
//! idle, so tick intervals and timeouts cost nothing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::{sleep, timeout};

use jobworker_core::{ErrorDetail, Job, JobId, JobStatus, LogStatus, NewJob};
use jobworker_events::{EventBus, InMemoryEventBus, SubscriptionStatus};
use jobworker_infra::jobs::{InMemoryJobStore, JobStore, PublishingJobStore};

use crate::config::{SubscriptionFallback, WorkerConfig};
use crate::handler::{HandlerError, JobHandler, handler_fn};
use crate::pool::WorkerPool;
use crate::worker::{Worker, WorkerHandle, WorkerState};

const QUEUE: &str = "emails";

type Publishing = PublishingJobStore<Arc<InMemoryJobStore>, Arc<InMemoryEventBus>>;

fn config() -> WorkerConfig {
    WorkerConfig::new(QUEUE)
        .with_tick_interval(Duration::from_millis(100))
        .with_job_timeout(Duration::from_secs(1))
        .with_subscribe_retry_delay(Duration::from_millis(100))
        .with_subscribe_timeout(Duration::from_millis(500))
        .with_realtime(false)
}

fn realtime() -> WorkerConfig {
    config().with_realtime(true)
}

fn spawn<S: JobStore + 'static>(worker: Worker<S>) -> WorkerHandle<S> {
    Arc::new(worker).spawn()
}

/// Fails the first `failures` calls, then succeeds.
fn flaky(failures: usize, calls: Arc<AtomicUsize>) -> Arc<dyn JobHandler> {
    Arc::new(handler_fn(move |_job: Job| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            let result: Result<(), HandlerError> = if n < failures {
                Err(format!("attempt {} failed", n + 1).into())
            } else {
                Ok(())
            };
            result
        }
    }))
}

fn succeeding(calls: Arc<AtomicUsize>) -> Arc<dyn JobHandler> {
    flaky(0, calls)
}

#[derive(Debug, thiserror::Error)]
#[error("smtp rejected message")]
struct Rejected(#[source] std::io::Error);

async fn wait_for_status(store: &InMemoryJobStore, id: JobId, status: JobStatus) -> Job {
    for _ in 0..3_000 {
        if let Some(job) = store.get(id).await.unwrap() {
            if job.status == status {
                return job;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never reached {status}");
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    for _ in 0..3_000 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn log_statuses(store: &InMemoryJobStore, id: JobId) -> Vec<LogStatus> {
    store
        .logs_for(id)
        .await
        .unwrap()
        .iter()
        .map(|l| l.status)
        .collect()
}

fn publishing(store: &Arc<InMemoryJobStore>, bus: &Arc<InMemoryEventBus>) -> Arc<Publishing> {
    Arc::new(PublishingJobStore::new(Arc::clone(store), Arc::clone(bus)))
}

fn dyn_bus(bus: &Arc<InMemoryEventBus>) -> Arc<dyn EventBus> {
    Arc::clone(bus) as Arc<dyn EventBus>
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_until_success() {
    let store = InMemoryJobStore::arc();
    let job = store.enqueue(NewJob::new(QUEUE)).await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let handle = spawn(Worker::new(config(), Arc::clone(&store), flaky(2, Arc::clone(&calls))).unwrap());
    let done = wait_for_status(&store, job.id, JobStatus::Success).await;
    handle.shutdown().await;

    assert_eq!(done.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        log_statuses(&store, job.id).await,
        [LogStatus::Retry, LogStatus::Retry, LogStatus::Success]
    );
    assert!(store
        .logs_for(job.id)
        .await
        .unwrap()
        .iter()
        .all(|l| l.error.is_none()));
}

#[tokio::test(start_paused = true)]
async fn persistent_failure_ends_in_error_after_job_override() {
    let store = InMemoryJobStore::arc();
    let job = store
        .enqueue(NewJob::new(QUEUE).with_max_attempts(2))
        .await
        .unwrap();
    let handler: Arc<dyn JobHandler> = Arc::new(handler_fn(|_job: Job| async {
        let result: Result<(), HandlerError> =
            Err(Box::new(Rejected(std::io::Error::other("mailbox full"))));
        result
    }));

    let handle = spawn(Worker::new(config().with_max_attempts(5), Arc::clone(&store), handler).unwrap());
    let done = wait_for_status(&store, job.id, JobStatus::Error).await;
    handle.shutdown().await;

    assert_eq!(done.attempts, 2);
    let logs = store.logs_for(job.id).await.unwrap();
    assert_eq!(
        logs.iter().map(|l| l.status).collect::<Vec<_>>(),
        [LogStatus::Retry, LogStatus::Error]
    );
    assert!(logs[0].error.is_none());
    assert_eq!(
        logs[1].error,
        Some(ErrorDetail::new("smtp rejected message").with_trace("caused by: mailbox full"))
    );
}

#[tokio::test(start_paused = true)]
async fn pool_processes_each_job_exactly_once() {
    let store = InMemoryJobStore::arc();
    let mut ids = Vec::new();
    for n in 0..20 {
        let job = store
            .enqueue(NewJob::new(QUEUE).with_payload(json!({ "n": n })))
            .await
            .unwrap();
        ids.push(job.id);
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let handler: Arc<dyn JobHandler> = Arc::new(handler_fn(move |job: Job| {
        recorder.lock().unwrap().push(job.id);
        async {
            sleep(Duration::from_millis(5)).await;
            let result: Result<(), HandlerError> = Ok(());
            result
        }
    }));

    let mut pool = WorkerPool::build(4, config(), Arc::clone(&store), handler, None).unwrap();
    pool.start_all();
    for id in &ids {
        wait_for_status(&store, *id, JobStatus::Success).await;
    }
    pool.shutdown().await;

    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, ids);
    for id in ids {
        assert_eq!(log_statuses(&store, id).await, [LogStatus::Success]);
    }
}

#[tokio::test(start_paused = true)]
async fn slow_handler_times_out() {
    let store = InMemoryJobStore::arc();
    let job = store
        .enqueue(NewJob::new(QUEUE).with_max_attempts(1))
        .await
        .unwrap();
    let handler: Arc<dyn JobHandler> = Arc::new(handler_fn(|_job: Job| async {
        sleep(Duration::from_secs(10)).await;
        let result: Result<(), HandlerError> = Ok(());
        result
    }));

    let handle = spawn(Worker::new(config(), Arc::clone(&store), handler).unwrap());
    wait_for_status(&store, job.id, JobStatus::Error).await;
    handle.shutdown().await;

    let logs = store.logs_for(job.id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(
        logs[0].error.as_ref().map(|e| e.message.as_str()),
        Some("job timed out after 1000ms")
    );
}

#[tokio::test(start_paused = true)]
async fn handler_sees_the_enqueued_payload() {
    let store = InMemoryJobStore::arc();
    let payload = json!({ "to": "ops@example.com", "tags": ["a", "b"], "retry": null });
    let job = store
        .enqueue(NewJob::new(QUEUE).with_payload(payload.clone()))
        .await
        .unwrap();

    let received: Arc<Mutex<Option<Option<Value>>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&received);
    let handler: Arc<dyn JobHandler> = Arc::new(handler_fn(move |job: Job| {
        *slot.lock().unwrap() = Some(job.payload);
        async {
            let result: Result<(), HandlerError> = Ok(());
            result
        }
    }));

    let handle = spawn(Worker::new(config(), Arc::clone(&store), handler).unwrap());
    wait_for_status(&store, job.id, JobStatus::Success).await;
    handle.shutdown().await;

    assert_eq!(*received.lock().unwrap(), Some(Some(payload)));
}

#[tokio::test(start_paused = true)]
async fn without_ticks_or_pushes_nothing_is_claimed_after_startup() {
    let store = InMemoryJobStore::arc();
    let bus = Arc::new(InMemoryEventBus::new());
    bus.set_muted(true);
    let calls = Arc::new(AtomicUsize::new(0));

    let worker = Worker::new(realtime().with_max_ticks(0), Arc::clone(&store), succeeding(Arc::clone(&calls)))
        .unwrap()
        .with_bus(dyn_bus(&bus));
    let handle = spawn(worker);
    wait_until("start-up check", || store.claim_calls() == 1).await;

    let job = publishing(&store, &bus)
        .enqueue(NewJob::new(QUEUE))
        .await
        .unwrap();
    sleep(Duration::from_secs(30)).await;

    assert_eq!(store.claim_calls(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        store.get(job.id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn push_notification_wakes_an_idle_worker() {
    let store = InMemoryJobStore::arc();
    let bus = Arc::new(InMemoryEventBus::new());
    let writer = publishing(&store, &bus);

    let worker = Worker::new(realtime().with_max_ticks(0), Arc::clone(&writer), succeeding(Arc::new(AtomicUsize::new(0))))
        .unwrap()
        .with_bus(dyn_bus(&bus));
    let handle = spawn(worker);
    wait_until("start-up check", || store.claim_calls() == 1).await;

    let job = writer.enqueue(NewJob::new(QUEUE)).await.unwrap();
    wait_for_status(&store, job.id, JobStatus::Success).await;
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disabled_jobs_wait_until_enabled() {
    let store = InMemoryJobStore::arc();
    let bus = Arc::new(InMemoryEventBus::new());
    let writer = publishing(&store, &bus);
    let calls = Arc::new(AtomicUsize::new(0));

    let worker = Worker::new(realtime().with_max_ticks(0), Arc::clone(&writer), succeeding(Arc::clone(&calls)))
        .unwrap()
        .with_bus(dyn_bus(&bus));
    let handle = spawn(worker);
    wait_until("start-up check", || store.claim_calls() == 1).await;

    let job = writer.enqueue(NewJob::new(QUEUE).disabled()).await.unwrap();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(store.claim_calls(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    writer.set_enabled(job.id, true).await.unwrap();
    wait_for_status(&store, job.id, JobStatus::Success).await;
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_subscription_stops_the_worker() {
    let store = InMemoryJobStore::arc();
    let bus = Arc::new(InMemoryEventBus::new());
    bus.fail_next_subscribes(100);

    let worker = Arc::new(
        Worker::new(realtime().with_subscribe_retries(2), Arc::clone(&store), succeeding(Arc::new(AtomicUsize::new(0))))
            .unwrap()
            .with_bus(dyn_bus(&bus)),
    );

    timeout(Duration::from_secs(60), worker.start())
        .await
        .expect("start returns once retries are exhausted");

    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(bus.subscribe_calls(), 3);
    assert_eq!(store.claim_calls(), 0);
    assert_eq!(
        worker.subscription_status(),
        Some(SubscriptionStatus::ChannelError)
    );
}

#[tokio::test(start_paused = true)]
async fn subscribe_timeout_is_retried() {
    let store = InMemoryJobStore::arc();
    let bus = Arc::new(InMemoryEventBus::new());
    bus.hang_next_subscribes(1);
    let writer = publishing(&store, &bus);

    let worker = Worker::new(realtime().with_max_ticks(0), Arc::clone(&writer), succeeding(Arc::new(AtomicUsize::new(0))))
        .unwrap()
        .with_bus(dyn_bus(&bus));
    let handle = spawn(worker);
    wait_until("running", || handle.worker().state() == WorkerState::Running).await;

    assert_eq!(bus.subscribe_calls(), 2);
    assert_eq!(
        handle.worker().subscription_status(),
        Some(SubscriptionStatus::Subscribed)
    );

    wait_until("start-up check", || store.claim_calls() == 1).await;
    let job = writer.enqueue(NewJob::new(QUEUE)).await.unwrap();
    wait_for_status(&store, job.id, JobStatus::Success).await;
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn poll_only_fallback_keeps_working_on_ticks() {
    let store = InMemoryJobStore::arc();
    let bus = Arc::new(InMemoryEventBus::new());
    bus.fail_next_subscribes(100);

    let config = realtime()
        .with_subscribe_retries(1)
        .with_subscription_fallback(SubscriptionFallback::PollOnly)
        .with_max_ticks(2);
    let worker = Worker::new(config, Arc::clone(&store), succeeding(Arc::new(AtomicUsize::new(0))))
        .unwrap()
        .with_bus(dyn_bus(&bus));
    let handle = spawn(worker);
    wait_until("running", || handle.worker().state() == WorkerState::Running).await;
    assert_eq!(bus.subscribe_calls(), 2);

    let job = store.enqueue(NewJob::new(QUEUE)).await.unwrap();
    wait_for_status(&store, job.id, JobStatus::Success).await;
    assert_eq!(handle.worker().state(), WorkerState::Running);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn closed_subscription_is_replaced() {
    let store = InMemoryJobStore::arc();
    let bus = Arc::new(InMemoryEventBus::new());
    let writer = publishing(&store, &bus);

    let worker = Worker::new(realtime().with_max_ticks(0), Arc::clone(&writer), succeeding(Arc::new(AtomicUsize::new(0))))
        .unwrap()
        .with_bus(dyn_bus(&bus));
    let handle = spawn(worker);
    wait_until("running", || handle.worker().state() == WorkerState::Running).await;

    bus.close_all();
    wait_until("resubscribe", || {
        bus.subscribe_calls() == 2
            && handle.worker().subscription_status() == Some(SubscriptionStatus::Subscribed)
    })
    .await;

    let job = writer.enqueue(NewJob::new(QUEUE)).await.unwrap();
    wait_for_status(&store, job.id, JobStatus::Success).await;
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn start_and_stop_are_idempotent() {
    let store = InMemoryJobStore::arc();
    let handle = spawn(Worker::new(config(), Arc::clone(&store), succeeding(Arc::new(AtomicUsize::new(0)))).unwrap());
    wait_until("running", || handle.worker().state() == WorkerState::Running).await;

    let worker = Arc::clone(handle.worker());
    timeout(Duration::from_secs(1), worker.start())
        .await
        .expect("second start returns immediately");
    assert_eq!(worker.state(), WorkerState::Running);

    worker.stop();
    worker.stop();
    handle.join().await;
    assert_eq!(worker.state(), WorkerState::Stopped);

    worker.start().await;
    worker.stop();
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn stop_lets_the_job_in_flight_finish() {
    let store = InMemoryJobStore::arc();
    let job = store.enqueue(NewJob::new(QUEUE)).await.unwrap();
    let started = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&started);
    let handler: Arc<dyn JobHandler> = Arc::new(handler_fn(move |_job: Job| {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
            sleep(Duration::from_secs(2)).await;
            let result: Result<(), HandlerError> = Ok(());
            result
        }
    }));

    let handle = spawn(
        Worker::new(config().with_job_timeout(Duration::from_secs(5)), Arc::clone(&store), handler).unwrap(),
    );
    wait_until("handler to start", || started.load(Ordering::SeqCst) == 1).await;
    handle.shutdown().await;

    let job = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(log_statuses(&store, job.id).await, [LogStatus::Success]);
}

#[tokio::test(start_paused = true)]
async fn attempt_accounting_failure_fails_the_job_without_running_it() {
    let store = InMemoryJobStore::arc();
    let job = store.enqueue(NewJob::new(QUEUE)).await.unwrap();
    store.fail_next_increments(1);
    let calls = Arc::new(AtomicUsize::new(0));

    let handle = spawn(Worker::new(config(), Arc::clone(&store), succeeding(Arc::clone(&calls))).unwrap());
    let done = wait_for_status(&store, job.id, JobStatus::Error).await;
    handle.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(done.attempts, 0);
    let logs = store.logs_for(job.id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert!(logs[0]
        .error
        .as_ref()
        .is_some_and(|e| e.message.starts_with("could not record attempt")));
}

#[tokio::test(start_paused = true)]
async fn lost_claim_abandons_the_outcome() {
    let store = InMemoryJobStore::arc();
    let job = store.enqueue(NewJob::new(QUEUE)).await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let rows = Arc::clone(&store);
    let handler: Arc<dyn JobHandler> = Arc::new(handler_fn(move |job: Job| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            // Another writer releases the row while the handler runs.
            let mut row = rows
                .jobs()
                .unwrap()
                .into_iter()
                .find(|j| j.id == job.id)
                .unwrap();
            row.claimed_at = None;
            rows.overwrite(row).unwrap();
        }
        async {
            let result: Result<(), HandlerError> = Ok(());
            result
        }
    }));

    let handle = spawn(Worker::new(config(), Arc::clone(&store), handler).unwrap());
    let done = wait_for_status(&store, job.id, JobStatus::Success).await;
    handle.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(done.attempts, 2);
    assert_eq!(log_statuses(&store, job.id).await, [LogStatus::Success]);
}

#[tokio::test(start_paused = true)]
async fn handler_panic_is_recorded_as_failure() {
    let store = InMemoryJobStore::arc();
    let job = store
        .enqueue(NewJob::new(QUEUE).with_max_attempts(1))
        .await
        .unwrap();
    let handler: Arc<dyn JobHandler> = Arc::new(handler_fn(|_job: Job| async {
        if true {
            panic!("template missing");
        }
        let result: Result<(), HandlerError> = Ok(());
        result
    }));

    let handle = spawn(Worker::new(config(), Arc::clone(&store), handler).unwrap());
    wait_for_status(&store, job.id, JobStatus::Error).await;
    assert_eq!(handle.worker().state(), WorkerState::Running);
    handle.shutdown().await;

    let logs = store.logs_for(job.id).await.unwrap();
    assert_eq!(
        logs[0].error.as_ref().map(|e| e.message.as_str()),
        Some("handler panicked: template missing")
    );
}

#[tokio::test(start_paused = true)]
async fn claim_failures_are_transient() {
    let store = InMemoryJobStore::arc();
    let job = store.enqueue(NewJob::new(QUEUE)).await.unwrap();
    store.fail_next_claims(1);

    let handle = spawn(
        Worker::new(config().with_max_ticks(1), Arc::clone(&store), succeeding(Arc::new(AtomicUsize::new(0)))).unwrap(),
    );
    wait_for_status(&store, job.id, JobStatus::Success).await;
    handle.shutdown().await;

    assert!(store.claim_calls() >= 2);
}

#[tokio::test(start_paused = true)]
async fn status_write_failure_still_appends_the_log() {
    let store = InMemoryJobStore::arc();
    let job = store.enqueue(NewJob::new(QUEUE)).await.unwrap();
    store.fail_next_status_updates(1);

    let handle = spawn(Worker::new(config(), Arc::clone(&store), succeeding(Arc::new(AtomicUsize::new(0)))).unwrap());
    for _ in 0..3_000 {
        if !store.logs_for(job.id).await.unwrap().is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    handle.shutdown().await;

    assert_eq!(log_statuses(&store, job.id).await, [LogStatus::Success]);
    let row = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Pending);
    assert!(row.claimed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn timed_out_attempts_are_retried() {
    let store = InMemoryJobStore::arc();
    let job = store.enqueue(NewJob::new(QUEUE)).await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handler: Arc<dyn JobHandler> = Arc::new(handler_fn(move |_job: Job| {
        let slow = counter.fetch_add(1, Ordering::SeqCst) < 2;
        async move {
            if slow {
                sleep(Duration::from_secs(10)).await;
            }
            let result: Result<(), HandlerError> = Ok(());
            result
        }
    }));

    let handle = spawn(Worker::new(config(), Arc::clone(&store), handler).unwrap());
    let done = wait_for_status(&store, job.id, JobStatus::Success).await;
    handle.shutdown().await;

    assert_eq!(done.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        log_statuses(&store, job.id).await,
        [LogStatus::Retry, LogStatus::Retry, LogStatus::Success]
    );
}

#[tokio::test(start_paused = true)]
async fn healthy_subscription_resets_the_failure_count() {
    let store = InMemoryJobStore::arc();
    let bus = Arc::new(InMemoryEventBus::new());
    let writer = publishing(&store, &bus);

    let worker = Worker::new(
        realtime().with_subscribe_retries(1).with_max_ticks(0),
        Arc::clone(&writer),
        succeeding(Arc::new(AtomicUsize::new(0))),
    )
    .unwrap()
    .with_bus(dyn_bus(&bus));
    let handle = spawn(worker);

    let failures = [
        SubscriptionStatus::ChannelError,
        SubscriptionStatus::TimedOut,
        SubscriptionStatus::ChannelError,
        SubscriptionStatus::TimedOut,
    ];
    for (n, status) in failures.into_iter().enumerate() {
        wait_until("live subscription", || {
            bus.subscribe_calls() == n + 1
                && handle.worker().subscription_status() == Some(SubscriptionStatus::Subscribed)
        })
        .await;
        bus.inject_status(status);
    }
    wait_until("resubscribe after the last failure", || {
        bus.subscribe_calls() == failures.len() + 1
            && handle.worker().subscription_status() == Some(SubscriptionStatus::Subscribed)
    })
    .await;
    assert_eq!(handle.worker().state(), WorkerState::Running);

    let job = writer.enqueue(NewJob::new(QUEUE)).await.unwrap();
    wait_for_status(&store, job.id, JobStatus::Success).await;
    handle.shutdown().await;
}
