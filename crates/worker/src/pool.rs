//! A set of workers sharing one queue.
//!
//! Workers in a pool are independent: each has its own loop and its own
//! subscription. Exclusivity comes from the store's claim, not the pool.

use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{error, info};

use jobworker_events::EventBus;
use jobworker_infra::jobs::JobStore;

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::handler::JobHandler;
use crate::worker::Worker;

pub struct WorkerPool<S> {
    workers: Vec<Arc<Worker<S>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S> Default for WorkerPool<S> {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            tasks: Vec::new(),
        }
    }
}

impl<S> WorkerPool<S>
where
    S: JobStore + Clone + 'static,
{
    /// `count` identical workers over clones of `store`.
    pub fn build(
        count: usize,
        config: WorkerConfig,
        store: S,
        handler: Arc<dyn JobHandler>,
        bus: Option<Arc<dyn EventBus>>,
    ) -> Result<Self, WorkerError> {
        let mut pool = Self::default();
        for _ in 0..count {
            let mut worker = Worker::new(config.clone(), store.clone(), Arc::clone(&handler))?;
            if let Some(bus) = &bus {
                worker = worker.with_bus(Arc::clone(bus));
            }
            pool.add(worker);
        }
        Ok(pool)
    }
}

impl<S> WorkerPool<S>
where
    S: JobStore + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, worker: Worker<S>) -> Arc<Worker<S>> {
        let worker = Arc::new(worker);
        self.workers.push(Arc::clone(&worker));
        worker
    }

    pub fn workers(&self) -> &[Arc<Worker<S>>] {
        &self.workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Spawn every worker that has not been spawned yet.
    pub fn start_all(&mut self) {
        let pending = &self.workers[self.tasks.len()..];
        if pending.is_empty() {
            return;
        }
        info!(workers = pending.len(), "starting workers");
        for worker in pending {
            let worker = Arc::clone(worker);
            self.tasks
                .push(tokio::spawn(async move { worker.start().await }));
        }
    }

    pub fn stop_all(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }

    /// Wait until every spawned worker has returned from `start`.
    pub async fn join(self) {
        for (worker, result) in self.workers.iter().zip(join_all(self.tasks).await) {
            if let Err(e) = result {
                error!(worker_id = %worker.id(), error = %e, "worker task failed");
            }
        }
    }

    pub async fn shutdown(self) {
        self.stop_all();
        self.join().await;
    }
}
