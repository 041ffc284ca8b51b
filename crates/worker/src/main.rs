use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use jobworker_core::Job;
use jobworker_events::EventBus;
use jobworker_infra::event_bus::PgNotifyEventBus;
use jobworker_infra::jobs::PostgresJobStore;
use jobworker_worker::{HandlerError, JobHandler, WorkerConfig, WorkerPool, handler_fn};

const DATABASE_URL: &str = "DATABASE_URL";
const WORKERS: &str = "JOBWORKER_WORKERS";
const MIGRATE: &str = "JOBWORKER_MIGRATE";
#[cfg(feature = "redis")]
const REDIS_URL: &str = "REDIS_URL";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobworker_observability::init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    let database_url = std::env::var(DATABASE_URL).with_context(|| format!("{DATABASE_URL} must be set"))?;
    let workers = match std::env::var(WORKERS) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid {WORKERS}: {raw:?}"))?,
        Err(_) => 1,
    };

    let pool = PgPoolOptions::new()
        .max_connections(max_connections(workers))
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresJobStore::new(pool.clone());
    if std::env::var(MIGRATE).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true")) {
        store.migrate().await.context("migration failed")?;
        tracing::info!("schema migrated");
    }

    let bus = event_bus(pool)?;
    let handler: Arc<dyn JobHandler> = Arc::new(handler_fn(|job: Job| async move {
        let payload = job
            .payload
            .as_ref()
            .map(serde_json::Value::to_string)
            .unwrap_or_default();
        tracing::info!(job_id = %job.id, attempts = job.attempts, payload = %payload, "processing job");
        Ok::<(), HandlerError>(())
    }));

    let mut workers = WorkerPool::build(workers, config, store, handler, Some(bus))?;
    workers.start_all();
    tracing::info!(workers = workers.len(), "jobworker started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");
    workers.shutdown().await;

    Ok(())
}

/// One connection per worker plus headroom for listeners and the migration.
fn max_connections(workers: usize) -> u32 {
    u32::try_from(workers).unwrap_or(u32::MAX).saturating_add(4)
}

#[cfg(not(feature = "redis"))]
fn event_bus(pool: sqlx::PgPool) -> anyhow::Result<Arc<dyn EventBus>> {
    Ok(Arc::new(PgNotifyEventBus::new(pool)))
}

#[cfg(feature = "redis")]
fn event_bus(pool: sqlx::PgPool) -> anyhow::Result<Arc<dyn EventBus>> {
    match std::env::var(REDIS_URL) {
        Ok(url) => {
            let bus = jobworker_infra::event_bus::RedisPubSubEventBus::new(url, "jobworker")
                .context("failed to create Redis event bus")?;
            tracing::info!("using Redis pub/sub for row changes");
            Ok(Arc::new(bus))
        }
        Err(_) => Ok(Arc::new(PgNotifyEventBus::new(pool))),
    }
}
