//! User-supplied job handlers.

use std::future::Future;

use async_trait::async_trait;

use jobworker_core::Job;

/// Error returned by a handler. Its `source()` chain ends up in the log trace.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Processes one claimed job.
///
/// Handlers run on their own task. A handler that outlives the worker's
/// `job_timeout` keeps running detached; delivery is at-least-once, so
/// handlers must be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
#[derive(Debug, Clone)]
pub struct FnHandler<F>(F);

/// Build a handler from `Fn(Job) -> impl Future<Output = Result<(), HandlerError>>`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, job: Job) -> Result<(), HandlerError> {
        (self.0)(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use jobworker_core::{JobId, NewJob};

    #[tokio::test]
    async fn closures_become_handlers() {
        let handler = handler_fn(|job: Job| async move {
            if job.payload.is_some() {
                Ok(())
            } else {
                Err("payload required".into())
            }
        });

        let with = Job::from_new(
            JobId::new(1),
            NewJob::new("q").with_payload(serde_json::json!(1)),
            Utc::now(),
        );
        let without = Job::from_new(JobId::new(2), NewJob::new("q"), Utc::now());

        assert!(handler.handle(with).await.is_ok());
        assert_eq!(
            handler.handle(without).await.unwrap_err().to_string(),
            "payload required"
        );
    }
}
