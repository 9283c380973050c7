//! Job handlers: the unit of work a scheduler trigger executes.
//!
//! Execution-level retry here is coarser than the HTTP-level retry inside
//! the fetch layer — a retried job re-runs the entire bound operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::crawl::CrawlOrchestrator;
use crate::error::AppError;
use crate::job::{HandlerKind, JobContext, JobOutcome, JobResult};
use crate::retry::BackoffPolicy;
use crate::traits::{CrawlStore, Fetcher, Parser};

/// A unit of schedulable work with lifecycle hooks for observability.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome, AppError>;

    async fn on_success(&self, _ctx: &JobContext, _outcome: &JobOutcome) {}

    async fn on_failure(&self, _ctx: &JobContext, _error: &AppError) {}

    async fn on_retry(&self, _ctx: &JobContext, _attempt: u32, _error: &AppError) {}
}

/// Job-level backoff schedule: 1, 2, 4, ... seconds, capped at 60.
fn job_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60))
}

/// Run a handler with up to `ctx.max_retries + 1` attempts.
///
/// Only transient connectivity classes are retried; between attempts the
/// capped exponential backoff applies. Always returns a [`JobResult`]
/// carrying total execution time and attempts used — errors never
/// propagate to the scheduling runtime.
pub async fn execute_with_retry(handler: &dyn JobHandler, ctx: &JobContext) -> JobResult {
    let started = Instant::now();
    let max_attempts = ctx.max_retries.saturating_add(1);
    let policy = job_backoff();
    let mut attempt: u32 = 1;

    loop {
        match handler.execute(ctx).await {
            Ok(outcome) => {
                handler.on_success(ctx, &outcome).await;
                return JobResult {
                    success: true,
                    message: outcome.message.clone(),
                    data: outcome.data,
                    error: None,
                    execution_time: started.elapsed(),
                    attempts: attempt,
                };
            }
            Err(err) => {
                if attempt < max_attempts && err.kind().is_retryable() {
                    tracing::warn!(
                        job_id = %ctx.job_id,
                        attempt,
                        error = %err,
                        "Job attempt failed, retrying"
                    );
                    handler.on_retry(ctx, attempt, &err).await;
                    tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                    attempt += 1;
                } else {
                    tracing::warn!(
                        job_id = %ctx.job_id,
                        attempts = attempt,
                        error = %err,
                        "Job failed"
                    );
                    handler.on_failure(ctx, &err).await;
                    return JobResult {
                        success: false,
                        message: format!("failed after {attempt} attempt(s)"),
                        data: None,
                        error: Some(err.to_string()),
                        execution_time: started.elapsed(),
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

/// Binds job execution to the crawl orchestrator.
///
/// The crawl task id comes from the job's data payload; the resulting
/// [`crate::models::CrawlResult`] is translated into a handler outcome,
/// preserving the failure kind for the retry predicate.
pub struct CrawlJobHandler<F, P, S>
where
    F: Fetcher + 'static,
    P: Parser + 'static,
    S: CrawlStore,
{
    orchestrator: Arc<CrawlOrchestrator<F, P, S>>,
}

impl<F, P, S> CrawlJobHandler<F, P, S>
where
    F: Fetcher + 'static,
    P: Parser + 'static,
    S: CrawlStore,
{
    pub fn new(orchestrator: Arc<CrawlOrchestrator<F, P, S>>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl<F, P, S> JobHandler for CrawlJobHandler<F, P, S>
where
    F: Fetcher + 'static,
    P: Parser + 'static,
    S: CrawlStore + 'static,
{
    fn name(&self) -> &str {
        "crawl"
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome, AppError> {
        let task_id = ctx
            .data
            .get("task_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AppError::Config(format!("job '{}' carries no task_id", ctx.job_id))
            })?;

        let result = self.orchestrator.run(task_id).await;
        if result.success {
            Ok(JobOutcome {
                message: format!(
                    "crawled {} books for task '{}'",
                    result.books_crawled, result.task_id
                ),
                data: Some(serde_json::json!({
                    "task_id": result.task_id,
                    "books_crawled": result.books_crawled,
                    "execution_time_ms": result.execution_time.as_millis() as u64,
                })),
            })
        } else {
            Err(AppError::Task {
                message: result
                    .error
                    .unwrap_or_else(|| "crawl failed without detail".into()),
                kind: result
                    .failure_kind
                    .unwrap_or(crate::error::ErrorKind::Other),
            })
        }
    }
}

/// Static factory map from handler kind to handler instance.
///
/// Jobs resolve their handler here once, at registration time.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: HandlerKind, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn resolve(&self, kind: HandlerKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;
    use crate::error::ErrorKind;

    /// Handler returning a scripted sequence of outcomes, recording hooks.
    struct ScriptedHandler {
        script: Mutex<Vec<Result<JobOutcome, AppError>>>,
        pub hooks: Mutex<Vec<String>>,
    }

    impl ScriptedHandler {
        fn new(script: Vec<Result<JobOutcome, AppError>>) -> Self {
            Self {
                script: Mutex::new(script),
                hooks: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, _ctx: &JobContext) -> Result<JobOutcome, AppError> {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(JobOutcome::default())
            } else {
                script.remove(0)
            }
        }

        async fn on_success(&self, _ctx: &JobContext, _outcome: &JobOutcome) {
            self.hooks.lock().unwrap().push("success".into());
        }

        async fn on_failure(&self, _ctx: &JobContext, _error: &AppError) {
            self.hooks.lock().unwrap().push("failure".into());
        }

        async fn on_retry(&self, _ctx: &JobContext, attempt: u32, _error: &AppError) {
            self.hooks.lock().unwrap().push(format!("retry-{attempt}"));
        }
    }

    fn ctx(max_retries: u32) -> JobContext {
        JobContext {
            job_id: "test-job".into(),
            scheduled_time: Utc::now(),
            trigger_time: Utc::now(),
            data: serde_json::Value::Null,
            max_retries,
        }
    }

    #[tokio::test]
    async fn succeeds_first_attempt() {
        let handler = ScriptedHandler::new(vec![Ok(JobOutcome {
            message: "done".into(),
            data: None,
        })]);
        let result = execute_with_retry(&handler, &ctx(3)).await;
        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.message, "done");
        assert_eq!(*handler.hooks.lock().unwrap(), vec!["success"]);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let handler = ScriptedHandler::new(vec![
            Err(AppError::Network("reset".into())),
            Err(AppError::Timeout(5)),
            Ok(JobOutcome::default()),
        ]);
        // Backoff for the first attempts is 1s/2s; tolerable in a test but
        // pause the clock to keep the suite fast.
        tokio::time::pause();
        let result = execute_with_retry(&handler, &ctx(3)).await;
        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(
            *handler.hooks.lock().unwrap(),
            vec!["retry-1", "retry-2", "success"]
        );
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let handler = ScriptedHandler::new(vec![Err(AppError::Task {
            message: "storage gone".into(),
            kind: ErrorKind::Storage,
        })]);
        let result = execute_with_retry(&handler, &ctx(5)).await;
        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(*handler.hooks.lock().unwrap(), vec!["failure"]);
    }

    #[tokio::test]
    async fn exhausts_retry_budget() {
        let handler = ScriptedHandler::new(vec![
            Err(AppError::Network("1".into())),
            Err(AppError::Network("2".into())),
            Err(AppError::Network("3".into())),
        ]);
        tokio::time::pause();
        let result = execute_with_retry(&handler, &ctx(2)).await;
        assert!(!result.success);
        assert_eq!(result.attempts, 3);
        assert!(result.error.unwrap().contains("3"));
        assert_eq!(
            *handler.hooks.lock().unwrap(),
            vec!["retry-1", "retry-2", "failure"]
        );
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let handler = ScriptedHandler::new(vec![Err(AppError::Network("reset".into()))]);
        let result = execute_with_retry(&handler, &ctx(0)).await;
        assert!(!result.success);
        assert_eq!(result.attempts, 1);
    }

    #[test]
    fn registry_resolves_registered_kind() {
        let handler: Arc<dyn JobHandler> = Arc::new(ScriptedHandler::new(vec![]));
        let registry = HandlerRegistry::new().register(HandlerKind::Crawl, handler);
        assert!(registry.resolve(HandlerKind::Crawl).is_some());
    }
}
