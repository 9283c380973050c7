//! Durable job scheduling: trigger timers, instance limits, execution
//! history, and batch aggregation.
//!
//! Each registered job runs its own timer task; fires dispatch the bound
//! handler through `execute_with_retry` on a shared task tracker so
//! shutdown can wait for in-flight executions. The durable store is
//! written before a job counts as registered and is reloaded on start,
//! so schedules survive process restarts.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::error::AppError;
use crate::handler::{HandlerRegistry, JobHandler, execute_with_retry};
use crate::job::{JobConfig, JobContext, JobExecutionRecord, JobStatus, TriggerSpec};
use crate::job_store::JobStore;

/// Poll interval while a job is paused at its fire time.
const PAUSE_POLL: Duration = Duration::from_millis(500);

/// Executions kept in memory per job.
const HISTORY_LIMIT: usize = 50;

/// Scheduler state snapshot for the observability surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub job_count: usize,
    pub running_jobs: usize,
    pub paused_jobs: usize,
    #[serde(skip)]
    pub uptime: Duration,
}

/// Aggregate execution counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct SchedulerMetrics {
    pub total_executions: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried_attempts: u64,
}

/// Aggregated state of a batch of one-off jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    NotFound,
    Running,
    Completed,
}

/// Per-job outcome counts for a batch submission.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub submitted: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

struct JobEntry {
    config: JobConfig,
    handler: Arc<dyn JobHandler>,
    paused: bool,
    fired_before: bool,
    in_flight: Arc<Semaphore>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SchedulerInner {
    running: bool,
    jobs: HashMap<String, JobEntry>,
    history: HashMap<String, VecDeque<JobExecutionRecord>>,
    metrics: SchedulerMetrics,
}

impl SchedulerInner {
    fn record(&mut self, record: JobExecutionRecord) {
        let runs = self.history.entry(record.job_id.clone()).or_default();
        runs.push_front(record);
        runs.truncate(HISTORY_LIMIT);
    }
}

/// Owns job definitions and dispatches triggers to their handlers.
pub struct JobScheduler<S: JobStore + 'static> {
    store: S,
    registry: HandlerRegistry,
    /// Crawl targets a batch request over "all" expands to.
    targets: Vec<String>,
    inner: Arc<Mutex<SchedulerInner>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    started_at: Instant,
}

impl<S: JobStore + 'static> JobScheduler<S> {
    pub fn new(store: S, registry: HandlerRegistry) -> Self {
        Self {
            store,
            registry,
            targets: Vec::new(),
            inner: Arc::new(Mutex::new(SchedulerInner::default())),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    /// Configure the targets a batch request over `"all"` expands to.
    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.targets = targets;
        self
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, SchedulerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned scheduler mutex");
            poisoned.into_inner()
        })
    }

    /// Load persisted jobs and begin dispatching triggers.
    pub async fn start(&self) -> Result<(), AppError> {
        let stored = self.store.load_jobs().await?;
        {
            let mut inner = self.lock_inner();
            inner.running = true;
            for config in stored {
                if inner.jobs.contains_key(&config.job_id) {
                    continue;
                }
                let Some(handler) = self.registry.resolve(config.handler) else {
                    tracing::error!(
                        job_id = %config.job_id,
                        handler = %config.handler,
                        "Stored job references an unregistered handler, skipping"
                    );
                    continue;
                };
                let entry = self.make_entry(config, handler);
                inner.jobs.insert(entry.config.job_id.clone(), entry);
            }
        }

        let job_ids: Vec<String> = self.lock_inner().jobs.keys().cloned().collect();
        for job_id in job_ids {
            self.spawn_timer(&job_id);
        }
        tracing::info!("Scheduler started");
        Ok(())
    }

    /// Register a new job. The definition is persisted before the job is
    /// considered registered; invalid trigger specs or unknown handlers
    /// fail here and are never scheduled.
    pub async fn add_job(&self, config: JobConfig) -> Result<(), AppError> {
        config.trigger.validate()?;
        if config.max_instances == 0 {
            return Err(AppError::SchedulerConfig(format!(
                "job '{}': max_instances must be at least 1",
                config.job_id
            )));
        }
        let handler = self.registry.resolve(config.handler).ok_or_else(|| {
            AppError::SchedulerConfig(format!(
                "job '{}': no handler registered for kind '{}'",
                config.job_id, config.handler
            ))
        })?;

        {
            let inner = self.lock_inner();
            if inner.jobs.contains_key(&config.job_id) {
                return Err(AppError::SchedulerConfig(format!(
                    "job '{}' is already registered",
                    config.job_id
                )));
            }
        }

        // Durable store first: a job is registered once it is persisted.
        self.store.save_job(&config).await?;

        let job_id = config.job_id.clone();
        let running = {
            let mut inner = self.lock_inner();
            let entry = self.make_entry(config, handler);
            inner.jobs.insert(job_id.clone(), entry);
            inner.running
        };
        if running {
            self.spawn_timer(&job_id);
        }
        tracing::info!(%job_id, "Job registered");
        Ok(())
    }

    /// Expand a logical multi-target request into independent one-off
    /// jobs sharing `batch_id`. `"all"` expands to every configured target.
    pub async fn add_batch_jobs(&self, targets: &[String], batch_id: &str) -> BatchReport {
        let expanded: Vec<String> = if targets.iter().any(|t| t == "all") {
            self.targets.clone()
        } else {
            targets.to_vec()
        };

        let mut report = BatchReport::default();
        for target in &expanded {
            let config = JobConfig::new(
                format!("{batch_id}-{target}"),
                TriggerSpec::Once { at: Utc::now() },
                crate::job::HandlerKind::Crawl,
            )
            .with_data(serde_json::json!({ "task_id": target }))
            .with_batch_id(batch_id);

            match self.add_job(config).await {
                Ok(()) => report.submitted += 1,
                Err(err) => {
                    report.failed += 1;
                    report.errors.push(format!("{target}: {err}"));
                }
            }
        }
        tracing::info!(
            batch_id,
            submitted = report.submitted,
            failed = report.failed,
            "Batch jobs submitted"
        );
        report
    }

    /// Unregister a job: stop its timer and delete the stored definition.
    pub async fn remove_job(&self, job_id: &str) -> Result<(), AppError> {
        {
            let mut inner = self.lock_inner();
            let entry = inner.jobs.remove(job_id).ok_or_else(|| {
                AppError::SchedulerConfig(format!("job '{job_id}' is not registered"))
            })?;
            entry.cancel.cancel();
        }
        self.store.delete_job(job_id).await
    }

    pub async fn pause_job(&self, job_id: &str) -> Result<(), AppError> {
        self.set_paused(job_id, true).await
    }

    pub async fn resume_job(&self, job_id: &str) -> Result<(), AppError> {
        self.set_paused(job_id, false).await
    }

    async fn set_paused(&self, job_id: &str, paused: bool) -> Result<(), AppError> {
        let config = {
            let mut inner = self.lock_inner();
            let entry = inner.jobs.get_mut(job_id).ok_or_else(|| {
                AppError::SchedulerConfig(format!("job '{job_id}' is not registered"))
            })?;
            entry.paused = paused;
            entry.config.enabled = !paused;
            entry.config.clone()
        };
        // Keep the stored definition consistent with the live schedule.
        self.store.save_job(&config).await
    }

    /// Replace a job's definition, rebuilding its trigger timer.
    pub async fn modify_job(&self, config: JobConfig) -> Result<(), AppError> {
        config.trigger.validate()?;
        let handler = self.registry.resolve(config.handler).ok_or_else(|| {
            AppError::SchedulerConfig(format!(
                "job '{}': no handler registered for kind '{}'",
                config.job_id, config.handler
            ))
        })?;

        let job_id = config.job_id.clone();
        {
            let inner = self.lock_inner();
            if !inner.jobs.contains_key(&job_id) {
                return Err(AppError::SchedulerConfig(format!(
                    "job '{job_id}' is not registered"
                )));
            }
        }

        self.store.save_job(&config).await?;

        let running = {
            let mut inner = self.lock_inner();
            if let Some(old) = inner.jobs.remove(&job_id) {
                old.cancel.cancel();
            }
            let entry = self.make_entry(config, handler);
            inner.jobs.insert(job_id.clone(), entry);
            inner.running
        };
        if running {
            self.spawn_timer(&job_id);
        }
        Ok(())
    }

    pub fn status(&self) -> SchedulerStatus {
        let inner = self.lock_inner();
        let running_jobs = inner
            .jobs
            .values()
            .filter(|e| (e.in_flight.available_permits() as u32) < e.config.max_instances)
            .count();
        let paused_jobs = inner.jobs.values().filter(|e| e.paused).count();
        SchedulerStatus {
            running: inner.running,
            job_count: inner.jobs.len(),
            running_jobs,
            paused_jobs,
            uptime: self.started_at.elapsed(),
        }
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.lock_inner().metrics
    }

    /// In-memory execution history for a job, newest first.
    pub fn execution_history(&self, job_id: &str) -> Vec<JobExecutionRecord> {
        self.lock_inner()
            .history
            .get(job_id)
            .map(|runs| runs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Completion state of a batch: Completed once every member job has a
    /// terminal execution record.
    pub fn batch_status(&self, batch_id: &str) -> BatchStatus {
        let inner = self.lock_inner();
        let members: Vec<&JobEntry> = inner
            .jobs
            .values()
            .filter(|e| e.config.batch_id.as_deref() == Some(batch_id))
            .collect();
        if members.is_empty() {
            return BatchStatus::NotFound;
        }

        let all_done = members.iter().all(|entry| {
            inner
                .history
                .get(&entry.config.job_id)
                .is_some_and(|runs| runs.iter().any(|r| r.status.is_terminal()))
        });
        if all_done {
            BatchStatus::Completed
        } else {
            BatchStatus::Running
        }
    }

    /// Stop dispatching triggers. With `wait`, blocks until in-flight
    /// executions finish; running work is never cancelled mid-flight.
    pub async fn shutdown(&self, wait: bool) {
        {
            let mut inner = self.lock_inner();
            inner.running = false;
            for entry in inner.jobs.values() {
                entry.cancel.cancel();
            }
        }
        self.cancel.cancel();
        self.tracker.close();
        if wait {
            self.tracker.wait().await;
        }
        tracing::info!("Scheduler stopped");
    }

    fn make_entry(&self, config: JobConfig, handler: Arc<dyn JobHandler>) -> JobEntry {
        let paused = !config.enabled;
        let in_flight = Arc::new(Semaphore::new(config.max_instances as usize));
        JobEntry {
            config,
            handler,
            paused,
            fired_before: false,
            in_flight,
            cancel: self.cancel.child_token(),
        }
    }

    fn spawn_timer(&self, job_id: &str) {
        let Some((cancel, handler)) = ({
            let inner = self.lock_inner();
            inner
                .jobs
                .get(job_id)
                .map(|e| (e.cancel.clone(), e.handler.clone()))
        }) else {
            return;
        };

        let job_id = job_id.to_string();
        let inner = self.inner.clone();
        let store = self.store.clone();
        let tracker = self.tracker.clone();

        self.tracker.spawn(run_job_timer(
            job_id, handler, inner, store, tracker, cancel,
        ));
    }
}

/// Timer loop for one job: sleep until the next fire, then dispatch.
async fn run_job_timer<S: JobStore + 'static>(
    job_id: String,
    handler: Arc<dyn JobHandler>,
    inner: Arc<Mutex<SchedulerInner>>,
    store: S,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        let Some((trigger, fired_before, paused, config)) = snapshot(&inner, &job_id) else {
            break;
        };

        let now = Utc::now();
        let Some(next) = trigger.next_fire(now, fired_before) else {
            tracing::debug!(%job_id, "Trigger exhausted, timer exiting");
            break;
        };

        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => break,
        }

        if paused || snapshot(&inner, &job_id).is_none_or(|(_, _, p, _)| p) {
            tokio::select! {
                () = tokio::time::sleep(PAUSE_POLL) => {}
                () = cancel.cancelled() => break,
            }
            continue;
        }

        mark_fired(&inner, &job_id);

        let trigger_time = Utc::now();
        let late = (trigger_time - next).to_std().unwrap_or(Duration::ZERO);
        if late > config.misfire_grace() {
            tracing::warn!(
                %job_id,
                late_secs = late.as_secs(),
                "Fire missed beyond misfire grace, skipping"
            );
            record_skip(&inner, &store, &job_id, next, "misfired: past grace time").await;
            continue;
        }

        // Enforce max_instances: a fire that finds no free slot is skipped.
        let permit = {
            let guard = inner.lock().unwrap_or_else(|p| p.into_inner());
            guard
                .jobs
                .get(&job_id)
                .and_then(|e| e.in_flight.clone().try_acquire_owned().ok())
        };
        let Some(permit) = permit else {
            tracing::warn!(%job_id, "Skipping fire: max concurrent instances reached");
            record_skip(&inner, &store, &job_id, next, "skipped: max instances in flight").await;
            continue;
        };

        let ctx = JobContext {
            job_id: job_id.clone(),
            scheduled_time: next,
            trigger_time,
            data: config.data.clone(),
            max_retries: config.max_retries,
        };
        let handler = handler.clone();
        let inner = inner.clone();
        let store = store.clone();

        tracker.spawn(async move {
            let started_at = Utc::now();
            let result = execute_with_retry(handler.as_ref(), &ctx).await;

            let record = JobExecutionRecord {
                id: Uuid::new_v4(),
                job_id: ctx.job_id.clone(),
                status: if result.success {
                    JobStatus::Success
                } else {
                    JobStatus::Failed
                },
                scheduled_time: ctx.scheduled_time,
                started_at,
                finished_at: Some(Utc::now()),
                retry_count: result.attempts.saturating_sub(1),
                last_error: result.error.clone(),
            };

            {
                let mut guard = inner.lock().unwrap_or_else(|p| p.into_inner());
                guard.metrics.total_executions += 1;
                if result.success {
                    guard.metrics.succeeded += 1;
                } else {
                    guard.metrics.failed += 1;
                }
                guard.metrics.retried_attempts += u64::from(record.retry_count);
                guard.record(record.clone());
            }
            if let Err(err) = store.append_run(&record).await {
                tracing::error!(job_id = %record.job_id, error = %err, "Failed to persist execution record");
            }
            drop(permit);
        });
    }
}

fn snapshot(
    inner: &Arc<Mutex<SchedulerInner>>,
    job_id: &str,
) -> Option<(TriggerSpec, bool, bool, JobConfig)> {
    let guard = inner.lock().unwrap_or_else(|p| p.into_inner());
    guard.jobs.get(job_id).map(|e| {
        (
            e.config.trigger.clone(),
            e.fired_before,
            e.paused,
            e.config.clone(),
        )
    })
}

fn mark_fired(inner: &Arc<Mutex<SchedulerInner>>, job_id: &str) {
    let mut guard = inner.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(entry) = guard.jobs.get_mut(job_id) {
        entry.fired_before = true;
    }
}

async fn record_skip<S: JobStore>(
    inner: &Arc<Mutex<SchedulerInner>>,
    store: &S,
    job_id: &str,
    scheduled: chrono::DateTime<Utc>,
    reason: &str,
) {
    let record = JobExecutionRecord {
        id: Uuid::new_v4(),
        job_id: job_id.to_string(),
        status: JobStatus::Failed,
        scheduled_time: scheduled,
        started_at: Utc::now(),
        finished_at: Some(Utc::now()),
        retry_count: 0,
        last_error: Some(reason.to_string()),
    };
    {
        let mut guard = inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.metrics.total_executions += 1;
        guard.metrics.failed += 1;
        guard.record(record.clone());
    }
    if let Err(err) = store.append_run(&record).await {
        tracing::error!(%job_id, error = %err, "Failed to persist skip record");
    }
}
