use std::future::Future;

use crate::error::AppError;
use crate::job::{JobConfig, JobExecutionRecord};

/// Durable persistence for job definitions and execution history.
///
/// The store is the single source of truth for schedule state: a job is
/// only considered registered once its definition has been written here,
/// and `load_jobs` must return every registered job after a process
/// restart.
pub trait JobStore: Send + Sync + Clone {
    /// Insert or replace a job definition keyed by `job_id`.
    fn save_job(&self, config: &JobConfig) -> impl Future<Output = Result<(), AppError>> + Send;

    /// All persisted job definitions.
    fn load_jobs(&self) -> impl Future<Output = Result<Vec<JobConfig>, AppError>> + Send;

    fn delete_job(&self, job_id: &str) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Append one execution record to the job's history.
    fn append_run(
        &self,
        record: &JobExecutionRecord,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Execution history for a job, newest first.
    fn get_runs(
        &self,
        job_id: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<JobExecutionRecord>, AppError>> + Send;
}
