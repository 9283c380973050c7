use chrono::{DateTime, Utc};
use demeter_core::error::AppError;
use demeter_core::job::{JobConfig, JobExecutionRecord, JobStatus};
use demeter_core::job_store::JobStore;
use sqlx::PgPool;
use uuid::Uuid;

/// Durable job store in PostgreSQL.
///
/// Job definitions are stored as JSONB keyed by job_id; execution
/// history is append-only.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> AppError {
    AppError::Storage(e.to_string())
}

impl JobStore for PgJobStore {
    async fn save_job(&self, config: &JobConfig) -> Result<(), AppError> {
        let body = serde_json::to_value(config)?;
        sqlx::query(
            r#"
            INSERT INTO jobs (job_id, config)
            VALUES ($1, $2)
            ON CONFLICT (job_id) DO UPDATE
            SET config = EXCLUDED.config,
                updated_at = now()
            "#,
        )
        .bind(&config.job_id)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_jobs(&self) -> Result<Vec<JobConfig>, AppError> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as("SELECT config FROM jobs")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut jobs = Vec::with_capacity(rows.len());
        for (body,) in rows {
            match serde_json::from_value::<JobConfig>(body) {
                Ok(config) => jobs.push(config),
                Err(err) => {
                    tracing::error!(error = %err, "Skipping undecodable stored job");
                }
            }
        }
        Ok(jobs)
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn append_run(&self, record: &JobExecutionRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO job_runs (id, job_id, status, scheduled_time, started_at, finished_at, retry_count, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(&record.job_id)
        .bind(record.status.as_str())
        .bind(record.scheduled_time)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.retry_count as i32)
        .bind(&record.last_error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_runs(
        &self,
        job_id: &str,
        limit: usize,
    ) -> Result<Vec<JobExecutionRecord>, AppError> {
        let rows = sqlx::query_as::<_, JobRunRow>(
            r#"
            SELECT id, job_id, status, scheduled_time, started_at, finished_at, retry_count, last_error
            FROM job_runs
            WHERE job_id = $1
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(job_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(JobRunRow::try_into).collect()
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct JobRunRow {
    id: Uuid,
    job_id: String,
    status: String,
    scheduled_time: DateTime<Utc>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    retry_count: i32,
    last_error: Option<String>,
}

impl TryFrom<JobRunRow> for JobExecutionRecord {
    type Error = AppError;

    fn try_from(row: JobRunRow) -> Result<Self, AppError> {
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|e: String| AppError::Storage(e))?;
        Ok(JobExecutionRecord {
            id: row.id,
            job_id: row.job_id,
            status,
            scheduled_time: row.scheduled_time,
            started_at: row.started_at,
            finished_at: row.finished_at,
            retry_count: row.retry_count as u32,
            last_error: row.last_error,
        })
    }
}
