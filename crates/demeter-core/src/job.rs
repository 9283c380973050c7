use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Status of one job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Which registered handler a job is bound to. Resolved against the
/// handler registry at registration time, never by string lookup at fire
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    Crawl,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::Crawl => write!(f, "crawl"),
        }
    }
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TriggerSpec {
    /// Fixed interval between fires, starting one interval after registration.
    Interval { every_secs: u64 },
    /// Standard cron expression (with seconds field).
    Cron { expr: String },
    /// One-off execution at (or as soon as possible after) the given time.
    Once { at: DateTime<Utc> },
}

impl TriggerSpec {
    /// Validate at registration time; scheduling never sees a bad spec.
    pub fn validate(&self) -> Result<(), AppError> {
        match self {
            TriggerSpec::Interval { every_secs } => {
                if *every_secs == 0 {
                    return Err(AppError::SchedulerConfig(
                        "interval trigger requires a non-zero period".into(),
                    ));
                }
                Ok(())
            }
            TriggerSpec::Cron { expr } => {
                cron::Schedule::from_str(expr).map_err(|e| {
                    AppError::SchedulerConfig(format!("invalid cron expression '{expr}': {e}"))
                })?;
                Ok(())
            }
            TriggerSpec::Once { .. } => Ok(()),
        }
    }

    /// Next fire time strictly after `after`. `fired_before` reports
    /// whether this job has fired at least once (one-off triggers exhaust
    /// after their single fire).
    pub fn next_fire(&self, after: DateTime<Utc>, fired_before: bool) -> Option<DateTime<Utc>> {
        match self {
            TriggerSpec::Interval { every_secs } => {
                Some(after + chrono::TimeDelta::seconds(*every_secs as i64))
            }
            TriggerSpec::Cron { expr } => {
                let schedule = cron::Schedule::from_str(expr).ok()?;
                schedule.after(&after).next()
            }
            TriggerSpec::Once { at } => {
                if fired_before {
                    None
                } else {
                    // A past fire time is still returned; the misfire grace
                    // check at fire time decides whether it runs.
                    Some(*at)
                }
            }
        }
    }
}

/// A registered job definition. Persisted in the durable job store;
/// mutated only through explicit scheduler operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_id: String,
    pub trigger: TriggerSpec,
    pub handler: HandlerKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    #[serde(default = "default_misfire_grace_secs")]
    pub misfire_grace_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Handler-specific payload (e.g. the crawl task id).
    #[serde(default)]
    pub data: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}
fn default_max_instances() -> u32 {
    1
}
fn default_misfire_grace_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    2
}

impl JobConfig {
    pub fn new(job_id: impl Into<String>, trigger: TriggerSpec, handler: HandlerKind) -> Self {
        Self {
            job_id: job_id.into(),
            trigger,
            handler,
            enabled: true,
            max_instances: default_max_instances(),
            misfire_grace_secs: default_misfire_grace_secs(),
            max_retries: default_max_retries(),
            batch_id: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn with_max_instances(mut self, max: u32) -> Self {
        self.max_instances = max;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn misfire_grace(&self) -> Duration {
        Duration::from_secs(self.misfire_grace_secs)
    }
}

/// Execution context handed to a handler for one fire.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub scheduled_time: DateTime<Utc>,
    pub trigger_time: DateTime<Utc>,
    pub data: serde_json::Value,
    pub max_retries: u32,
}

/// What a handler returns on success.
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// Final outcome of one job execution, including all retries.
/// `execute_with_retry` always produces one of these; it never raises.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub success: bool,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_time: Duration,
    pub attempts: u32,
}

/// One row of execution history, appended on every trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionRecord {
    pub id: Uuid,
    pub job_id: String,
    pub status: JobStatus,
    pub scheduled_time: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failed,
        ] {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_interval_validation() {
        assert!(TriggerSpec::Interval { every_secs: 0 }.validate().is_err());
        assert!(TriggerSpec::Interval { every_secs: 300 }.validate().is_ok());
    }

    #[test]
    fn test_cron_validation() {
        assert!(
            TriggerSpec::Cron {
                expr: "0 0 6 * * *".into()
            }
            .validate()
            .is_ok()
        );
        let err = TriggerSpec::Cron {
            expr: "every tuesday".into(),
        }
        .validate()
        .unwrap_err();
        assert!(matches!(err, AppError::SchedulerConfig(_)));
    }

    #[test]
    fn test_interval_next_fire() {
        let trigger = TriggerSpec::Interval { every_secs: 60 };
        let now = Utc::now();
        assert_eq!(
            trigger.next_fire(now, false).unwrap(),
            now + chrono::TimeDelta::seconds(60)
        );
    }

    #[test]
    fn test_once_fires_exactly_once() {
        let at = Utc::now();
        let trigger = TriggerSpec::Once { at };
        assert_eq!(trigger.next_fire(Utc::now(), false), Some(at));
        assert_eq!(trigger.next_fire(Utc::now(), true), None);
    }

    #[test]
    fn test_cron_next_fire_advances() {
        let trigger = TriggerSpec::Cron {
            expr: "0 0 6 * * *".into(),
        };
        let now = Utc::now();
        let next = trigger.next_fire(now, false).unwrap();
        assert!(next > now);
        let after_next = trigger.next_fire(next, true).unwrap();
        assert!(after_next > next);
    }

    #[test]
    fn test_job_config_serde_roundtrip() {
        let config = JobConfig::new(
            "fantasy-daily",
            TriggerSpec::Cron {
                expr: "0 0 6 * * *".into(),
            },
            HandlerKind::Crawl,
        )
        .with_data(serde_json::json!({"task_id": "fantasy"}))
        .with_batch_id("batch-1");

        let json = serde_json::to_string(&config).unwrap();
        let back: JobConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job_id, "fantasy-daily");
        assert_eq!(back.trigger, config.trigger);
        assert_eq!(back.batch_id.as_deref(), Some("batch-1"));
        assert_eq!(back.max_instances, 1);
    }

    #[test]
    fn test_builder_defaults() {
        let config = JobConfig::new(
            "j",
            TriggerSpec::Interval { every_secs: 1 },
            HandlerKind::Crawl,
        );
        assert!(config.enabled);
        assert_eq!(config.max_instances, 1);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.misfire_grace(), Duration::from_secs(60));
    }
}
