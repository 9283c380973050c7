use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use demeter_client::{EnvelopeParser, ResilientHttpClient};
use demeter_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use demeter_core::config::CrawlConfig;
use demeter_core::crawl::CrawlOrchestrator;
use demeter_core::handler::{CrawlJobHandler, HandlerRegistry};
use demeter_core::job::{HandlerKind, JobConfig};
use demeter_core::scheduler::{BatchStatus, JobScheduler};
use demeter_core::traits::NullCrawlStore;
use demeter_db::{PgCrawlStore, PgJobStore};

#[derive(Parser)]
#[command(name = "demeter", version, about = "Ranking snapshot harvester")]
struct Cli {
    /// Path to the crawl configuration (tasks + URL templates)
    #[arg(short, long, env = "DEMETER_CONFIG", default_value = "crawl.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one crawl task immediately and print the result
    Crawl {
        /// Task id from the crawl configuration
        #[arg(short, long)]
        task: String,

        /// Fetch and parse but skip persistence
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Submit a batch of one-off crawl jobs and wait for completion
    Batch {
        /// Task ids to crawl, or "all" for every configured task
        #[arg(short, long, required = true, num_args = 1..)]
        targets: Vec<String>,

        /// Batch identifier (defaults to a timestamp-derived id)
        #[arg(short, long)]
        batch_id: Option<String>,
    },

    /// Run the scheduler with jobs from a definitions file until Ctrl-C
    Schedule {
        /// Path to a JSON array of job definitions
        #[arg(short, long)]
        jobs: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Setup tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("demeter=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let crawl_config = Arc::new(
        CrawlConfig::from_file(&cli.config)
            .with_context(|| format!("loading crawl config from {}", cli.config.display()))?,
    );

    let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
    let client = ResilientHttpClient::new(breaker.clone()).map_err(|e| anyhow::anyhow!(e))?;

    match cli.command {
        Commands::Crawl { task, dry_run } => {
            cmd_crawl(crawl_config, client, breaker, &task, dry_run).await?;
        }
        Commands::Batch { targets, batch_id } => {
            let batch_id = batch_id.unwrap_or_else(|| {
                format!("batch-{}", chrono_free_timestamp())
            });
            cmd_batch(crawl_config, client, &targets, &batch_id).await?;
        }
        Commands::Schedule { jobs } => {
            cmd_schedule(crawl_config, client, &jobs).await?;
        }
    }

    Ok(())
}

async fn cmd_crawl(
    config: Arc<CrawlConfig>,
    client: ResilientHttpClient,
    breaker: CircuitBreaker,
    task: &str,
    dry_run: bool,
) -> Result<()> {
    let result = if dry_run {
        let orchestrator =
            CrawlOrchestrator::new(config, client, EnvelopeParser::new(), NullCrawlStore);
        orchestrator.run(task).await
    } else {
        let pool = connect_db().await?;
        let orchestrator = CrawlOrchestrator::new(
            config,
            client,
            EnvelopeParser::new(),
            PgCrawlStore::new(pool),
        );
        orchestrator.run(task).await
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    tracing::info!(breaker = ?breaker.stats(), "Breaker state after crawl");

    if result.success {
        Ok(())
    } else {
        anyhow::bail!("crawl task '{task}' failed");
    }
}

async fn cmd_batch(
    config: Arc<CrawlConfig>,
    client: ResilientHttpClient,
    targets: &[String],
    batch_id: &str,
) -> Result<()> {
    let pool = connect_db().await?;
    let scheduler = build_scheduler(config, client, pool)?;
    scheduler.start().await.map_err(|e| anyhow::anyhow!(e))?;

    let report = scheduler.add_batch_jobs(targets, batch_id).await;
    println!(
        "batch '{batch_id}': {} submitted, {} failed",
        report.submitted, report.failed
    );
    for error in &report.errors {
        eprintln!("  {error}");
    }
    if report.submitted == 0 {
        scheduler.shutdown(false).await;
        anyhow::bail!("no jobs submitted");
    }

    // Poll until every member job has a terminal execution.
    loop {
        match scheduler.batch_status(batch_id) {
            BatchStatus::Completed => break,
            BatchStatus::NotFound => anyhow::bail!("batch '{batch_id}' vanished"),
            BatchStatus::Running => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    }

    scheduler.shutdown(true).await;
    let metrics = scheduler.metrics();
    println!(
        "batch '{batch_id}' completed: {} succeeded, {} failed",
        metrics.succeeded, metrics.failed
    );
    Ok(())
}

async fn cmd_schedule(
    config: Arc<CrawlConfig>,
    client: ResilientHttpClient,
    jobs_path: &PathBuf,
) -> Result<()> {
    let raw = std::fs::read_to_string(jobs_path)
        .with_context(|| format!("loading job definitions from {}", jobs_path.display()))?;
    let jobs: Vec<JobConfig> = serde_json::from_str(&raw).context("parsing job definitions")?;

    let pool = connect_db().await?;
    let scheduler = build_scheduler(config, client, pool)?;
    scheduler.start().await.map_err(|e| anyhow::anyhow!(e))?;

    for job in jobs {
        let job_id = job.job_id.clone();
        match scheduler.add_job(job).await {
            Ok(()) => tracing::info!(%job_id, "Registered job"),
            Err(err) => tracing::warn!(%job_id, error = %err, "Skipping job"),
        }
    }

    let status = scheduler.status();
    tracing::info!(
        jobs = status.job_count,
        paused = status.paused_jobs,
        "Scheduler running, Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down, waiting for in-flight executions");
    scheduler.shutdown(true).await;

    let metrics = scheduler.metrics();
    println!(
        "executions: {} total, {} succeeded, {} failed, {} retries",
        metrics.total_executions, metrics.succeeded, metrics.failed, metrics.retried_attempts
    );
    Ok(())
}

fn build_scheduler(
    config: Arc<CrawlConfig>,
    client: ResilientHttpClient,
    pool: sqlx::PgPool,
) -> Result<JobScheduler<PgJobStore>> {
    let orchestrator = Arc::new(CrawlOrchestrator::new(
        config.clone(),
        client,
        EnvelopeParser::new(),
        PgCrawlStore::new(pool.clone()),
    ));
    let registry = HandlerRegistry::new().register(
        HandlerKind::Crawl,
        Arc::new(CrawlJobHandler::new(orchestrator)),
    );
    Ok(JobScheduler::new(PgJobStore::new(pool), registry).with_targets(config.task_ids()))
}

/// Connect to PostgreSQL using DATABASE_URL.
async fn connect_db() -> Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL not set. Required for persistence and scheduling.")?;
    demeter_db::connect(&database_url)
        .await
        .map_err(|e| anyhow::anyhow!(e))
}

/// Seconds since the epoch, without pulling chrono into the CLI.
fn chrono_free_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
