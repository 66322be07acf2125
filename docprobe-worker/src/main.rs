//! Docprobe Worker
//!
//! Claims `analyze_repository` tasks and runs documentation analysis jobs.
//!
//! Startup:
//! - Configuration: load settings from environment or defaults
//! - Store: connect to Postgres (with retry) and run migrations
//! - Runtime: check that the container engine answers
//! - Scheduler: poll for tasks and purge expired entries until SIGTERM or SIGINT

use anyhow::{Context, Result};
use docprobe_store::db::{create_pool, run_migrations};
use docprobe_store::{JobStore, KeyedStore, PgStore, PgTaskQueue, TaskQueue};
use docprobe_worker::config::Config;
use docprobe_worker::container::ContainerCli;
use docprobe_worker::orchestrator::JobOrchestrator;
use docprobe_worker::sandbox::SandboxRuntime;
use docprobe_worker::scheduler::{ExpirySweeper, TaskPoller};
use docprobe_worker::shutdown::install_shutdown_handler;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docprobe_worker=info,docprobe_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Docprobe Worker");

    let config = load_config()?;
    info!(
        "Loaded configuration: worker_id={}, data_root={}, engine={}",
        config.worker_id,
        config.data_root.display(),
        config.sandbox.engine
    );

    let pool = connect_with_retry(&config.database_url).await?;
    run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let runtime: Arc<dyn SandboxRuntime> = Arc::new(ContainerCli::new(config.sandbox.engine.clone()));
    runtime
        .ping()
        .await
        .context("Container engine is not available")?;
    info!("Container engine {} is available", config.sandbox.engine);

    tokio::fs::create_dir_all(&config.data_root)
        .await
        .with_context(|| format!("Failed to create {}", config.data_root.display()))?;

    let kv: Arc<dyn KeyedStore> = Arc::new(PgStore::new(pool.clone()));
    let store = JobStore::new(Arc::clone(&kv)).with_ttl(config.job_ttl);
    let queue: Arc<dyn TaskQueue> = Arc::new(PgTaskQueue::new(pool));
    let orchestrator = Arc::new(JobOrchestrator::new(config.clone(), store, runtime));

    let shutdown = install_shutdown_handler()?;
    let poller = TaskPoller::new(config.clone(), queue, orchestrator);
    let sweeper = ExpirySweeper::new(kv, config.purge_interval);
    let sweeping = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { sweeper.run(shutdown).await }
    });

    info!("Worker initialized successfully");
    info!(
        "Max concurrent jobs: {}, pool size: {}, sandbox timeout: {:?}",
        config.max_concurrent_jobs, config.pool.pool_size, config.pool.sandbox_timeout
    );

    let polled = poller.run(shutdown).await;
    if let Err(e) = sweeping.await {
        warn!("Expiry sweeper panicked: {}", e);
    }
    if let Err(e) = polled {
        error!("Poller error: {}", e);
        return Err(e);
    }

    info!("Docprobe Worker stopped");
    Ok(())
}

/// Loads configuration from environment variables
fn load_config() -> Result<Config> {
    let config = Config::from_env()?;
    config.validate()?;
    Ok(config)
}

/// Connects to the database with retry logic and exponential backoff
///
/// The database may not be ready yet when the worker starts (common in
/// container environments).
async fn connect_with_retry(database_url: &str) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match create_pool(database_url).await {
            Ok(pool) => {
                if attempt > 1 {
                    info!("Connected to database after {} attempt(s)", attempt);
                }
                return Ok(pool);
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!("Failed to connect to database after {} attempts", MAX_RETRIES);
                    return Err(anyhow::anyhow!("Failed to connect to database: {}", e));
                }

                warn!(
                    "Failed to connect to database (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                // Exponential backoff with cap
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
