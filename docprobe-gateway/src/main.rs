use anyhow::{Context, Result};
use docprobe_store::{JobStore, PgStore, PgTaskQueue};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod config;
pub mod service;
pub mod state;

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docprobe_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Docprobe Gateway...");

    let config = Config::from_env();
    config.validate()?;

    tracing::info!("Connecting to database...");

    let pool = docprobe_store::db::create_pool(&config.database_url)
        .await
        .context("Failed to create database pool")?;

    tracing::info!("Database connection pool created");

    docprobe_store::db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let state = AppState {
        store: JobStore::new(Arc::new(PgStore::new(pool.clone()))).with_ttl(config.job_ttl),
        tasks: Arc::new(PgTaskQueue::new(pool)),
        data_root: config.data_root.clone(),
    };

    tracing::info!("Serving job files from {}", config.data_root.display());

    // Build router with all API endpoints
    let app = api::create_router(state);

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down gateway");
        })
        .await
        .context("Failed to start server")?;

    Ok(())
}
