//! API Module
//!
//! HTTP API layer for the gateway.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod job;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Analysis endpoints
        .route("/api/analyze", post(job::submit_analysis))
        .route("/api/jobs", get(job::list_jobs))
        .route("/api/jobs/{id}", get(job::get_job))
        .route("/api/jobs/{id}/use-cases/{index}", get(job::get_use_case))
        .route("/api/jobs/{id}/files/{*path}", get(job::get_job_file))
        .route("/api/jobs/{id}/cancel", post(job::cancel_job))
        // Add state and middleware
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
