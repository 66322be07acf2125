//! Job API Handlers
//!
//! HTTP endpoints for submitting analyses and following their jobs.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use docprobe_core::domain::use_case::UseCaseRecord;
use docprobe_core::dto::job::{
    CancelResponse, JobListQuery, JobStatusView, JobSummary, SubmitAnalysis,
    SubmitAnalysisResponse,
};
use uuid::Uuid;

use crate::api::error::ApiResult;
use crate::service::job_service;
use crate::state::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ANONYMOUS_USER: &str = "anonymous";

/// Owner of the request, taken from the `x-user-id` header
fn user_id(headers: &HeaderMap) -> String {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string()
}

/// POST /api/analyze
/// Submit a repository for analysis
pub async fn submit_analysis(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SubmitAnalysis>,
) -> ApiResult<(StatusCode, Json<SubmitAnalysisResponse>)> {
    let user = user_id(&headers);
    tracing::info!("Submitting analysis of {} for {}", req.repository_url, user);

    let response = job_service::submit_analysis(&state, &user, req).await?;

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /api/jobs?project_id=
/// List the caller's jobs, newest first, optionally within one project
pub async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<JobListQuery>,
) -> ApiResult<Json<Vec<JobSummary>>> {
    let user = user_id(&headers);
    tracing::debug!("Listing jobs for {} (project: {:?})", user, query.project_id);

    let jobs = job_service::list_jobs(&state, &user, query.project_id.as_deref()).await?;

    Ok(Json(jobs.iter().map(JobSummary::from).collect()))
}

/// GET /api/jobs/{id}
/// Get the full status of a job
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobStatusView>> {
    tracing::debug!("Getting job: {}", id);

    let job = job_service::get_job(&state, id).await?;

    Ok(Json(job.into()))
}

/// GET /api/jobs/{id}/use-cases/{index}
/// Get one use case record
pub async fn get_use_case(
    State(state): State<AppState>,
    Path((id, index)): Path<(Uuid, u32)>,
) -> ApiResult<Json<UseCaseRecord>> {
    tracing::debug!("Getting use case {} of job {}", index, id);

    let record = job_service::get_use_case(&state, id, index).await?;

    Ok(Json(record))
}

/// GET /api/jobs/{id}/files/{*path}
/// Download a file from the job's data directory
pub async fn get_job_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, path)): Path<(Uuid, String)>,
) -> ApiResult<impl IntoResponse> {
    let user = user_id(&headers);
    tracing::debug!("Reading file {} of job {} for {}", path, id, user);

    let body = job_service::read_job_file(&state, &user, id, &path).await?;

    Ok(([(header::CONTENT_TYPE, content_type(&path))], body))
}

fn content_type(path: &str) -> &'static str {
    if path.ends_with(".json") {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    }
}

/// POST /api/jobs/{id}/cancel
/// Request cancellation of a job
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<CancelResponse>)> {
    tracing::info!("Cancelling job: {}", id);

    let response = job_service::cancel_job(&state, id).await?;

    Ok((StatusCode::ACCEPTED, Json(response)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(user_id(&headers), ANONYMOUS_USER);

        headers.insert(USER_ID_HEADER, "  ".parse().unwrap());
        assert_eq!(user_id(&headers), ANONYMOUS_USER);

        headers.insert(USER_ID_HEADER, "alice".parse().unwrap());
        assert_eq!(user_id(&headers), "alice");
    }
}
