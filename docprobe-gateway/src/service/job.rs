//! Job Service
//!
//! Submission, status queries, artifact retrieval and cancellation of
//! analysis jobs. The gateway only creates jobs and reads them back;
//! everything after submission is written by the worker that holds the job
//! lease.

use docprobe_core::domain::error::ErrorDetail;
use docprobe_core::domain::job::{Job, JobPhase};
use docprobe_core::domain::use_case::UseCaseRecord;
use docprobe_core::dto::job::{CancelResponse, SubmitAnalysis, SubmitAnalysisResponse};
use docprobe_core::dto::task::{ANALYZE_REPOSITORY_TASK, AnalyzeTaskArgs};
use docprobe_store::StoreError;
use std::io;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use crate::state::AppState;

/// Service error type
#[derive(Debug)]
pub enum JobError {
    NotFound(Uuid),
    UseCaseNotFound(Uuid, u32),
    FileNotFound(Uuid, String),
    Forbidden(String),
    ValidationError(String),
    InvalidState(String),
    StoreError(StoreError),
    Io(io::Error),
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::JobNotFound(id) => JobError::NotFound(id),
            other => JobError::StoreError(other),
        }
    }
}

/// Create a job and dispatch its analysis task
///
/// The job id doubles as the task id, so a retried dispatch never creates a
/// second task for the same job.
pub async fn submit_analysis(
    state: &AppState,
    user_id: &str,
    req: SubmitAnalysis,
) -> Result<SubmitAnalysisResponse, JobError> {
    req.validate().map_err(JobError::ValidationError)?;

    let job = Job::new(Uuid::new_v4(), req.into_params(user_id));
    state.store.create(&job).await?;

    let args = serde_json::to_value(AnalyzeTaskArgs { job_id: job.id })
        .map_err(|e| JobError::StoreError(e.into()))?;

    if let Err(e) = state
        .tasks
        .submit(ANALYZE_REPOSITORY_TASK, args, job.id)
        .await
    {
        tracing::error!("Failed to dispatch job {}: {}", job.id, e);
        let detail = ErrorDetail::new("dispatch", e.to_string());
        if let Err(store_err) = state
            .store
            .update(job.id, |j| j.fail(JobPhase::Failed, detail))
            .await
        {
            tracing::warn!("Failed to record dispatch failure of job {}: {}", job.id, store_err);
        }
        return Err(e.into());
    }

    tracing::info!(
        "Job created: {} for {}@{}",
        job.id,
        job.params.repository_url,
        job.params.branch
    );

    Ok(SubmitAnalysisResponse {
        job_id: job.id,
        phase: job.phase,
        message: "Analysis job submitted".to_string(),
    })
}

/// Get a job by ID
pub async fn get_job(state: &AppState, id: Uuid) -> Result<Job, JobError> {
    state.store.get(id).await?.ok_or(JobError::NotFound(id))
}

/// List the jobs of a user, newest first
///
/// # Arguments
/// * `project_id` - Keep only jobs submitted under this project
pub async fn list_jobs(
    state: &AppState,
    user_id: &str,
    project_id: Option<&str>,
) -> Result<Vec<Job>, JobError> {
    let jobs = state.store.list(Some(user_id)).await?;
    Ok(match project_id {
        Some(project) => jobs
            .into_iter()
            .filter(|job| job.params.project_id.as_deref() == Some(project))
            .collect(),
        None => jobs,
    })
}

/// Get one use case record of a job
pub async fn get_use_case(
    state: &AppState,
    id: Uuid,
    index: u32,
) -> Result<UseCaseRecord, JobError> {
    let mut job = get_job(state, id).await?;
    job.use_cases
        .remove(&index)
        .ok_or(JobError::UseCaseNotFound(id, index))
}

/// Read a file the worker wrote under the job's data directory
///
/// Only the submitter of the job may read its files. `name` is relative to
/// `<data_root>/<job id>/data` and may not leave it, neither through `..`
/// nor through a symlink.
pub async fn read_job_file(
    state: &AppState,
    user_id: &str,
    id: Uuid,
    name: &str,
) -> Result<Vec<u8>, JobError> {
    let job = get_job(state, id).await?;
    if job.params.user_id != user_id {
        return Err(JobError::Forbidden(format!("Job {} belongs to another user", id)));
    }

    let relative = relative_file_path(name)
        .ok_or_else(|| JobError::ValidationError(format!("Invalid file path: {}", name)))?;
    let not_found = || JobError::FileNotFound(id, name.to_string());

    let data_dir = state.data_root.join(id.to_string()).join("data");
    let root = match tokio::fs::canonicalize(&data_dir).await {
        Ok(root) => root,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => return Err(JobError::Io(e)),
    };
    let resolved = match tokio::fs::canonicalize(root.join(relative)).await {
        Ok(resolved) => resolved,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => return Err(JobError::Io(e)),
    };

    if !resolved.starts_with(&root) {
        tracing::warn!("Rejected file {} of job {}: resolves outside its data directory", name, id);
        return Err(JobError::Forbidden(format!("Invalid file path: {}", name)));
    }
    if !tokio::fs::metadata(&resolved).await.map_err(JobError::Io)?.is_file() {
        return Err(not_found());
    }

    tokio::fs::read(&resolved).await.map_err(JobError::Io)
}

/// Normalizes a requested file name into a plain relative path
///
/// # Returns
/// `None` for empty, absolute or parent-referencing paths
fn relative_file_path(name: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!relative.as_os_str().is_empty()).then_some(relative)
}

/// Request cancellation of a running job
///
/// The worker holding the job notices the request on its next heartbeat.
pub async fn cancel_job(state: &AppState, id: Uuid) -> Result<CancelResponse, JobError> {
    let job = get_job(state, id).await?;

    if job.phase.is_terminal() {
        return Err(JobError::InvalidState(format!(
            "Job {} already finished ({})",
            id, job.phase
        )));
    }

    let already_pending = state.store.cancel_requested(id).await?;
    if !already_pending {
        state.store.request_cancel(id).await?;
        tracing::info!("Cancellation requested for job {}", id);
    }

    Ok(CancelResponse {
        job_id: id,
        phase: job.phase,
        cancel_requested: !already_pending,
    })
}
