//! Job DTOs exchanged with the gateway

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::error::ErrorDetail;
use crate::domain::job::{Job, JobParams, JobPhase, UseCaseCounts};
use crate::domain::report::QualityReport;
use crate::domain::use_case::UseCaseRecord;

fn default_branch() -> String {
    "main".to_string()
}

fn default_include_folders() -> Vec<String> {
    vec!["docs".to_string()]
}

const ALLOWED_SCHEMES: [&str; 4] = ["https://", "http://", "ssh://", "git@"];

/// Request to analyze a repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAnalysis {
    pub repository_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_include_folders")]
    pub include_folders: Vec<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl SubmitAnalysis {
    /// Checks the request before a job is created for it
    ///
    /// # Returns
    /// A human readable message describing the first problem found
    pub fn validate(&self) -> Result<(), String> {
        let url = self.repository_url.trim();
        if url.is_empty() {
            return Err("repository_url cannot be empty".to_string());
        }
        if !ALLOWED_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
            return Err(format!("unsupported repository url: {}", url));
        }
        if self.branch.trim().is_empty() {
            return Err("branch cannot be empty".to_string());
        }
        for folder in &self.include_folders {
            if folder.split('/').any(|part| part == "..") || folder.starts_with('/') {
                return Err(format!(
                    "include folder must be relative to the repository: {}",
                    folder
                ));
            }
        }
        Ok(())
    }

    /// Converts the request into job parameters owned by `user_id`
    pub fn into_params(self, user_id: impl Into<String>) -> JobParams {
        let include_folders = if self.include_folders.is_empty() {
            default_include_folders()
        } else {
            self.include_folders
        };

        JobParams {
            repository_url: self.repository_url.trim().to_string(),
            branch: self.branch.trim().to_string(),
            include_folders,
            user_id: user_id.into(),
            project_id: self.project_id,
        }
    }
}

/// Response to a submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAnalysisResponse {
    pub job_id: Uuid,
    pub phase: JobPhase,
    pub message: String,
}

/// Full status projection of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub repository_url: String,
    pub branch: String,
    pub phase: JobPhase,
    pub counts: UseCaseCounts,
    pub use_cases: BTreeMap<u32, UseCaseRecord>,
    pub error: Option<ErrorDetail>,
    pub message: Option<String>,
    pub report: Option<QualityReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobStatusView {
    fn from(job: Job) -> Self {
        JobStatusView {
            job_id: job.id,
            repository_url: job.params.repository_url,
            branch: job.params.branch,
            phase: job.phase,
            counts: job.counts,
            use_cases: job.use_cases,
            error: job.error,
            message: job.message,
            report: job.report,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Summary row used by job listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub repository_url: String,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub phase: JobPhase,
    pub counts: UseCaseCounts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        JobSummary {
            job_id: job.id,
            repository_url: job.params.repository_url.clone(),
            branch: job.params.branch.clone(),
            project_id: job.params.project_id.clone(),
            phase: job.phase,
            counts: job.counts,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Query parameters of the job listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobListQuery {
    /// Only jobs submitted under this project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

/// Response to a cancellation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub phase: JobPhase,
    /// `false` when a cancellation was already pending
    pub cancel_requested: bool,
}
