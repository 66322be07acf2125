//! Job-related API endpoints

use crate::GatewayClient;
use crate::error::Result;
use docprobe_core::domain::use_case::UseCaseRecord;
use docprobe_core::dto::job::{
    CancelResponse, JobListQuery, JobStatusView, JobSummary, SubmitAnalysis,
    SubmitAnalysisResponse,
};
use uuid::Uuid;

impl GatewayClient {
    /// Submit a repository for analysis
    ///
    /// # Returns
    /// The id of the created job
    pub async fn submit_analysis(&self, req: &SubmitAnalysis) -> Result<SubmitAnalysisResponse> {
        let url = format!("{}/api/analyze", self.base_url);
        let response = self
            .authorize(self.client.post(&url))
            .json(req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Get the full status of a job
    pub async fn get_job(&self, job_id: Uuid) -> Result<JobStatusView> {
        let url = format!("{}/api/jobs/{}", self.base_url, job_id);
        let response = self.authorize(self.client.get(&url)).send().await?;

        self.handle_response(response).await
    }

    /// List the caller's jobs, newest first
    pub async fn list_jobs(&self) -> Result<Vec<JobSummary>> {
        let url = format!("{}/api/jobs", self.base_url);
        let response = self.authorize(self.client.get(&url)).send().await?;

        self.handle_response(response).await
    }

    /// List the caller's jobs submitted under `project_id`, newest first
    pub async fn list_jobs_in_project(&self, project_id: &str) -> Result<Vec<JobSummary>> {
        let url = format!("{}/api/jobs", self.base_url);
        let query = JobListQuery {
            project_id: Some(project_id.to_string()),
        };
        let response = self
            .authorize(self.client.get(&url))
            .query(&query)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Download a file from the data directory of a job
    ///
    /// # Arguments
    /// * `path` - Path relative to the job's data directory, e.g. `report.json`
    pub async fn get_job_file(&self, job_id: Uuid, path: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/api/jobs/{}/files/{}",
            self.base_url,
            job_id,
            path.trim_start_matches('/')
        );
        let response = self.authorize(self.client.get(&url)).send().await?;

        self.handle_bytes(response).await
    }

    /// Get one use case record of a job
    ///
    /// # Arguments
    /// * `index` - 0-based position of the use case
    pub async fn get_use_case(&self, job_id: Uuid, index: u32) -> Result<UseCaseRecord> {
        let url = format!("{}/api/jobs/{}/use-cases/{}", self.base_url, job_id, index);
        let response = self.authorize(self.client.get(&url)).send().await?;

        self.handle_response(response).await
    }

    /// Request cancellation of a job
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<CancelResponse> {
        let url = format!("{}/api/jobs/{}/cancel", self.base_url, job_id);
        let response = self.authorize(self.client.post(&url)).send().await?;

        self.handle_response(response).await
    }
}
