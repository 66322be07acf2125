//! Docprobe HTTP Client
//!
//! A simple, type-safe HTTP client for the Docprobe gateway API.
//!
//! # Example
//!
//! ```no_run
//! use docprobe_client::GatewayClient;
//! use docprobe_core::dto::job::SubmitAnalysis;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = GatewayClient::new("http://localhost:8080").with_user("alice");
//!
//!     let submitted = client.submit_analysis(&SubmitAnalysis {
//!         repository_url: "https://github.com/acme/widgets".to_string(),
//!         branch: "main".to_string(),
//!         include_folders: vec!["docs".to_string()],
//!         project_id: None,
//!     }).await?;
//!
//!     println!("Submitted job: {}", submitted.job_id);
//!     Ok(())
//! }
//! ```

pub mod error;
mod jobs;

// Re-export commonly used types
pub use error::{ClientError, Result};

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;

/// Header carrying the identity of the caller
const USER_ID_HEADER: &str = "x-user-id";

/// HTTP client for the Docprobe gateway API
#[derive(Debug, Clone)]
pub struct GatewayClient {
    /// Base URL of the gateway (e.g., "http://localhost:8080")
    base_url: String,
    /// Sent as `x-user-id` when set
    user_id: Option<String>,
    /// HTTP client instance
    client: Client,
}

impl GatewayClient {
    /// Create a new gateway client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the gateway API (e.g., "http://localhost:8080")
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new gateway client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            user_id: None,
            client,
        }
    }

    /// Act on behalf of `user_id`
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Get the base URL of the gateway
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.user_id {
            Some(user) => request.header(USER_ID_HEADER, user),
            None => request,
        }
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::debug!(status = status.as_u16(), body = %error_text, "gateway returned an error");
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response carrying a raw body
    async fn handle_bytes(&self, response: reqwest::Response) -> Result<Vec<u8>> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(response.bytes().await?.to_vec())
    }
}
