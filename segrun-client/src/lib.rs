//! Segrun HTTP Client
//!
//! A typed HTTP client for the segrun orchestrator API, shared by the CLI and
//! any other tool that submits segmentation jobs.
//!
//! # Example
//!
//! ```no_run
//! use segrun_client::OrchestratorClient;
//! use segrun_core::domain::case::CaseDescriptor;
//! use segrun_core::domain::job::InferenceParams;
//! use segrun_core::dto::job::SubmitJob;
//!
//! # async fn example() -> segrun_client::Result<()> {
//! let client = OrchestratorClient::new("http://localhost:8000");
//!
//! let created = client
//!     .submit_job(&SubmitJob {
//!         cases: vec![CaseDescriptor::new("/data/liver_0000.nii.gz")],
//!         params: InferenceParams::new("101"),
//!     })
//!     .await?;
//!
//! println!("Submitted job: {}", created.job_id);
//! # Ok(())
//! # }
//! ```

pub mod error;
mod jobs;

// Re-export commonly used types
pub use error::{ClientError, Result};
pub use segrun_core::dto::job::{JobStatusView, LogPage};

use reqwest::Client;
use serde::de::DeserializeOwned;

/// HTTP client for the segrun orchestrator API
///
/// Covers job submission, status polling, log tailing, cancellation and
/// result download.
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    /// Base URL of the orchestrator (e.g., "http://localhost:8000")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl OrchestratorClient {
    /// Create a new orchestrator client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the orchestrator API (e.g., "http://localhost:8000")
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new orchestrator client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the orchestrator API
    /// * `client` - A configured reqwest Client
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the orchestrator
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Fail on a non-success status, otherwise hand the response back
    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(response)
    }

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        self.check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }
}
