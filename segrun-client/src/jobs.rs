//! Job-related API endpoints

use std::path::Path;
use std::time::Duration;

use segrun_core::domain::log::LogRecord;
use segrun_core::dto::job::{
    CancelAccepted, HealthReport, JobCreated, JobStatusView, JobSummary, LogPage, SubmitJob,
};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::OrchestratorClient;
use crate::error::Result;

impl OrchestratorClient {
    /// Check orchestrator liveness and the inference executable it uses
    pub async fn health(&self) -> Result<HealthReport> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Job Lifecycle
    // =============================================================================

    /// Submit a batch of cases
    ///
    /// # Arguments
    /// * `req` - Cases and inference parameters
    ///
    /// # Returns
    /// The id of the created job
    pub async fn submit_job(&self, req: &SubmitJob) -> Result<JobCreated> {
        let url = format!("{}/jobs", self.base_url);
        let response = self.client.post(&url).json(req).send().await?;

        self.handle_response(response).await
    }

    /// Get the current status of a job
    pub async fn get_job(&self, job_id: Uuid) -> Result<JobStatusView> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// List all jobs known to the orchestrator
    pub async fn list_jobs(&self) -> Result<Vec<JobSummary>> {
        let url = format!("{}/jobs", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Request cancellation of a job
    ///
    /// The job stops at its next case boundary; a running invocation is
    /// terminated.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<CancelAccepted> {
        let url = format!("{}/jobs/{}/cancel", self.base_url, job_id);
        let response = self.client.post(&url).send().await?;

        self.handle_response(response).await
    }

    /// Poll a job until it reaches a terminal state
    ///
    /// Every round fetches the status and then the log events past the
    /// cursor, so the final call sees the complete log.
    ///
    /// # Arguments
    /// * `job_id` - The job UUID
    /// * `poll_interval` - Delay between two polling rounds
    /// * `on_progress` - Called every round with the status and the new log events
    ///
    /// # Returns
    /// The terminal status
    pub async fn wait_until_done(
        &self,
        job_id: Uuid,
        poll_interval: Duration,
        mut on_progress: impl FnMut(&JobStatusView, &[LogRecord]),
    ) -> Result<JobStatusView> {
        let mut cursor = 0;
        loop {
            let status = self.get_job(job_id).await?;
            let page = self.get_logs(job_id, cursor).await?;
            if page.dropped > 0 {
                tracing::debug!("{} log events of job {} were trimmed", page.dropped, job_id);
            }
            cursor = page.next_cursor;

            on_progress(&status, &page.events);
            if status.state.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    // =============================================================================
    // Job Logs
    // =============================================================================

    /// Get log events newer than `since`
    ///
    /// # Arguments
    /// * `job_id` - The job UUID
    /// * `since` - Cursor from a previous page, 0 for the start
    pub async fn get_logs(&self, job_id: Uuid, since: u64) -> Result<LogPage> {
        let url = format!("{}/jobs/{}/logs", self.base_url, job_id);
        let response = self
            .client
            .get(&url)
            .query(&[("since", since)])
            .send()
            .await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Results
    // =============================================================================

    /// Download the result archive of a finished job
    ///
    /// The body is streamed into `dest`; a partial file is removed when the
    /// transfer fails.
    ///
    /// # Returns
    /// Number of bytes written
    pub async fn download_result(&self, job_id: Uuid, dest: &Path) -> Result<u64> {
        let url = format!("{}/jobs/{}/result", self.base_url, job_id);
        let response = self.client.get(&url).send().await?;
        let response = self.check_status(response).await?;

        let written = match write_body(response, dest).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(dest).await;
                return Err(e);
            }
        };

        tracing::debug!("Downloaded {} bytes to {}", written, dest.display());
        Ok(written)
    }
}

async fn write_body(mut response: reqwest::Response, dest: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(dest).await?;
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use segrun_core::domain::case::CaseDescriptor;
    use segrun_core::domain::job::{InferenceParams, JobState};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn status_json(id: Uuid, state: &str, percent: u8) -> serde_json::Value {
        json!({
            "id": id,
            "state": state,
            "params": { "dataset": "101", "configuration": "3d_fullres", "folds": "0" },
            "created_at": Utc::now(),
            "cancel_requested": false,
            "percent": percent,
            "case_count": 1,
            "case_results": [],
            "recent_log": [],
            "log_cursor": 0
        })
    }

    #[tokio::test]
    async fn test_submit_job() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path("/jobs"))
            .and(body_partial_json(json!({ "params": { "dataset": "101" } })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "job_id": id })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OrchestratorClient::new(server.uri());
        let created = client
            .submit_job(&SubmitJob {
                cases: vec![CaseDescriptor::new("/data/a_0000.nii.gz")],
                params: InferenceParams::new("101"),
            })
            .await
            .unwrap();
        assert_eq!(created.job_id, id);
    }

    #[tokio::test]
    async fn test_validation_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({ "error": "validation error: no cases" })),
            )
            .mount(&server)
            .await;

        let client = OrchestratorClient::new(server.uri());
        let err = client
            .submit_job(&SubmitJob {
                cases: vec![],
                params: InferenceParams::new("101"),
            })
            .await
            .unwrap_err();
        assert!(err.is_client_error());
        assert!(err.to_string().contains("no cases"));
    }

    #[tokio::test]
    async fn test_get_unknown_job() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "error": "not found" })))
            .mount(&server)
            .await;

        let client = OrchestratorClient::new(server.uri());
        let err = client.get_job(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_logs_sends_cursor() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path(format!("/jobs/{}/logs", id)))
            .and(query_param("since", "7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "events": [{
                    "seq": 8,
                    "timestamp": Utc::now(),
                    "case_id": "liver",
                    "stage": "Inference",
                    "level": "Info",
                    "message": "50%|#####",
                    "percent": 50,
                    "is_error": false
                }],
                "next_cursor": 8,
                "dropped": 0
            })))
            .mount(&server)
            .await;

        let client = OrchestratorClient::new(server.uri());
        let page = client.get_logs(id, 7).await.unwrap();
        assert_eq!(page.next_cursor, 8);
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].event.percent, Some(50));
    }

    #[tokio::test]
    async fn test_wait_until_done_polls_to_terminal_state() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path(format!("/jobs/{}", id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(status_json(id, "Running", 40)))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/jobs/{}", id)))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(status_json(id, "Succeeded", 100)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/jobs/{}/logs", id)))
            .and(query_param("since", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "events": [{
                    "seq": 1,
                    "timestamp": Utc::now(),
                    "case_id": null,
                    "stage": "Setup",
                    "level": "Info",
                    "message": "job started",
                    "percent": null,
                    "is_error": false
                }],
                "next_cursor": 1,
                "dropped": 0
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/jobs/{}/logs", id)))
            .and(query_param("since", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "events": [],
                "next_cursor": 1,
                "dropped": 0
            })))
            .mount(&server)
            .await;

        let client = OrchestratorClient::new(server.uri());
        let mut seen = Vec::new();
        let mut messages = Vec::new();
        let status = client
            .wait_until_done(id, Duration::from_millis(5), |s, events| {
                seen.push(s.percent);
                messages.extend(events.iter().map(|r| r.event.message.clone()));
            })
            .await
            .unwrap();

        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(seen, vec![40, 40, 100]);
        assert_eq!(messages, vec!["job started"]);
    }

    #[tokio::test]
    async fn test_cancel_conflict() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path(format!("/jobs/{}/cancel", id)))
            .respond_with(
                ResponseTemplate::new(409).set_body_json(json!({ "error": "already finished" })),
            )
            .mount(&server)
            .await;

        let client = OrchestratorClient::new(server.uri());
        let err = client.cancel_job(id).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_download_result_writes_file() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        let payload = b"PK\x03\x04fake archive".to_vec();
        Mock::given(method("GET"))
            .and(path(format!("/jobs/{}/result", id)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("result.zip");
        let client = OrchestratorClient::new(server.uri());
        let written = client.download_result(id, &dest).await.unwrap();

        assert_eq!(written, payload.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_download_gone_leaves_no_file() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path(format!("/jobs/{}/result", id)))
            .respond_with(ResponseTemplate::new(410).set_body_json(json!({ "error": "gone" })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("result.zip");
        let client = OrchestratorClient::new(server.uri());
        let err = client.download_result(id, &dest).await.unwrap_err();

        assert!(err.is_gone());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "executable": "/opt/conda/bin/nnUNetv2_predict",
                "executable_found": true,
                "active_jobs": 2
            })))
            .mount(&server)
            .await;

        let client = OrchestratorClient::new(server.uri());
        let health = client.health().await.unwrap();
        assert!(health.ok);
        assert_eq!(health.active_jobs, 2);
    }
}
