//! Job DTOs for the orchestrator API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::case::{CaseDescriptor, CaseResult};
use crate::domain::job::{InferenceParams, Job, JobState};
use crate::domain::log::{LogRecord, LogSlice};

/// Number of log events embedded in a status response
pub const RECENT_LOG_LEN: usize = 20;

/// Request to submit a new job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJob {
    pub cases: Vec<CaseDescriptor>,
    pub params: InferenceParams,
}

/// Response to a successful submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCreated {
    pub job_id: Uuid,
}

/// Response to an accepted cancel request; the job stops at its next case boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelAccepted {
    pub job_id: Uuid,
    pub state: JobState,
}

/// Full status of one job, as served by `GET /jobs/{id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: Uuid,
    pub state: JobState,
    pub params: InferenceParams,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub percent: u8,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub current_case: Option<String>,
    pub case_count: usize,
    pub case_results: Vec<CaseResult>,
    pub recent_log: Vec<LogRecord>,
    /// Cursor of the newest log event, for continuing with `/logs?since=`
    pub log_cursor: u64,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            state: job.state,
            params: job.params.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            cancel_requested: job.cancel_requested,
            percent: job.percent,
            current_case: job.current_case.clone(),
            case_count: job.cases.len(),
            case_results: job.case_results.clone(),
            recent_log: job.log.recent(RECENT_LOG_LEN),
            log_cursor: job.log.last_seq(),
        }
    }
}

/// Lightweight job entry for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub state: JobState,
    pub dataset: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub percent: u8,
    pub case_count: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            state: job.state,
            dataset: job.params.dataset.clone(),
            created_at: job.created_at,
            finished_at: job.finished_at,
            percent: job.percent,
            case_count: job.cases.len(),
            succeeded: job.succeeded_count(),
            failed: job.failed_count(),
        }
    }
}

/// Incremental log tail served by `GET /jobs/{id}/logs?since=<cursor>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPage {
    pub events: Vec<LogRecord>,
    pub next_cursor: u64,
    pub dropped: u64,
}

impl From<LogSlice> for LogPage {
    fn from(slice: LogSlice) -> Self {
        Self {
            events: slice.records,
            next_cursor: slice.next_cursor,
            dropped: slice.dropped,
        }
    }
}

/// Query string of the log endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub since: u64,
}

/// Health report served by `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub ok: bool,
    pub executable: Option<String>,
    pub executable_found: bool,
    pub active_jobs: usize,
}
