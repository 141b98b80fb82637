//! Job API Handlers
//!
//! HTTP endpoints for submitting, inspecting, cancelling and downloading jobs.
//! Every handler reads a snapshot and returns right away; none of them waits
//! on job execution.

use axum::{
    Json,
    body::Body,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{StatusCode, header},
    response::Response,
};
use segrun_core::dto::job::{
    CancelAccepted, JobCreated, JobStatusView, JobSummary, LogPage, LogQuery, SubmitJob,
};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::service::job_service;
use crate::state::AppState;

// =============================================================================
// Job Lifecycle Endpoints
// =============================================================================

/// POST /jobs
/// Validate a submission and start the job
pub async fn submit_job(
    State(state): State<AppState>,
    payload: Result<Json<SubmitJob>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<JobCreated>)> {
    let Json(req) = payload?;
    tracing::info!(
        "Submitting job: {} case(s), dataset {}",
        req.cases.len(),
        req.params.dataset
    );

    let job_id = job_service::submit_job(&state.manager, req, state.config.log_capacity)?;

    Ok((StatusCode::CREATED, Json(JobCreated { job_id })))
}

/// GET /jobs
/// List all known jobs
pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobSummary>> {
    tracing::debug!("Listing jobs");
    Json(job_service::list_jobs(&state.registry))
}

/// GET /jobs/{id}
/// Get the current status of a job
pub async fn get_job(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<JobStatusView>> {
    let Path(id) = id?;
    tracing::debug!("Getting job: {}", id);

    let job = job_service::get_job(&state.registry, id)?;

    Ok(Json(JobStatusView::from(&job)))
}

/// POST /jobs/{id}/cancel
/// Request cancellation; observed at the next case boundary
pub async fn cancel_job(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<(StatusCode, Json<CancelAccepted>)> {
    let Path(id) = id?;
    job_service::cancel_job(&state.registry, id)?;
    let job = job_service::get_job(&state.registry, id)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CancelAccepted {
            job_id: id,
            state: job.state,
        }),
    ))
}

// =============================================================================
// Log Endpoints
// =============================================================================

/// GET /jobs/{id}/logs?since=<cursor>
/// Get log events newer than the cursor
pub async fn get_job_logs(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    query: Result<Query<LogQuery>, QueryRejection>,
) -> ApiResult<Json<LogPage>> {
    let Path(id) = id?;
    let Query(query) = query?;
    tracing::debug!("Getting logs for job {} since {}", id, query.since);

    let slice = job_service::job_logs(&state.registry, id, query.since)?;

    Ok(Json(LogPage::from(slice)))
}

// =============================================================================
// Result Endpoint
// =============================================================================

/// GET /jobs/{id}/result
/// Stream the packaged archive of a finished job
pub async fn download_result(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Response> {
    let Path(id) = id?;
    let path = job_service::result_archive(&state.registry, id)?;

    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ApiError::Gone(format!("result of job {} is no longer available", id))
        } else {
            ApiError::InternalError(format!("failed to open {}: {}", path.display(), e))
        }
    })?;
    let length = file.metadata().await.ok().map(|m| m.len());

    tracing::info!("Serving result of job {}", id);

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.zip\"", id),
        );
    if let Some(length) = length {
        response = response.header(header::CONTENT_LENGTH, length);
    }

    response
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| ApiError::InternalError(e.to_string()))
}
