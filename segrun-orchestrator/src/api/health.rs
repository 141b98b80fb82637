//! Health Check API Handler
//!
//! Reports liveness together with the inference executable in use.

use axum::{Json, extract::State};
use segrun_core::dto::job::HealthReport;

use crate::state::AppState;

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthReport> {
    let executable = state.config.inference_exe.as_ref();
    Json(HealthReport {
        ok: true,
        executable: executable.map(|p| p.display().to_string()),
        executable_found: executable.is_some_and(|p| p.is_file()),
        active_jobs: state.registry.active_count(),
    })
}
