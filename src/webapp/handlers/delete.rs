use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::super::{ExecState, ErrorResponse};

/// Remove a job's stored output and any workspace remnant.
///
/// Deleting something already gone succeeds, so the control plane can retry
/// a delete that failed half way. A job that is still running is refused.
#[utoipa::path(
    delete,
    tag = "Jobs",
    path = "/jobs/{job_id}",
    params(
        ("job_id" = String, Path, description = "Job ID")
    ),
    responses(
        (status = 204, description = "Job removed, or there was nothing to remove"),
        (status = 400, description = "Invalid job id", body = ErrorResponse),
        (status = 403, description = "Missing or wrong bearer token", body = ErrorResponse),
        (status = 409, description = "Job is still running", body = ErrorResponse),
        (status = 500, description = "Filesystem error while removing", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
pub async fn delete_job_handler(
    State(state): State<ExecState>,
    Path(job_id): Path<String>,
) -> Response {
    match state.workspaces().remove_job(&job_id).await {
        Ok(()) => {
            tracing::info!(job_id = %job_id, "Job removed");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e.summary(), "Failed to remove job");
            e.into_response()
        }
    }
}
