use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;

use crate::os::validate_job_id;
use super::super::{error_not_found, ExecState, ErrorResponse};

/// Download the stored output of a buffered job
#[utoipa::path(
    get,
    tag = "Jobs",
    path = "/jobs/{job_id}/output",
    params(
        ("job_id" = String, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Processed file", content_type = "text/csv"),
        (status = 200, description = "Processed file", content_type = "application/json"),
        (status = 403, description = "Missing or wrong bearer token", body = ErrorResponse),
        (status = 404, description = "Output not found", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
pub async fn get_job_output_handler(
    State(state): State<ExecState>,
    Path(job_id): Path<String>,
) -> Response {
    if validate_job_id(&job_id).is_err() {
        return error_not_found("Output not found");
    }
    let Some(artifact) = state.workspaces().artifact(&job_id).await else {
        return error_not_found("Output not found");
    };

    // The sweep may remove it between lookup and open
    let file = match tokio::fs::File::open(&artifact.path).await {
        Ok(file) => file,
        Err(_) => return error_not_found("Output not found"),
    };

    tracing::debug!(job_id = %job_id, bytes = artifact.size, "Serving output");
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, artifact.kind.content_type().to_string()),
            (header::CONTENT_LENGTH, artifact.size.to_string()),
        ],
        Body::from_stream(ReaderStream::new(file)),
    ).into_response()
}
