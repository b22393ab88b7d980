use axum::{
    body::Body,
    extract::{Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::JobError;
use crate::webapp::handlers::jobs::{job_id_hint, read_submission, SubmitJobForm};
use crate::webapp::{attachment_disposition, error_response_with_details, ErrorResponse, HealthResponse};

use super::store::{JobRecord, JobStatus};
use super::ControlState;

/// Returned by `POST /jobs` unless a sync job completed
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub job_id: String,
    /// Already terminal by the time this is returned
    pub status: JobStatus,
    #[schema(example = "/jobs/3f6c...")]
    pub poll_url: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub original_name: String,
    pub preset: String,
    pub file_type: String,
    pub input_size: u64,
    pub output_size: Option<u64>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    /// Present once there is something to download
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl From<JobRecord> for JobStatusResponse {
    fn from(record: JobRecord) -> Self {
        let download_url = record.download_url.as_ref()
            .map(|_| format!("/jobs/{}/download", record.job_id));
        Self {
            job_id: record.job_id,
            status: record.status,
            original_name: record.original_name,
            preset: record.preset,
            file_type: record.file_type,
            input_size: record.input_size,
            output_size: record.output_size,
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            duration_ms: record.duration_ms,
            error_message: record.error_message,
            download_url,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeleteJobResponse {
    #[schema(example = "Job deleted successfully")]
    pub message: String,
}

/// Forward an upstream output body with attachment headers
async fn stream_download(state: &ControlState, record: &JobRecord) -> Result<Response, JobError> {
    let (_, upstream) = state.orchestrator.download(&record.job_id).await?;
    let content_type = upstream.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(&record.file_type)
        .to_string();

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, attachment_disposition(&record.original_name)),
        ],
        Body::from_stream(upstream.bytes_stream()),
    ).into_response())
}

/// Submit a file; blocks until the execution tier has finished with it
#[utoipa::path(
    post,
    tag = "Jobs",
    path = "/jobs",
    params(
        ("x-job-id" = Option<String>, Header, description = "Job id chosen by the caller, [A-Za-z0-9_-]{1,128}")
    ),
    request_body(content = SubmitJobForm, content_type = "multipart/form-data"),
    responses(
        (status = 201, description = "Job finished; poll for its outcome", body = JobDescriptor),
        (status = 200, description = "sync=true and the job completed: processed file bytes", content_type = "application/octet-stream"),
        (status = 400, description = "Missing file or unsupported type", body = ErrorResponse),
        (status = 409, description = "A job with this id already exists", body = ErrorResponse),
        (status = 413, description = "File too large", body = ErrorResponse),
        (status = 500, description = "Job store error", body = ErrorResponse)
    )
)]
pub async fn create_job_handler(
    State(state): State<ControlState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let submission = match read_submission(&mut multipart).await {
        Ok(submission) => submission,
        Err(e) => return e.into_response(),
    };
    let job = match state.orchestrator.validate(job_id_hint(&headers), submission) {
        Ok(job) => job,
        Err(e) => return e.into_response(),
    };
    let sync = job.sync;

    let record = match state.orchestrator.create(job).await {
        Ok(record) => record,
        Err(e) => return e.into_response(),
    };

    if sync && record.status == JobStatus::Completed {
        return match stream_download(&state, &record).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(job_id = %record.job_id, error = %e.summary(), "Sync download failed");
                error_response_with_details(e.status_code(), "Failed to download file", e.details())
            }
        };
    }

    let descriptor = JobDescriptor {
        poll_url: format!("/jobs/{}", record.job_id),
        job_id: record.job_id,
        status: record.status,
    };
    (StatusCode::CREATED, Json(descriptor)).into_response()
}

/// Read a job's stored record
#[utoipa::path(
    get,
    tag = "Jobs",
    path = "/jobs/{job_id}",
    params(
        ("job_id" = String, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job record", body = JobStatusResponse),
        (status = 404, description = "Job not found", body = ErrorResponse)
    )
)]
pub async fn job_status_handler(
    State(state): State<ControlState>,
    Path(job_id): Path<String>,
) -> Response {
    match state.orchestrator.status(&job_id).await {
        Ok(record) => (StatusCode::OK, Json(JobStatusResponse::from(record))).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Download a completed job's output
#[utoipa::path(
    get,
    tag = "Jobs",
    path = "/jobs/{job_id}/download",
    params(
        ("job_id" = String, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Processed file", content_type = "application/octet-stream"),
        (status = 404, description = "Job or output not found", body = ErrorResponse),
        (status = 409, description = "Job not completed", body = ErrorResponse),
        (status = 500, description = "Execution tier request failed", body = ErrorResponse)
    )
)]
pub async fn download_job_handler(
    State(state): State<ControlState>,
    Path(job_id): Path<String>,
) -> Response {
    let record = match state.orchestrator.status(&job_id).await {
        Ok(record) => record,
        Err(e) => return e.into_response(),
    };
    match stream_download(&state, &record).await {
        Ok(response) => response,
        Err(e @ JobError::Upstream { .. }) => {
            tracing::warn!(job_id = %job_id, error = %e.summary(), "Download failed");
            error_response_with_details(e.status_code(), "Failed to download file", e.details())
        }
        Err(e) => e.into_response(),
    }
}

/// Delete a job on the execution tier, then forget it
#[utoipa::path(
    delete,
    tag = "Jobs",
    path = "/jobs/{job_id}",
    params(
        ("job_id" = String, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job deleted", body = DeleteJobResponse),
        (status = 404, description = "Job not found", body = ErrorResponse),
        (status = 409, description = "Job is still running; the record is kept", body = ErrorResponse),
        (status = 500, description = "Execution tier refused; the record is kept", body = ErrorResponse)
    )
)]
pub async fn delete_job_handler(
    State(state): State<ControlState>,
    Path(job_id): Path<String>,
) -> Response {
    match state.orchestrator.delete(&job_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(DeleteJobResponse { message: "Job deleted successfully".to_string() }),
        ).into_response(),
        Err(e @ (JobError::NotFound(_) | JobError::Conflict(_))) => e.into_response(),
        Err(e) => error_response_with_details(e.status_code(), "Failed to delete job", Some(e.summary())),
    }
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
pub async fn health_handler(State(state): State<ControlState>) -> Response {
    (StatusCode::OK, Json(HealthResponse::new("control", state.started_at, None))).into_response()
}
