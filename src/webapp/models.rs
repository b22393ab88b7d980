use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use axum::{http::StatusCode, Json, response::IntoResponse};

use crate::os::{JobOutcome, JobReport};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

pub fn error_response(code: StatusCode, message: &str) -> axum::response::Response {
    error_response_with_details(code, message, None)
}

pub fn error_response_with_details(code: StatusCode, message: &str, details: Option<String>) -> axum::response::Response {
    (code, Json(ErrorResponse { error: message.to_string(), details })).into_response()
}

// Shortcut functions for common error codes
pub fn error_not_found(message: &str) -> axum::response::Response {
    error_response(StatusCode::NOT_FOUND, message)
}

pub fn error_internal(message: &str) -> axum::response::Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
}

/// `attachment; filename="processed_<name>"`, with quotes and control characters dropped
pub fn attachment_disposition(original_name: &str) -> String {
    let name: String = original_name
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect();
    format!("attachment; filename=\"processed_{}\"", name)
}

/// Buffered job finished; the output waits at `downloadUrl`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobCompletedResponse {
    #[schema(example = "completed")]
    pub status: String,
    pub job_id: String,
    #[schema(example = "/jobs/3f6c.../output")]
    pub download_url: String,
    pub output_size: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobFailedResponse {
    #[schema(example = "failed")]
    pub status: String,
    pub job_id: String,
    #[schema(example = "Processing error")]
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Either body the execution tier answers `POST /jobs` with.
/// Also what the control plane parses back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResponse {
    Completed(JobCompletedResponse),
    Failed(JobFailedResponse),
}

impl From<JobReport> for JobCompletedResponse {
    fn from(report: JobReport) -> Self {
        let download_url = report.locator
            .unwrap_or_else(|| crate::os::sink::output_locator(&report.job_id));
        Self {
            status: "completed".to_string(),
            job_id: report.job_id,
            download_url,
            output_size: report.output_size,
            duration_ms: report.duration_ms,
        }
    }
}

impl IntoResponse for JobOutcome {
    fn into_response(self) -> axum::response::Response {
        match self {
            JobOutcome::Completed(report) => {
                (StatusCode::OK, Json(JobCompletedResponse::from(report))).into_response()
            }
            JobOutcome::Failed { job_id, error } => {
                let body = JobFailedResponse {
                    status: "failed".to_string(),
                    job_id,
                    error: error.to_string(),
                    details: error.details(),
                };
                (error.status_code(), Json(body)).into_response()
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub service: Vec<String>,
    /// Which tier answered: "exec" or "control"
    pub role: String,
    pub service_uptime_secs: u64,
    /// Live workspaces (execution tier only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_jobs: Option<usize>,
}

impl HealthResponse {
    pub fn new(role: &str, started_at: std::time::Instant, live_jobs: Option<usize>) -> Self {
        Self {
            status: "ok".to_string(),
            service: vec![env!("CARGO_PKG_NAME").to_string(), env!("CARGO_PKG_VERSION").to_string()],
            role: role.to_string(),
            service_uptime_secs: started_at.elapsed().as_secs(),
            live_jobs,
        }
    }
}
