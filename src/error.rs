//! Job failure taxonomy shared by both tiers.
//!
//! Every failure a job can hit maps to exactly one `JobError` variant, and
//! every variant knows the HTTP status it is reported with.

use axum::{http::StatusCode, response::{IntoResponse, Response}};
use thiserror::Error;

use crate::webapp::models::error_response_with_details;

#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// Missing or wrong shared-secret bearer token
    #[error("Forbidden")]
    AuthenticationFailure,

    /// Missing file, oversize input, disallowed type, malformed job id
    #[error("{message}")]
    Validation { message: String, status: StatusCode },

    /// A live workspace or record already exists for this job id
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    /// The worker process could not be launched at all
    #[error("Failed to launch worker")]
    SandboxStart(String),

    /// The worker ran and exited unsuccessfully
    #[error("Processing error")]
    SandboxRuntime {
        exit_code: Option<i32>,
        killed_by_timeout: bool,
        diagnostics: String,
    },

    /// Writing worker output to its destination failed mid-stream
    #[error("Failed to write output")]
    SinkWrite(String),

    /// The control plane's call to the execution tier failed
    #[error("Execution tier request failed")]
    Upstream { status: Option<u16>, message: String },

    #[error("Job store error")]
    Store(String),

    #[error("Workspace error")]
    Workspace(String),

    #[error("Internal error")]
    Internal(String),
}

impl JobError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into(), status: StatusCode::BAD_REQUEST }
    }

    pub fn too_large(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into(), status: StatusCode::PAYLOAD_TOO_LARGE }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthenticationFailure => StatusCode::FORBIDDEN,
            Self::Validation { status, .. } => *status,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::SandboxStart(_)
            | Self::SandboxRuntime { .. }
            | Self::SinkWrite(_)
            | Self::Upstream { .. }
            | Self::Store(_)
            | Self::Workspace(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Diagnostic text accompanying the short error message, if any
    pub fn details(&self) -> Option<String> {
        match self {
            Self::SandboxRuntime { exit_code, killed_by_timeout, diagnostics } => {
                if !diagnostics.is_empty() {
                    Some(diagnostics.clone())
                } else if *killed_by_timeout {
                    Some("Killed after exceeding the wall time limit".to_string())
                } else {
                    match exit_code {
                        Some(code) => Some(format!("Exited with code {}", code)),
                        None => Some("Exited without a status".to_string()),
                    }
                }
            }
            Self::SandboxStart(d)
            | Self::SinkWrite(d)
            | Self::Store(d)
            | Self::Workspace(d)
            | Self::Internal(d) => Some(d.clone()),
            Self::Upstream { message, .. } => Some(message.clone()),
            Self::AuthenticationFailure
            | Self::Validation { .. }
            | Self::Conflict(_)
            | Self::NotFound(_) => None,
        }
    }

    /// Single-line form stored as a job record's error message
    pub fn summary(&self) -> String {
        match self.details() {
            Some(details) => format!("{}: {}", self, details.trim_end()),
            None => self.to_string(),
        }
    }
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        error_response_with_details(self.status_code(), &self.to_string(), self.details())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(JobError::AuthenticationFailure.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(JobError::validation("No file uploaded!").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(JobError::too_large("too big").status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(JobError::SandboxStart("ENOENT".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            JobError::Upstream { status: Some(502), message: "down".into() }.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_runtime_details_prefer_diagnostics() {
        let err = JobError::SandboxRuntime {
            exit_code: Some(1),
            killed_by_timeout: false,
            diagnostics: "bad row 3\n".into(),
        };
        assert_eq!(err.details().as_deref(), Some("bad row 3\n"));
        assert_eq!(err.summary(), "Processing error: bad row 3");

        let silent = JobError::SandboxRuntime { exit_code: Some(2), killed_by_timeout: false, diagnostics: String::new() };
        assert_eq!(silent.details().as_deref(), Some("Exited with code 2"));
    }
}
