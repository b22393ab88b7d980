//! HTTP client for the execution tier.
//!
//! Every call carries the shared bearer secret and the job id header. Nothing
//! is retried: a failed call is reported once and the job stays failed.

use std::time::Duration;

use reqwest::{multipart, Client, StatusCode};

use crate::error::JobError;
use crate::os::Upload;
use crate::webapp::{ErrorResponse, JobResponse, JOB_ID_HEADER};

#[derive(Debug, thiserror::Error)]
pub enum ExecClientError {
    #[error("HTTP error: {context}: {source}")]
    Http {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Unexpected HTTP status {status}: {context}: {body}")]
    HttpStatus {
        context: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("Failed to read response body: {context}: {source}")]
    ResponseBodyRead {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Unexpected response body: {context}: {body}")]
    UnexpectedBody {
        context: &'static str,
        body: String,
    },
}

impl From<ExecClientError> for JobError {
    fn from(e: ExecClientError) -> Self {
        let status = match &e {
            ExecClientError::HttpStatus { status, .. } => Some(status.as_u16()),
            _ => None,
        };
        JobError::Upstream { status, message: e.to_string() }
    }
}

#[derive(Clone)]
pub struct ExecClient {
    http: Client,
    base_url: String,
    secret: String,
}

impl ExecClient {
    pub fn new(
        base_url: &str,
        secret: &str,
        connect_timeout: Option<Duration>,
        request_timeout: Option<Duration>,
    ) -> Result<Self, ExecClientError> {
        let mut builder = Client::builder();
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build()
            .map_err(|e| ExecClientError::Http { context: "Failed to build HTTP client", source: e })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str, job_id: &str) -> reqwest::RequestBuilder {
        self.http.request(method, self.url(path))
            .bearer_auth(&self.secret)
            .header(JOB_ID_HEADER, job_id)
    }

    /// Run a buffered job and wait for its outcome.
    ///
    /// A `failed` body is a normal answer, whatever its status code. Anything
    /// else that is not a `completed` body is an error.
    pub async fn create_job(
        &self,
        job_id: &str,
        upload: &Upload,
        preset: &str,
        file_type: &str,
    ) -> Result<JobResponse, ExecClientError> {
        let context = "POST /jobs";
        let file = multipart::Part::stream(upload.bytes.clone())
            .file_name(upload.original_name.clone())
            .mime_str(file_type)
            .map_err(|e| ExecClientError::Http { context, source: e })?;
        let form = multipart::Form::new()
            .part("file", file)
            .text("preset", preset.to_string())
            .text("fileType", file_type.to_string())
            .text("originalName", upload.original_name.clone())
            .text("sync", "false");

        let response = self.request(reqwest::Method::POST, "/jobs", job_id)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ExecClientError::Http { context, source: e })?;

        let status = response.status();
        let body = response.text().await
            .map_err(|e| ExecClientError::ResponseBodyRead { context, source: e })?;

        match serde_json::from_str::<JobResponse>(&body) {
            Ok(JobResponse::Completed(done)) if status.is_success() => Ok(JobResponse::Completed(done)),
            Ok(JobResponse::Failed(failed)) => Ok(JobResponse::Failed(failed)),
            _ if status.is_success() => Err(ExecClientError::UnexpectedBody { context, body }),
            _ => Err(ExecClientError::HttpStatus { context, status, body: error_text(&body) }),
        }
    }

    /// Fetch a stored output by its locator, ready to be streamed on
    pub async fn fetch_output(&self, job_id: &str, locator: &str) -> Result<reqwest::Response, JobError> {
        let context = "GET output";
        let response = self.request(reqwest::Method::GET, locator, job_id)
            .send()
            .await
            .map_err(|e| ExecClientError::Http { context, source: e })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(JobError::NotFound("Output not found".to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        Err(ExecClientError::HttpStatus { context, status, body: error_text(&body) }.into())
    }

    pub async fn delete_job(&self, job_id: &str) -> Result<(), ExecClientError> {
        let context = "DELETE /jobs/{id}";
        let response = self.request(reqwest::Method::DELETE, &format!("/jobs/{}", job_id), job_id)
            .send()
            .await
            .map_err(|e| ExecClientError::Http { context, source: e })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await
            .map_err(|e| ExecClientError::ResponseBodyRead { context, source: e })?;
        Err(ExecClientError::HttpStatus { context, status, body: error_text(&body) })
    }
}

/// The `error` field of a JSON error body, or the raw body
fn error_text(body: &str) -> String {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(err) => match err.details {
            Some(details) => format!("{}: {}", err.error, details),
            None => err.error,
        },
        Err(_) => body.to_string(),
    }
}
