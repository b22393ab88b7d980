//! Job lifecycle on the control plane.
//!
//! A record is created `queued`, one blocking call goes to the execution
//! tier, and the record moves to `completed` or `failed` as soon as that
//! call returns. Nothing ever observes a job "processing".

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::JobError;
use crate::os::{validate_job_id, OutputKind, Upload};
use crate::prelude::{format_size, unix_now};
use crate::webapp::handlers::jobs::Submission;
use crate::webapp::JobResponse;

use super::client::{ExecClient, ExecClientError};
use super::store::{JobPatch, JobRecord, JobStatus, JobStore, NewJob};

/// A submission that passed validation
#[derive(Debug, Clone)]
pub struct ValidJob {
    pub job_id: Option<String>,
    pub upload: Upload,
    pub kind: OutputKind,
    pub preset: String,
    pub sync: bool,
}

#[derive(Clone)]
pub struct Orchestrator {
    pub store: Arc<dyn JobStore>,
    pub exec: ExecClient,
    pub max_input_size: u64,
    /// Ids whose execution-tier call has not returned yet
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Marks a job as in flight until dropped, including when the request
/// future is cancelled half way
struct InFlight {
    jobs: Arc<Mutex<HashSet<String>>>,
    job_id: String,
}

impl InFlight {
    fn enter(jobs: &Arc<Mutex<HashSet<String>>>, job_id: &str) -> Self {
        lock(jobs).insert(job_id.to_string());
        Self { jobs: jobs.clone(), job_id: job_id.to_string() }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.jobs).remove(&self.job_id);
    }
}

fn lock(jobs: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Accept only CSV and JSON, by declared type first, then by extension
fn accepted_kind(content_type: Option<&str>, original_name: &str) -> Option<OutputKind> {
    let declared = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase());
    match declared.as_deref() {
        Some("text/csv") => return Some(OutputKind::Csv),
        Some("application/json") => return Some(OutputKind::Json),
        _ => {}
    }
    Path::new(original_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(OutputKind::from_extension)
}

/// Error text recorded for a failed job
fn failure_message(error: &str, details: Option<&str>) -> String {
    match details.map(str::trim_end).filter(|d| !d.is_empty() && *d != error) {
        Some(details) => format!("{}: {}", error, details),
        None => error.to_string(),
    }
}

impl Orchestrator {
    pub fn new(store: Arc<dyn JobStore>, exec: ExecClient, max_input_size: u64) -> Self {
        Self { store, exec, max_input_size, in_flight: Arc::default() }
    }

    /// Check a submission before any record exists
    pub fn validate(&self, job_id: Option<&str>, submission: Submission) -> Result<ValidJob, JobError> {
        let upload = match submission.upload {
            Some(upload) if !upload.bytes.is_empty() => upload,
            _ => return Err(JobError::validation("File is required")),
        };
        if upload.bytes.len() as u64 > self.max_input_size {
            return Err(JobError::too_large(format!(
                "File too large. Maximum size is {}",
                format_size(self.max_input_size)
            )));
        }
        let kind = accepted_kind(upload.content_type.as_deref(), &upload.original_name)
            .ok_or_else(|| JobError::validation("Invalid file type. Only CSV and JSON are supported"))?;
        if let Some(job_id) = job_id {
            validate_job_id(job_id)?;
        }

        Ok(ValidJob {
            job_id: job_id.map(str::to_string),
            upload,
            kind,
            preset: submission.preset.filter(|p| !p.is_empty()).unwrap_or_else(|| "default".to_string()),
            sync: submission.sync,
        })
    }

    /// Create the record, run the job on the execution tier and store the
    /// terminal outcome. Returns the updated record.
    ///
    /// An execution-tier failure is recorded as `failed` and returned as a
    /// normal record; only store failures are errors here.
    pub async fn create(&self, job: ValidJob) -> Result<JobRecord, JobError> {
        let job_id = job.job_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let file_type = job.kind.content_type();

        let record = self.store.create(NewJob {
            job_id: job_id.clone(),
            original_name: job.upload.original_name.clone(),
            preset: job.preset.clone(),
            file_type: file_type.to_string(),
            input_size: job.upload.bytes.len() as u64,
        }).await?;
        tracing::info!(job_id = %job_id, bytes = record.input_size, preset = %record.preset, "Job queued");

        let _in_flight = InFlight::enter(&self.in_flight, &job_id);
        let started_at = unix_now();
        let clock = Instant::now();
        let response = self.exec.create_job(&job_id, &job.upload, &job.preset, file_type).await;

        let patch = match response {
            Ok(JobResponse::Completed(done)) => {
                tracing::info!(job_id = %job_id, bytes = done.output_size, duration_ms = done.duration_ms, "Job completed");
                JobPatch {
                    status: Some(JobStatus::Completed),
                    output_size: Some(done.output_size),
                    duration_ms: Some(done.duration_ms),
                    download_url: Some(done.download_url),
                    ..Default::default()
                }
            }
            Ok(JobResponse::Failed(failed)) => {
                let message = failure_message(&failed.error, failed.details.as_deref());
                tracing::warn!(job_id = %job_id, error = %message, "Job failed");
                JobPatch {
                    status: Some(JobStatus::Failed),
                    error_message: Some(message),
                    ..Default::default()
                }
            }
            Err(e) => {
                let error = JobError::from(e);
                tracing::warn!(job_id = %job_id, error = %error.summary(), "Execution tier call failed");
                JobPatch {
                    status: Some(JobStatus::Failed),
                    error_message: Some(error.summary()),
                    ..Default::default()
                }
            }
        };

        let patch = JobPatch {
            started_at: Some(started_at),
            finished_at: Some(unix_now()),
            duration_ms: patch.duration_ms.or(Some(clock.elapsed().as_millis() as u64)),
            ..patch
        };

        self.store.update(&job_id, patch).await.map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Failed to record job outcome");
            JobError::from(e)
        })
    }

    /// Re-read the stored record; never touches the execution tier
    pub async fn status(&self, job_id: &str) -> Result<JobRecord, JobError> {
        self.store.find_by_id(job_id).await?
            .ok_or_else(|| JobError::NotFound("Job not found".to_string()))
    }

    /// Open the stored output of a completed job
    pub async fn download(&self, job_id: &str) -> Result<(JobRecord, reqwest::Response), JobError> {
        let record = self.status(job_id).await?;
        if record.status != JobStatus::Completed {
            return Err(JobError::Conflict(format!("Job not completed (status: {})", record.status)));
        }
        let Some(locator) = record.download_url.as_deref() else {
            return Err(JobError::NotFound("Output not found".to_string()));
        };
        let response = self.exec.fetch_output(&record.job_id, locator).await?;
        Ok((record, response))
    }

    /// Delete the execution-tier side first, then the record.
    ///
    /// If the execution tier refuses or cannot be reached the record is kept,
    /// so the control plane never forgets a job whose files still exist. A
    /// job still being processed is refused with `Conflict`.
    pub async fn delete(&self, job_id: &str) -> Result<(), JobError> {
        self.status(job_id).await?;
        if lock(&self.in_flight).contains(job_id) {
            return Err(JobError::Conflict(format!("Job {} is still running", job_id)));
        }

        if let Err(e) = self.exec.delete_job(job_id).await {
            let error = match e {
                ExecClientError::HttpStatus { status, .. } if status == reqwest::StatusCode::CONFLICT => {
                    JobError::Conflict(format!("Job {} is still running", job_id))
                }
                e => JobError::from(e),
            };
            tracing::warn!(job_id = %job_id, error = %error.summary(), "Execution tier delete failed; record kept");
            return Err(error);
        }

        self.store.delete(job_id).await?;
        tracing::info!(job_id = %job_id, "Job deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::store::MemoryJobStore;
    use bytes::Bytes;

    fn orchestrator(max: u64) -> Orchestrator {
        let exec = ExecClient::new("http://127.0.0.1:9", "s", None, None).unwrap();
        Orchestrator::new(Arc::new(MemoryJobStore::new()), exec, max)
    }

    fn submission(name: &str, content_type: Option<&str>, body: &'static [u8]) -> Submission {
        Submission {
            upload: Some(Upload {
                bytes: Bytes::from_static(body),
                original_name: name.to_string(),
                content_type: content_type.map(str::to_string),
            }),
            ..Default::default()
        }
    }

    fn status_of(err: JobError) -> u16 {
        err.status_code().as_u16()
    }

    #[test]
    fn test_validation_rules() {
        let orch = orchestrator(8);

        let err = orch.validate(None, Submission::default()).unwrap_err();
        assert_eq!(err.to_string(), "File is required");
        assert_eq!(status_of(err), 400);

        let err = orch.validate(None, submission("big.csv", Some("text/csv"), b"123456789")).unwrap_err();
        assert_eq!(status_of(err), 413);

        let err = orch.validate(None, submission("notes.txt", Some("text/plain"), b"hi")).unwrap_err();
        assert_eq!(err.to_string(), "Invalid file type. Only CSV and JSON are supported");

        let ok = orch.validate(None, submission("rows.json", None, b"[]")).unwrap();
        assert_eq!(ok.kind, OutputKind::Json);
        assert_eq!(ok.preset, "default");

        let ok = orch.validate(Some("abc"), submission("a.bin", Some("text/csv; charset=utf-8"), b"a")).unwrap();
        assert_eq!(ok.kind, OutputKind::Csv);
        assert_eq!(ok.job_id.as_deref(), Some("abc"));

        assert!(orch.validate(Some("../x"), submission("a.csv", Some("text/csv"), b"a")).is_err());
    }

    #[test]
    fn test_size_limit_message() {
        let orch = orchestrator(5 * 1024 * 1024);
        let err = orch.validate(None, Submission {
            upload: Some(Upload {
                bytes: Bytes::from(vec![b'a'; 5 * 1024 * 1024 + 1]),
                original_name: "big.csv".to_string(),
                content_type: Some("text/csv".to_string()),
            }),
            ..Default::default()
        }).unwrap_err();
        assert_eq!(err.to_string(), "File too large. Maximum size is 5MB");
    }

    #[test]
    fn test_failure_message() {
        assert_eq!(failure_message("Processing error", Some("bad row 3\n")), "Processing error: bad row 3");
        assert_eq!(failure_message("Processing error", None), "Processing error");
        assert_eq!(failure_message("Forbidden", Some("Forbidden")), "Forbidden");
    }

    #[tokio::test]
    async fn test_unreachable_exec_tier_records_failure() {
        let orch = orchestrator(1024);
        let job = orch.validate(Some("offline"), submission("a.csv", Some("text/csv"), b"a,b\n")).unwrap();

        let record = orch.create(job).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error_message.unwrap().contains("Execution tier request failed"));
        assert!(record.download_url.is_none());
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let orch = orchestrator(1024);
        assert_eq!(status_of(orch.status("ghost").await.unwrap_err()), 404);
        assert_eq!(status_of(orch.delete("ghost").await.unwrap_err()), 404);
    }
}
