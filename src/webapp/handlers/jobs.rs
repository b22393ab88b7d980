use axum::{
    body::Body,
    extract::{Multipart, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tokio_stream::wrappers::ReceiverStream;
use utoipa::ToSchema;

use crate::error::JobError;
use crate::os::sink::BodyChunk;
use crate::os::{JobOutcome, OutputKind, PassthroughSink, Upload, Workspace};
use super::super::{
    attachment_disposition, error_internal, ExecState, ErrorResponse, JobCompletedResponse, JobFailedResponse,
    JOB_ID_HEADER,
};

/// Multipart body of `POST /jobs`
#[derive(Debug, ToSchema)]
#[schema(rename_all = "camelCase")]
pub struct SubmitJobForm {
    /// The CSV or JSON file to anonymize
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
    /// "true" streams the result back instead of storing it
    #[schema(example = "false")]
    pub sync: Option<String>,
    #[schema(example = "default")]
    pub preset: Option<String>,
    #[schema(example = "text/csv")]
    pub file_type: Option<String>,
    /// Overrides the uploaded file's name
    pub original_name: Option<String>,
}

/// Parsed submission, before admission
#[derive(Debug, Default)]
pub struct Submission {
    pub upload: Option<Upload>,
    pub sync: bool,
    pub preset: Option<String>,
    pub file_type: Option<String>,
}

/// Read every field of a job submission form. Unknown fields are ignored.
pub async fn read_submission(multipart: &mut Multipart) -> Result<Submission, JobError> {
    let mut submission = Submission::default();
    let mut original_name: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(JobError::Validation { message: e.body_text(), status: e.status() }),
        };
        let name = field.name().unwrap_or("").to_string();
        if name == "file" {
            let file_name = field.file_name().unwrap_or("upload").to_string();
            let content_type = field.content_type().map(str::to_string);
            let bytes = field.bytes().await
                .map_err(|e| JobError::Validation { message: e.body_text(), status: e.status() })?;
            submission.upload = Some(Upload { bytes, original_name: file_name, content_type });
            continue;
        }

        let value = field.text().await
            .map_err(|e| JobError::Validation { message: e.body_text(), status: e.status() })?;
        match name.as_str() {
            "sync" => submission.sync = value.trim().eq_ignore_ascii_case("true"),
            "preset" => submission.preset = Some(value),
            "fileType" => submission.file_type = Some(value),
            "originalName" if !value.is_empty() => original_name = Some(value),
            _ => {}
        }
    }

    if let (Some(upload), Some(name)) = (submission.upload.as_mut(), original_name) {
        upload.original_name = name;
    }
    if let Some(upload) = submission.upload.as_mut() {
        if upload.content_type.is_none() {
            upload.content_type = submission.file_type.clone();
        }
    }
    Ok(submission)
}

/// Job id header value, if the caller supplied one
pub fn job_id_hint(headers: &HeaderMap) -> Option<&str> {
    headers.get(JOB_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Run one job and answer when it is done
#[utoipa::path(
    post,
    tag = "Jobs",
    path = "/jobs",
    params(
        ("x-job-id" = Option<String>, Header, description = "Job id chosen by the caller, [A-Za-z0-9_-]{1,128}")
    ),
    request_body(content = SubmitJobForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Buffered job completed", body = JobCompletedResponse),
        (status = 200, description = "sync=true: processed file bytes", content_type = "application/octet-stream"),
        (status = 400, description = "No file uploaded or invalid job id", body = ErrorResponse),
        (status = 403, description = "Missing or wrong bearer token", body = ErrorResponse),
        (status = 409, description = "A job with this id is already running", body = ErrorResponse),
        (status = 500, description = "Worker failed", body = JobFailedResponse)
    ),
    security(("bearer" = []))
)]
pub async fn submit_job_handler(
    State(state): State<ExecState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let submission = match read_submission(&mut multipart).await {
        Ok(submission) => submission,
        Err(e) => return e.into_response(),
    };

    let workspace = match state.workspaces().admit(job_id_hint(&headers), submission.upload).await {
        Ok(ws) => ws,
        Err(e) => return e.into_response(),
    };
    tracing::info!(
        job_id = %workspace.job_id,
        bytes = workspace.input_size,
        sync = submission.sync,
        preset = submission.preset.as_deref().unwrap_or("default"),
        "Job admitted"
    );

    if submission.sync {
        run_passthrough(&state, workspace).await
    } else {
        state.runner.run_buffered(workspace).await.into_response()
    }
}

/// Stream the worker's output straight back to the caller.
///
/// Until the first output byte the job can still answer with a plain error
/// response. Once bytes have been sent the status line is already out, and a
/// later failure shows up only as a trailing error payload in the body.
async fn run_passthrough(state: &ExecState, workspace: Workspace) -> Response {
    let kind = workspace.output_kind;
    let original_name = workspace.original_name.clone();
    let job_id = workspace.job_id.clone();

    let (sink, body, started) = PassthroughSink::new(state.passthrough_depth());
    let mut outcome = state.runner.launch(workspace, Box::new(sink)).await;

    tokio::select! {
        biased;
        result = &mut outcome => match result {
            Ok(JobOutcome::Completed(_)) => attachment_response(kind, &original_name, body),
            Ok(failed) => failed.into_response(),
            Err(_) => {
                tracing::error!(job_id = %job_id, "Job outcome was lost");
                error_internal("Internal error")
            }
        },
        Ok(()) = started => attachment_response(kind, &original_name, body),
    }
}

fn attachment_response(kind: OutputKind, original_name: &str, body: tokio::sync::mpsc::Receiver<BodyChunk>) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, kind.content_type().to_string()),
            (header::CONTENT_DISPOSITION, attachment_disposition(original_name)),
        ],
        Body::from_stream(ReceiverStream::new(body)),
    ).into_response()
}
