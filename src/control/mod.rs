//! Control plane.
//!
//! Owns the persisted job records and the public polling/download API. Each
//! submission is forwarded to the execution tier in a single blocking call.

pub mod client;
pub mod handlers;
pub mod orchestrator;
pub mod state;
pub mod store;

pub use client::{ExecClient, ExecClientError};
pub use orchestrator::{Orchestrator, ValidJob};
pub use state::ControlState;
pub use store::{FileJobStore, JobPatch, JobRecord, JobStatus, JobStore, MemoryJobStore, NewJob, StoreError};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Json, Router,
};
use utoipa::OpenApi;

use crate::config::GlobalConfig;
use crate::webapp::{self, ServeArgs};

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "scrubbox control plane",
        version = env!("CARGO_PKG_VERSION"),
        description = "Submit CSV or JSON files for anonymization, poll their status and download the results.",
        license(
            name = "MIT OR Apache-2.0",
        ),
    ),
    paths(
        handlers::health_handler,
        handlers::create_job_handler,
        handlers::job_status_handler,
        handlers::download_job_handler,
        handlers::delete_job_handler,
    ),
    components(
        schemas(
            webapp::ErrorResponse,
            webapp::HealthResponse,
            webapp::handlers::jobs::SubmitJobForm,
            handlers::JobDescriptor,
            handlers::JobStatusResponse,
            handlers::DeleteJobResponse,
            store::JobStatus,
        )
    ),
    tags(
        (name = "Health", description = "Service health and status endpoints"),
        (name = "Jobs", description = "Submit, poll, download and delete jobs"),
    )
)]
struct ApiDoc;

async fn openapi_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

pub fn control_router(state: ControlState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/api-docs/openapi.json", get(openapi_handler))
        .route("/jobs", post(handlers::create_job_handler))
        .route("/jobs/{job_id}", get(handlers::job_status_handler).delete(handlers::delete_job_handler))
        .route("/jobs/{job_id}/download", get(handlers::download_job_handler))
        .layer(DefaultBodyLimit::max(state.upload_limit))
        .layer(middleware::from_fn(webapp::trace::trace_request))
        .with_state(state)
}

/// Creates the control plane app with all routes and state configured
pub async fn create_app(config: &GlobalConfig) -> Result<(Router, ControlState)> {
    let secret = config.require_secret()?;
    let exec_url = config.require_exec_url()?;

    let exec = ExecClient::new(
        exec_url,
        secret,
        config.connect_timeout.map(Duration::from_secs),
        config.request_timeout.map(Duration::from_secs),
    )?;

    let store: Arc<dyn JobStore> = match &config.store_dir {
        Some(dir) => Arc::new(FileJobStore::open(dir).await?),
        None => {
            tracing::warn!("No store dir configured; job records live in memory only");
            Arc::new(MemoryJobStore::new())
        }
    };

    let orchestrator = Orchestrator::new(store, exec, config.max_input_size);
    let state = ControlState::new(orchestrator, usize::try_from(config.upload_limit)?);
    Ok((control_router(state.clone()), state))
}

pub async fn run(args: ServeArgs, config: &GlobalConfig) -> Result<()> {
    args.write_pid()?;

    let (app, _state) = create_app(config).await?;

    let addr = format!("0.0.0.0:{}", config.port());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(
        listen = %listener.local_addr()?,
        exec_url = config.exec_url.as_deref().unwrap_or_default(),
        store_dir = ?config.store_dir,
        max_input_size = config.max_input_size,
        secret = %webapp::state::secret_fingerprint(config.require_secret()?),
        "Control plane started"
    );

    args.write_ready()?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        routing::delete,
    };
    use tower::ServiceExt;

    use crate::webapp::tests::{body_bytes, exec_state, file_part, submit_request, text_part, SECRET};

    const CSV: &[u8] = b"name,email\nalice,alice@example.com\nbob,bob@example.com\n";

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// A real execution tier on a loopback port
    async fn spawn_exec(command: &[&str]) -> (tempfile::TempDir, webapp::ExecState, String) {
        let (tmp, state) = exec_state(command).await;
        let url = serve(webapp::exec_router(state.clone())).await;
        (tmp, state, url)
    }

    fn control(exec_url: &str, secret: &str) -> (Router, MemoryJobStore) {
        let store = MemoryJobStore::new();
        let exec = ExecClient::new(exec_url, secret, Some(Duration::from_secs(5)), Some(Duration::from_secs(30))).unwrap();
        let orchestrator = Orchestrator::new(Arc::new(store.clone()), exec, 5 * 1024 * 1024);
        (control_router(ControlState::new(orchestrator, 20 * 1024 * 1024)), store)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn delete_req(uri: &str) -> Request<Body> {
        Request::builder().method("DELETE").uri(uri).body(Body::empty()).unwrap()
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_completed_job_round_trip_and_delete() {
        let (_tmp, exec, url) = spawn_exec(&["cat"]).await;
        let (app, store) = control(&url, SECRET);

        let request = submit_request("/jobs", None, Some("job-a"), &[file_part("people.csv", "text/csv", CSV)]);
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let descriptor = json(response).await;
        assert_eq!(descriptor["jobId"], "job-a");
        assert_eq!(descriptor["status"], "completed");
        assert_eq!(descriptor["pollUrl"], "/jobs/job-a");

        let status = json(app.clone().oneshot(get("/jobs/job-a")).await.unwrap()).await;
        assert_eq!(status["status"], "completed");
        assert_eq!(status["downloadUrl"], "/jobs/job-a/download");
        assert_eq!(status["outputSize"], CSV.len());
        assert_eq!(status["fileType"], "text/csv");
        assert_eq!(status["preset"], "default");

        let response = app.clone().oneshot(get("/jobs/job-a/download")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"processed_people.csv\""
        );
        assert_eq!(body_bytes(response).await, CSV);

        let response = app.clone().oneshot(delete_req("/jobs/job-a")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["message"], "Job deleted successfully");
        assert_eq!(store.len().await, 0);
        assert!(exec.workspaces().artifact("job-a").await.is_none());

        let response = app.oneshot(get("/jobs/job-a")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_wrong_secret_never_records_success() {
        let (tmp, exec, url) = spawn_exec(&["cat"]).await;
        let (app, store) = control(&url, "not-the-secret");

        let request = submit_request("/jobs", None, Some("job-b"), &[file_part("people.csv", "text/csv", CSV)]);
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let record = store.find_by_id("job-b").await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error_message.unwrap().contains("Forbidden"));
        assert!(record.download_url.is_none());

        assert_eq!(exec.workspaces().live_count().await, 0);
        let mut entries = tokio::fs::read_dir(tmp.path().join("workspaces")).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_worker_failure_is_recorded_with_diagnostics() {
        let (_tmp, _exec, url) = spawn_exec(&["sh", "-c", "cat >/dev/null; echo 'bad row 3' >&2; exit 1"]).await;
        let (app, _store) = control(&url, SECRET);

        let request = submit_request("/jobs", None, Some("job-c"), &[file_part("people.csv", "text/csv", CSV)]);
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json(response).await["status"], "failed");

        let status = json(app.clone().oneshot(get("/jobs/job-c")).await.unwrap()).await;
        assert_eq!(status["status"], "failed");
        assert!(status["errorMessage"].as_str().unwrap().contains("bad row 3"));
        assert!(status.get("downloadUrl").is_none());

        let response = app.oneshot(get("/jobs/job-c/download")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_sync_returns_attachment_bytes() {
        let (_tmp, _exec, url) = spawn_exec(&["cat"]).await;
        let (app, store) = control(&url, SECRET);

        let request = submit_request(
            "/jobs",
            None,
            Some("job-d"),
            &[file_part("people.csv", "text/csv", CSV), text_part("sync", "true")],
        );
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/csv");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"processed_people.csv\""
        );
        assert_eq!(body_bytes(response).await, CSV);

        let record = store.find_by_id("job-d").await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_upstream_delete_keeps_record() {
        let stub = Router::new().route(
            "/jobs/{job_id}",
            delete(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "disk on fire") }),
        );
        let url = serve(stub).await;
        let (app, store) = control(&url, SECRET);
        store.create(NewJob {
            job_id: "job-e".to_string(),
            original_name: "people.csv".to_string(),
            preset: "default".to_string(),
            file_type: "text/csv".to_string(),
            input_size: 10,
        }).await.unwrap();

        let response = app.oneshot(delete_req("/jobs/job-e")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json(response).await["error"], "Failed to delete job");
        assert!(store.find_by_id("job-e").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_while_processing_keeps_record() {
        let (_tmp, exec, url) = spawn_exec(&["sh", "-c", "sleep 1; cat"]).await;
        let (app, store) = control(&url, SECRET);

        let request = submit_request("/jobs", None, Some("job-slow"), &[file_part("people.csv", "text/csv", CSV)]);
        let submit = tokio::spawn(app.clone().oneshot(request));
        for _ in 0..100 {
            if store.find_by_id("job-slow").await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let response = app.clone().oneshot(delete_req("/jobs/job-slow")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let record = store.find_by_id("job-slow").await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Queued);

        let response = submit.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json(response).await["status"], "completed");
        assert!(exec.workspaces().artifact("job-slow").await.is_some());

        let response = app.oneshot(delete_req("/jobs/job-slow")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(store.find_by_id("job-slow").await.unwrap().is_none());
        assert!(exec.workspaces().artifact("job-slow").await.is_none());
    }

    #[tokio::test]
    async fn test_running_upstream_job_is_a_conflict() {
        let stub = Router::new().route(
            "/jobs/{job_id}",
            delete(|| async { (StatusCode::CONFLICT, axum::Json(serde_json::json!({"error": "Job job-r is still running"}))) }),
        );
        let url = serve(stub).await;
        let (app, store) = control(&url, SECRET);
        store.create(NewJob {
            job_id: "job-r".to_string(),
            original_name: "people.csv".to_string(),
            preset: "default".to_string(),
            file_type: "text/csv".to_string(),
            input_size: 10,
        }).await.unwrap();

        let response = app.oneshot(delete_req("/jobs/job-r")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(store.find_by_id("job-r").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_upstream_call_records_elapsed_millis() {
        let stub = Router::new().route(
            "/jobs",
            post(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                (StatusCode::INTERNAL_SERVER_ERROR, "worker pool exploded")
            }),
        );
        let url = serve(stub).await;
        let (app, store) = control(&url, SECRET);

        let request = submit_request("/jobs", None, Some("job-t"), &[file_part("people.csv", "text/csv", CSV)]);
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let record = store.find_by_id("job-t").await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        let duration_ms = record.duration_ms.unwrap();
        assert!((250..1000).contains(&duration_ms), "duration_ms = {}", duration_ms);
    }

    #[tokio::test]
    async fn test_submission_validation_happens_before_any_record() {
        let (app, store) = control("http://127.0.0.1:9", SECRET);

        let request = submit_request("/jobs", None, None, &[text_part("preset", "default")]);
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["error"], "File is required");

        let request = submit_request("/jobs", None, None, &[file_part("notes.txt", "text/plain", b"hello")]);
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let big = vec![b'a'; 5 * 1024 * 1024 + 1];
        let request = submit_request("/jobs", None, None, &[file_part("big.csv", "text/csv", &big)]);
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json(response).await["error"], "File too large. Maximum size is 5MB");

        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_job_id_conflicts() {
        let (_tmp, _exec, url) = spawn_exec(&["cat"]).await;
        let (app, _store) = control(&url, SECRET);

        for expected in [StatusCode::CREATED, StatusCode::CONFLICT] {
            let request = submit_request("/jobs", None, Some("twice"), &[file_part("people.csv", "text/csv", CSV)]);
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), expected);
        }
    }

    #[tokio::test]
    async fn test_health_reports_control_role() {
        let (app, _store) = control("http://127.0.0.1:9", SECRET);
        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(json(response).await["role"], "control");

        let response = app.oneshot(get("/api-docs/openapi.json")).await.unwrap();
        assert!(json(response).await["paths"]["/jobs/{job_id}/download"].is_object());
    }
}
