//! Execution tier HTTP surface.
//!
//! Stages uploads into workspaces, runs them through the sandbox and either
//! stores the output for download or streams it straight back.

pub mod auth;
pub mod cleanup;
pub mod handlers;
pub mod models;
pub mod state;
pub mod trace;

pub use cleanup::cleanup_loop;
pub use state::ExecState;
pub use models::{
    attachment_disposition, ErrorResponse, HealthResponse, JobCompletedResponse, JobFailedResponse, JobResponse,
    error_response, error_response_with_details, error_not_found, error_internal,
};

use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use clap::Args;
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

use crate::config::GlobalConfig;
use crate::os::{JobRunner, WorkspaceManager};

/// Correlates a control-plane record with its execution-tier workspace
pub const JOB_ID_HEADER: &str = "x-job-id";

/// Longest pause between artifact sweeps
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "scrubbox execution tier",
        version = env!("CARGO_PKG_VERSION"),
        description = "Runs uploaded CSV or JSON files through a sandboxed anonymization worker.",
        license(
            name = "MIT OR Apache-2.0",
        ),
    ),
    paths(
        handlers::health::health_handler,
        handlers::jobs::submit_job_handler,
        handlers::output::get_job_output_handler,
        handlers::delete::delete_job_handler,
    ),
    components(
        schemas(
            models::ErrorResponse,
            models::HealthResponse,
            models::JobCompletedResponse,
            models::JobFailedResponse,
            handlers::jobs::SubmitJobForm,
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "Health", description = "Service health and status endpoints"),
        (name = "Jobs", description = "Run jobs and fetch their output"),
    )
)]
struct ApiDoc;

async fn openapi_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Routes for an already built state.
///
/// Every `/jobs` route sits behind the bearer check; health and the API
/// document do not.
pub fn exec_router(state: ExecState) -> Router {
    let jobs = Router::new()
        .route("/jobs", post(handlers::jobs::submit_job_handler))
        .route("/jobs/{job_id}", delete(handlers::delete::delete_job_handler))
        .route("/jobs/{job_id}/output", get(handlers::output::get_job_output_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_bearer))
        .layer(DefaultBodyLimit::max(state.upload_limit));

    Router::new()
        .route("/health", get(handlers::health::health_handler))
        .route("/api-docs/openapi.json", get(openapi_handler))
        .merge(jobs)
        .layer(middleware::from_fn(trace::trace_request))
        .with_state(state)
}

/// Creates the execution tier app with all routes and state configured
pub async fn create_app(config: &GlobalConfig) -> Result<(Router, ExecState)> {
    let secret = config.require_secret()?;
    let workspaces = WorkspaceManager::new(&config.data_dir).await
        .map_err(|e| anyhow::anyhow!("Failed to prepare data dir {}: {}", config.data_dir.display(), e))?;
    let runner = JobRunner::new(workspaces, config.sandbox());
    let upload_limit = usize::try_from(config.upload_limit)?;
    let state = ExecState::new(runner, secret, upload_limit, config.artifact_retain_secs);
    Ok((exec_router(state.clone()), state))
}

#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Write process ID to the specified file
    #[arg(long, value_name="./pid.file")]
    pub pid: Option<String>,

    /// Write readiness marker to the specified file once server is listening
    ///
    /// Useful for scripts that need to wait for the server to be fully started.
    #[arg(long)]
    pub ready_file: Option<String>,
}

impl ServeArgs {
    pub fn write_pid(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid {
            std::fs::write(pid_file, std::process::id().to_string())?;
        }
        Ok(())
    }

    pub fn write_ready(&self) -> Result<()> {
        if let Some(ready_file) = &self.ready_file {
            std::fs::write(ready_file, format!("ready {}", std::process::id()))?;
        }
        Ok(())
    }
}

pub async fn run(args: ServeArgs, config: &GlobalConfig) -> Result<()> {
    args.write_pid()?;

    let (app, state) = create_app(config).await?;

    if state.artifact_retain_secs > 0 {
        let interval = Duration::from_secs(state.artifact_retain_secs).min(MAX_SWEEP_INTERVAL);
        tokio::spawn(cleanup_loop(state.clone(), interval));
    }

    let addr = format!("0.0.0.0:{}", config.port());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(
        listen = %listener.local_addr()?,
        data_dir = %config.data_dir.display(),
        worker = ?state.runner.sandbox.command,
        require_sandbox = config.require_sandbox,
        upload_limit = state.upload_limit,
        secret = %self::state::secret_fingerprint(config.require_secret()?),
        "Execution tier started"
    );

    args.write_ready()?;
    axum::serve(listener, app).await?;

    Ok(())
}
