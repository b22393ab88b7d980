use axum::{extract::State, http::StatusCode, response::{IntoResponse, Response}, Json};

use super::super::{ExecState, HealthResponse};

/// Liveness plus the number of jobs currently running
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
pub async fn health_handler(State(state): State<ExecState>) -> Response {
    let live = state.workspaces().live_count().await;
    (StatusCode::OK, Json(HealthResponse::new("exec", state.started_at, Some(live)))).into_response()
}
