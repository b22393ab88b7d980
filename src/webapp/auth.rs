//! Shared-secret bearer check for the execution tier.
//!
//! Runs as a route layer, so a rejected request never reaches the multipart
//! reader and never touches the workspace root.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::JobError;
use super::state::{secret_digest, ExecState};

/// Token from `Authorization: Bearer <token>`, if present
pub fn bearer_token(request: &Request) -> Option<&str> {
    request.headers()
        .get(header::AUTHORIZATION)?
        .to_str().ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

pub async fn require_bearer(State(state): State<ExecState>, request: Request, next: Next) -> Response {
    // Digests are fixed length, so the comparison does not leak the secret's length
    let authorized = bearer_token(&request)
        .map(|token| secret_digest(token) == state.secret_digest)
        .unwrap_or(false);

    if !authorized {
        tracing::warn!(path = %request.uri().path(), "Rejected request without a valid bearer token");
        return JobError::AuthenticationFailure.into_response();
    }
    next.run(request).await
}
