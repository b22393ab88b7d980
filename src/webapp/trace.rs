//! Per-request correlation span, shared by both tiers.

use axum::{
    extract::Request,
    middleware::Next,
    response::Response,
};
use tracing::{info_span, Instrument};

/// Six hex digits, enough to tell concurrent requests apart in the log
fn gen_id() -> String {
    format!("{:06x}", rand::random::<u32>() & 0xFFFFFF)
}

/// Run the request inside a fresh root span carrying a correlation id.
///
/// Jobs hold their connection open for the whole run, so everything logged
/// while a job executes under this request carries the same `id`.
pub async fn trace_request(request: Request, next: Next) -> Response {
    let id = gen_id();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let span = info_span!(parent: None, "httpd", %id, %method, %path);

    async move {
        let response = next.run(request).await;
        tracing::debug!(status = response.status().as_u16(), "Request handled");
        response
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_id_is_six_hex_digits() {
        let id = gen_id();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
