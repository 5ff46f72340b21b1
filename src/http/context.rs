//! Per-request correlation id, tracing span and access log line.

use std::time::Instant;

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

/// Header carrying the request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Header carrying the handling time in milliseconds.
pub const RESPONSE_TIME_HEADER: &str = "x-response-time";

/// Correlation id assigned to every inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Assign a request id and wrap the rest of the stack in a `request` span.
///
/// Must run outside the admission layer so rejections carry the id.
pub async fn request_context(mut request: Request, next: Next) -> Response {
    let request_id = RequestId::new();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    request.extensions_mut().insert(request_id);

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %path
    );

    let mut response = next.run(request).instrument(span.clone()).await;
    let elapsed_ms = start.elapsed().as_millis();

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    headers.insert(RESPONSE_TIME_HEADER, HeaderValue::from(elapsed_ms as u64));

    span.in_scope(|| {
        info!(
            status = response.status().as_u16(),
            duration_ms = elapsed_ms as u64,
            "{} {} -> {} ({}ms)",
            method,
            path,
            response.status().as_u16(),
            elapsed_ms
        );
    });

    response
}
