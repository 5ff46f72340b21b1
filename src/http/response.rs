//! JSON error payloads returned by the middleware.

use serde::Serialize;

/// Top-level error body: `{"error": {...}, "request_id": "..."}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
    /// Always present; `null` when no request id was assigned
    pub request_id: Option<String>,
}

/// Machine-readable error detail.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_in_seconds: Option<u64>,
}

impl ErrorEnvelope {
    /// The body sent with a 429.
    pub fn rate_limited(
        limit: u32,
        tier: &str,
        reset_in_seconds: u64,
        request_id: Option<String>,
    ) -> Self {
        Self {
            error: ErrorDetail {
                code: "rate_limited",
                message: format!(
                    "Rate limit of {} requests exceeded; retry in {} seconds",
                    limit, reset_in_seconds
                ),
                limit: Some(limit),
                tier: Some(tier.to_string()),
                reset_in_seconds: Some(reset_in_seconds),
            },
            request_id,
        }
    }
}
