//! Admission middleware: derive the rate-limit key, consult the limiter and
//! either forward the request or answer 429.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, info};

use super::context::RequestId;
use super::response::ErrorEnvelope;
use crate::config::RateLimitingConfig;
use crate::ratelimit::{RateLimitDecision, RateLimitKey, RateLimiter};

const FORWARDED_FOR: &str = "x-forwarded-for";

/// An authenticated caller, attached to the request by an upstream auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Stable principal identifier
    pub id: String,
    /// Subscription tier, if any
    pub tier: Option<String>,
}

impl Principal {
    /// Create a principal with an optional tier.
    pub fn new(id: impl Into<String>, tier: Option<String>) -> Self {
        Self {
            id: id.into(),
            tier,
        }
    }
}

/// State shared by every invocation of the admission middleware.
#[derive(Debug, Clone)]
pub struct AdmissionState {
    limiter: Arc<RateLimiter>,
    exempt_paths: Arc<[String]>,
    trust_forwarded_for: bool,
    expose_headers: bool,
}

impl AdmissionState {
    /// Create admission state with no exemptions.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            exempt_paths: Arc::from(Vec::<String>::new()),
            trust_forwarded_for: false,
            expose_headers: true,
        }
    }

    /// Create admission state from the rate limiting configuration.
    pub fn from_config(limiter: Arc<RateLimiter>, config: &RateLimitingConfig) -> Self {
        Self {
            limiter,
            exempt_paths: Arc::from(config.exempt_paths.clone()),
            trust_forwarded_for: config.trust_forwarded_for,
            expose_headers: config.expose_headers,
        }
    }

    /// Exempt the given paths from admission control.
    pub fn with_exempt_paths(mut self, paths: impl IntoIterator<Item = String>) -> Self {
        self.exempt_paths = paths.into_iter().collect();
        self
    }

    /// Take the client address from the first `X-Forwarded-For` hop.
    pub fn with_trusted_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    /// The limiter behind this middleware.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|exempt| exempt == path)
    }
}

/// Derive the key a request is limited against.
///
/// Precedence: authenticated principal, then client address, then the shared
/// anonymous bucket.
pub fn derive_key(request: &Request, trust_forwarded_for: bool) -> RateLimitKey {
    if let Some(principal) = request.extensions().get::<Principal>() {
        return RateLimitKey::principal(principal.id.clone(), principal.tier.clone());
    }

    if trust_forwarded_for {
        if let Some(ip) = forwarded_client(request.headers()) {
            return RateLimitKey::Address(ip);
        }
    }

    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => RateLimitKey::Address(addr.ip()),
        None => RateLimitKey::Unidentified,
    }
}

/// First hop of `X-Forwarded-For`, if it parses as an address.
fn forwarded_client(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// The admission middleware, for use with `axum::middleware::from_fn_with_state`.
pub async fn admission(
    State(state): State<AdmissionState>,
    mut request: Request,
    next: Next,
) -> Response {
    if state.is_exempt(request.uri().path()) {
        return next.run(request).await;
    }

    let key = derive_key(&request, state.trust_forwarded_for);
    let decision = state.limiter.check(&key).await;

    if !decision.allowed {
        let request_id = request.extensions().get::<RequestId>().map(ToString::to_string);
        info!(
            key = %key,
            limit = decision.limit,
            used = decision.used,
            backend = ?decision.backend,
            reset_in_seconds = decision.reset_in_seconds,
            "Request rejected by rate limiter"
        );
        return rejection(&decision, request_id);
    }

    debug!(
        key = %key,
        remaining = decision.remaining,
        backend = ?decision.backend,
        "Request admitted"
    );

    request.extensions_mut().insert(decision.clone());
    let mut response = next.run(request).await;

    if state.expose_headers {
        let headers = response.headers_mut();
        headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(decision.reset_in_seconds));
    }

    response
}

fn rejection(decision: &RateLimitDecision, request_id: Option<String>) -> Response {
    let body = ErrorEnvelope::rate_limited(
        decision.limit,
        &decision.tier,
        decision.reset_in_seconds,
        request_id,
    );

    (
        StatusCode::TOO_MANY_REQUESTS,
        [("retry-after", decision.reset_in_seconds.to_string())],
        Json(body),
    )
        .into_response()
}
