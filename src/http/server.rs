//! HTTP server hosting the admission middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::admission::{admission, AdmissionState};
use super::context::request_context;
use crate::error::{Result, TollgateError};
use crate::ratelimit::{RateLimiter, SharedStoreStatus};

/// HTTP server for the admission-controlled routes.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Admission middleware state, including the limiter
    admission: AdmissionState,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, admission: AdmissionState) -> Self {
        Self { addr, admission }
    }

    /// Build the router.
    ///
    /// Request context wraps admission so rejections are logged and carry a
    /// request id; admission wraps every route.
    pub fn router(&self) -> Router {
        let limiter = Arc::clone(self.admission.limiter());

        Router::new()
            .route("/ping", get(ping))
            .route("/healthz", get(healthz))
            .route("/readyz", get(readyz))
            .with_state(limiter)
            .layer(middleware::from_fn_with_state(
                self.admission.clone(),
                admission,
            ))
            .layer(middleware::from_fn(request_context))
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TollgateError::Io(e)
        })?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TollgateError::Server(e.to_string())
        })
    }
}

async fn ping() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Degraded still answers 200: enforcement continues on the local store.
async fn readyz(State(limiter): State<Arc<RateLimiter>>) -> Json<Value> {
    let shared_store = limiter.shared_store_status().await;
    let status = match shared_store {
        SharedStoreStatus::Unreachable => "degraded",
        SharedStoreStatus::Disabled | SharedStoreStatus::Reachable => "ready",
    };

    let policy = limiter.policy();
    Json(json!({
        "status": status,
        "details": {
            "rate_limit": policy.default_limit,
            "window_seconds": policy.window.as_secs(),
            "shared_store": shared_store,
            "local_keys": limiter.local_store().tracked_keys(),
        }
    }))
}
