//! Shared window store trait for abstracting the cross-instance backend.

use async_trait::async_trait;

use super::window::WindowSnapshot;
use crate::error::StoreError;

/// Result of asking the shared store to record a request.
///
/// Store failures are a value, not an error: `Unavailable` tells the limiter
/// to serve this call from the local store.
#[derive(Debug)]
pub enum SharedOutcome {
    /// The request was recorded; the snapshot is authoritative across instances
    Counted(WindowSnapshot),
    /// The store could not be consulted for this call
    Unavailable(StoreError),
}

/// Trait for shared window store implementations.
///
/// Implementations must run trim, insert, count and expiry as one atomic
/// step per key, and must never panic or return early on store errors.
#[async_trait]
pub trait SharedWindowStore: Send + Sync {
    /// Record a request for `key` at `now_ms` and report the window state.
    async fn record_and_check(&self, key: &str, now_ms: i64, window_ms: i64) -> SharedOutcome;

    /// Check whether the store is reachable.
    async fn ping(&self) -> bool;
}
