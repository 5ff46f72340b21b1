//! Process-local sliding-window log.
//!
//! Every key owns an ordered log of request timestamps (milliseconds since the
//! Unix epoch). Each record-and-check trims the expired prefix, appends the
//! current request and reports the resulting count, so the count always
//! reflects elapsed time rather than a fixed number of slots.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// State of one key's window right after a request was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Entries inside the window, including the request just recorded
    pub count: u64,
    /// Timestamp of the oldest surviving entry
    pub oldest_ms: i64,
}

impl WindowSnapshot {
    /// Whether the recorded request fits within `limit`.
    pub fn is_within(&self, limit: u32) -> bool {
        self.count <= u64::from(limit)
    }

    /// Whole seconds until the oldest entry leaves the window, rounded up.
    pub fn reset_in_seconds(&self, now_ms: i64, window_ms: i64) -> u64 {
        let remaining_ms = self
            .oldest_ms
            .saturating_add(window_ms)
            .saturating_sub(now_ms)
            .max(0) as u64;
        remaining_ms.div_ceil(1000)
    }
}

type WindowLog = Arc<Mutex<VecDeque<i64>>>;

/// Drop entries strictly older than `now_ms - window_ms` from the front.
fn trim(log: &mut VecDeque<i64>, now_ms: i64, window_ms: i64) {
    let cutoff = now_ms.saturating_sub(window_ms);
    while log.front().is_some_and(|&ts| ts < cutoff) {
        log.pop_front();
    }
}

/// An in-memory window store with one lock per key.
///
/// The key map is a `DashMap`, so looking up a key only touches one shard;
/// the log itself sits behind its own mutex, so callers for different keys
/// never wait on each other while trimming or counting.
#[derive(Debug, Default)]
pub struct LocalWindowStore {
    logs: DashMap<String, WindowLog>,
}

impl LocalWindowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn log_for(&self, key: &str) -> WindowLog {
        if let Some(log) = self.logs.get(key) {
            return Arc::clone(log.value());
        }
        Arc::clone(self.logs.entry(key.to_string()).or_default().value())
    }

    /// Record a request for `key` at `now_ms` and return the window state.
    ///
    /// The request is counted whether or not it fits the caller's limit.
    pub fn record_and_check(&self, key: &str, now_ms: i64, window_ms: i64) -> WindowSnapshot {
        let log = self.log_for(key);
        let mut entries = log.lock();

        trim(&mut entries, now_ms, window_ms);

        // Callers may reach the lock slightly out of clock order
        let pos = entries.partition_point(|&ts| ts <= now_ms);
        entries.insert(pos, now_ms);

        let snapshot = WindowSnapshot {
            count: entries.len() as u64,
            oldest_ms: entries.front().copied().unwrap_or(now_ms),
        };

        trace!(
            key = %key,
            count = snapshot.count,
            oldest_ms = snapshot.oldest_ms,
            "Recorded request in local window"
        );

        snapshot
    }

    /// Count the entries currently inside the window without recording.
    pub fn count(&self, key: &str, now_ms: i64, window_ms: i64) -> u64 {
        let Some(log) = self.logs.get(key).map(|log| Arc::clone(log.value())) else {
            return 0;
        };
        let cutoff = now_ms.saturating_sub(window_ms);
        let entries = log.lock();
        entries.iter().filter(|&&ts| ts >= cutoff).count() as u64
    }

    /// Remove keys whose window has emptied out.
    ///
    /// A key is only removed when no caller holds its log, so a concurrent
    /// record never lands in a log that has been dropped from the map.
    /// Returns the number of keys removed.
    pub fn sweep(&self, now_ms: i64, window_ms: i64) -> usize {
        let before = self.logs.len();
        self.logs.retain(|_, log| {
            if Arc::strong_count(log) > 1 {
                return true;
            }
            let mut entries = log.lock();
            trim(&mut entries, now_ms, window_ms);
            !entries.is_empty()
        });
        let removed = before.saturating_sub(self.logs.len());

        debug!(
            removed = removed,
            remaining = self.logs.len(),
            "Swept idle keys from local window store"
        );

        removed
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.logs.len()
    }

    /// Clear all windows.
    pub fn clear(&self) {
        self.logs.clear();
    }
}
