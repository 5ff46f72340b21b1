//! In-process stand-in for the shared store, used by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::backend::{SharedOutcome, SharedWindowStore};
use super::window::WindowSnapshot;
use crate::error::StoreError;

/// Sorted-set semantics of the Redis script, with switches for outages and
/// latency.
#[derive(Debug, Default)]
pub struct MemorySharedStore {
    sets: Mutex<HashMap<String, Vec<i64>>>,
    down: AtomicBool,
    delay_ms: AtomicUsize,
    calls: AtomicUsize,
}

impl MemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (`true`) or recovery (`false`).
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Delay every call by `delay` before touching the set.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Number of record calls received, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Entries currently stored for `key`, regardless of age.
    pub fn stored(&self, key: &str) -> usize {
        self.sets.lock().get(key).map_or(0, Vec::len)
    }
}

#[async_trait]
impl SharedWindowStore for MemorySharedStore {
    async fn record_and_check(&self, key: &str, now_ms: i64, window_ms: i64) -> SharedOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }

        if self.down.load(Ordering::SeqCst) {
            return SharedOutcome::Unavailable(StoreError::Protocol("simulated outage".into()));
        }

        let mut sets = self.sets.lock();
        let set = sets.entry(key.to_string()).or_default();
        let cutoff = now_ms.saturating_sub(window_ms);
        set.retain(|&score| score >= cutoff);
        let pos = set.partition_point(|&score| score <= now_ms);
        set.insert(pos, now_ms);

        SharedOutcome::Counted(WindowSnapshot {
            count: set.len() as u64,
            oldest_ms: set[0],
        })
    }

    async fn ping(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }
}
