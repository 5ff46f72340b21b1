//! Core rate limiter implementation.
//!
//! The limiter consults the shared store first and falls back to the local
//! store for any call where the shared store is unconfigured, failing or too
//! slow. The fallback is decided per call; nothing about a past outage is
//! remembered, so shared enforcement resumes as soon as the store answers.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

use super::backend::{SharedOutcome, SharedWindowStore};
use super::key::RateLimitKey;
use super::policy::RateLimitPolicy;
use super::shared::RedisWindowStore;
use super::window::{current_time_ms, LocalWindowStore, WindowSnapshot};
use crate::config::RateLimitingConfig;
use crate::error::{Result, StoreError, TollgateError};

/// Which store produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// The cross-instance shared store
    Shared,
    /// The process-local fallback
    Local,
}

/// The outcome of a rate limit check for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The limit that applied
    pub limit: u32,
    /// Requests left in the current window
    pub remaining: u32,
    /// Requests counted in the current window, this one included
    pub used: u64,
    /// Seconds until the oldest counted request leaves the window (at least 1)
    pub reset_in_seconds: u64,
    /// Tier or key category the limit was chosen for
    pub tier: String,
    /// Store that produced the decision
    pub backend: Backend,
}

/// Reachability of the shared store, for readiness reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedStoreStatus {
    /// No shared store is configured
    Disabled,
    /// The shared store answered a ping
    Reachable,
    /// The shared store is configured but did not answer
    Unreachable,
}

/// The rate limiter that owns both window stores.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    policy: RateLimitPolicy,
    local: LocalWindowStore,
    shared: Option<Arc<dyn SharedWindowStore>>,
    shared_timeout: Duration,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .field("shared", &self.shared.is_some())
            .field("shared_timeout", &self.shared_timeout)
            .finish()
    }
}

impl RateLimiter {
    /// Create a local-only rate limiter.
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            local: LocalWindowStore::new(),
            shared: None,
            shared_timeout: Duration::ZERO,
        }
    }

    /// Create a rate limiter that prefers the given shared store.
    pub fn with_shared_store(
        policy: RateLimitPolicy,
        shared: Arc<dyn SharedWindowStore>,
        shared_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            local: LocalWindowStore::new(),
            shared: Some(shared),
            shared_timeout,
        }
    }

    /// Build the limiter described by validated configuration.
    ///
    /// A shared store URL that cannot be parsed is a configuration error; a
    /// store that is merely unreachable is not.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        let policy = RateLimitPolicy::from_config(config);

        match config.shared_store_url() {
            Some(url) => {
                let store = RedisWindowStore::new(url, &config.key_prefix).map_err(|e| {
                    TollgateError::Config(format!("invalid rate_limiting.shared_store_url: {}", e))
                })?;
                info!(
                    limit = policy.default_limit,
                    window_secs = policy.window.as_secs(),
                    timeout_ms = config.shared_store_timeout_ms,
                    "Rate limiter using shared store with local fallback"
                );
                Ok(Self::with_shared_store(
                    policy,
                    Arc::new(store),
                    config.shared_store_timeout(),
                ))
            }
            None => {
                info!(
                    limit = policy.default_limit,
                    window_secs = policy.window.as_secs(),
                    "Rate limiter using local store only"
                );
                Ok(Self::new(policy))
            }
        }
    }

    /// The policy this limiter enforces.
    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// The local fallback store.
    pub fn local_store(&self) -> &LocalWindowStore {
        &self.local
    }

    /// Whether a shared store is configured.
    pub fn has_shared_store(&self) -> bool {
        self.shared.is_some()
    }

    /// Check and record a request for `key` at the current time.
    pub async fn check(&self, key: &RateLimitKey) -> RateLimitDecision {
        self.check_at(key, current_time_ms()).await
    }

    /// Check and record a request for `key` at `now_ms`.
    pub async fn check_at(&self, key: &RateLimitKey, now_ms: i64) -> RateLimitDecision {
        let limit = self.policy.limit_for(key);
        let window_ms = self.policy.window_ms();
        let storage_key = key.to_storage_key();

        trace!(key = %storage_key, limit = limit, now_ms = now_ms, "Checking rate limit");

        if let Some(shared) = &self.shared {
            let shared_snapshot = self
                .check_shared(shared, &storage_key, now_ms, window_ms)
                .await;
            if let Some(snapshot) = shared_snapshot {
                return self.decide(key, limit, snapshot, now_ms, Backend::Shared);
            }
        }

        let snapshot = self.local.record_and_check(&storage_key, now_ms, window_ms);
        self.decide(key, limit, snapshot, now_ms, Backend::Local)
    }

    /// Ask the shared store, bounded by the configured timeout.
    ///
    /// The store call runs on its own task: if we stop waiting, it still runs
    /// to completion instead of being dropped half-way.
    async fn check_shared(
        &self,
        shared: &Arc<dyn SharedWindowStore>,
        storage_key: &str,
        now_ms: i64,
        window_ms: i64,
    ) -> Option<WindowSnapshot> {
        let store = Arc::clone(shared);
        let key = storage_key.to_string();
        let task = tokio::spawn(
            async move { store.record_and_check(&key, now_ms, window_ms).await }.in_current_span(),
        );

        let failure = match tokio::time::timeout(self.shared_timeout, task).await {
            Ok(Ok(SharedOutcome::Counted(snapshot))) => return Some(snapshot),
            Ok(Ok(SharedOutcome::Unavailable(e))) => e,
            Ok(Err(join_error)) => StoreError::Task(join_error.to_string()),
            Err(_) => StoreError::Timeout(self.shared_timeout.as_millis() as u64),
        };

        warn!(
            key = %storage_key,
            error = %failure,
            "Shared store unavailable, enforcing with local store"
        );
        None
    }

    fn decide(
        &self,
        key: &RateLimitKey,
        limit: u32,
        snapshot: WindowSnapshot,
        now_ms: i64,
        backend: Backend,
    ) -> RateLimitDecision {
        let allowed = snapshot.is_within(limit);
        let remaining = u64::from(limit).saturating_sub(snapshot.count) as u32;
        let reset_in_seconds = snapshot
            .reset_in_seconds(now_ms, self.policy.window_ms())
            .max(1);

        if !allowed {
            debug!(
                key = %key,
                used = snapshot.count,
                limit = limit,
                backend = ?backend,
                "Rate limit exceeded"
            );
        }

        RateLimitDecision {
            allowed,
            limit,
            remaining,
            used: snapshot.count,
            reset_in_seconds,
            tier: key.category().to_string(),
            backend,
        }
    }

    /// Probe the shared store.
    pub async fn shared_store_status(&self) -> SharedStoreStatus {
        let Some(shared) = &self.shared else {
            return SharedStoreStatus::Disabled;
        };

        let budget = self.shared_timeout.max(Duration::from_millis(250));
        match tokio::time::timeout(budget, shared.ping()).await {
            Ok(true) => SharedStoreStatus::Reachable,
            _ => SharedStoreStatus::Unreachable,
        }
    }

    /// Periodically drop idle keys from the local store.
    ///
    /// The task stops on its own once the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                limiter
                    .local
                    .sweep(current_time_ms(), limiter.policy.window_ms());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::testing::MemorySharedStore;

    const WINDOW: Duration = Duration::from_secs(60);

    fn client(last_octet: u8) -> RateLimitKey {
        RateLimitKey::Address(std::net::IpAddr::from([10, 0, 0, last_octet]))
    }

    fn shared_limiter(limit: u32) -> (Arc<MemorySharedStore>, RateLimiter) {
        let store = Arc::new(MemorySharedStore::new());
        let limiter = RateLimiter::with_shared_store(
            RateLimitPolicy::new(limit, WINDOW),
            store.clone(),
            Duration::from_millis(100),
        );
        (store, limiter)
    }

    #[tokio::test]
    async fn test_admits_limit_then_rejects() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(5, WINDOW));
        let key = client(1);

        let mut last_remaining = u32::MAX;
        for i in 1..=5u64 {
            let decision = limiter.check_at(&key, 1_000).await;
            assert!(decision.allowed, "request {} should be allowed", i);
            assert_eq!(decision.used, i);
            assert!(decision.remaining < last_remaining);
            last_remaining = decision.remaining;
        }
        assert_eq!(last_remaining, 0);

        let decision = limiter.check_at(&key, 1_000).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.limit, 5);
        assert_eq!(decision.backend, Backend::Local);
    }

    #[tokio::test]
    async fn test_allowed_again_after_window() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(2, WINDOW));
        let key = client(2);

        assert!(limiter.check_at(&key, 0).await.allowed);
        assert!(limiter.check_at(&key, 0).await.allowed);
        assert!(!limiter.check_at(&key, 0).await.allowed);

        // Still inside the window
        assert!(!limiter.check_at(&key, 59_999).await.allowed);

        let decision = limiter.check_at(&key, 120_000).await;
        assert!(decision.allowed);
        assert_eq!(decision.used, 1);
    }

    #[tokio::test]
    async fn test_window_slides_rather_than_resets() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(2, WINDOW));
        let key = client(3);

        assert!(limiter.check_at(&key, 0).await.allowed);
        assert!(limiter.check_at(&key, 40_000).await.allowed);

        // A fixed window starting at 0 would have reset here; the sliding one
        // still sees the request from 40s
        let decision = limiter.check_at(&key, 61_000).await;
        assert!(decision.allowed);
        assert_eq!(decision.used, 2);
        assert!(!limiter.check_at(&key, 62_000).await.allowed);
    }

    #[tokio::test]
    async fn test_reset_in_seconds() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, WINDOW));
        let key = client(4);

        let first = limiter.check_at(&key, 0).await;
        assert_eq!(first.reset_in_seconds, 60);

        let second = limiter.check_at(&key, 10_000).await;
        assert!(!second.allowed);
        assert_eq!(second.reset_in_seconds, 50);

        // Never reports zero, even on the boundary
        let boundary = limiter.check_at(&key, 60_000).await;
        assert!(boundary.reset_in_seconds >= 1);
    }

    #[tokio::test]
    async fn test_oversized_window_still_enforces() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, Duration::from_secs(u64::MAX)));
        let key = client(13);
        let now = current_time_ms();

        assert!(limiter.check_at(&key, now).await.allowed);
        let second = limiter.check_at(&key, now).await;
        assert!(!second.allowed);
        assert!(second.reset_in_seconds >= 1);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, WINDOW));

        assert!(limiter.check_at(&client(5), 0).await.allowed);
        assert!(!limiter.check_at(&client(5), 0).await.allowed);
        assert!(limiter.check_at(&client(6), 0).await.allowed);
    }

    #[tokio::test]
    async fn test_tier_override() {
        let policy = RateLimitPolicy::new(1, WINDOW).with_tier("pro", 3);
        let limiter = RateLimiter::new(policy);
        let key = RateLimitKey::principal("alice", Some("pro".into()));

        for _ in 0..3 {
            assert!(limiter.check_at(&key, 0).await.allowed);
        }
        let decision = limiter.check_at(&key, 0).await;
        assert!(!decision.allowed);
        assert_eq!(decision.limit, 3);
        assert_eq!(decision.tier, "pro");
    }

    #[tokio::test]
    async fn test_shared_store_preferred() {
        let (store, limiter) = shared_limiter(3);
        let key = client(7);

        let decision = limiter.check_at(&key, 0).await;
        assert!(decision.allowed);
        assert_eq!(decision.backend, Backend::Shared);
        assert_eq!(store.stored("ip:10.0.0.7"), 1);
        assert_eq!(limiter.local_store().tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_local_and_shared_agree() {
        let local = RateLimiter::new(RateLimitPolicy::new(3, WINDOW));
        let (_store, shared) = shared_limiter(3);

        let timeline: &[(u8, i64)] = &[
            (1, 0),
            (1, 1_000),
            (2, 1_500),
            (1, 2_000),
            (1, 3_000),
            (1, 30_000),
            (2, 59_000),
            (1, 60_500),
            (1, 61_500),
            (1, 62_500),
            (2, 62_600),
            (1, 125_000),
        ];

        let mut local_seq = Vec::new();
        let mut shared_seq = Vec::new();
        for &(client_id, now_ms) in timeline {
            let key = client(client_id);
            let l = local.check_at(&key, now_ms).await;
            let s = shared.check_at(&key, now_ms).await;
            assert_eq!(l.backend, Backend::Local);
            assert_eq!(s.backend, Backend::Shared);
            local_seq.push((l.allowed, l.remaining, l.reset_in_seconds));
            shared_seq.push((s.allowed, s.remaining, s.reset_in_seconds));
        }

        assert_eq!(local_seq, shared_seq);
        assert!(local_seq.iter().any(|(allowed, _, _)| !allowed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_local() {
        let limiter = Arc::new(RateLimiter::new(RateLimitPolicy::new(10, WINDOW)));
        let admitted = run_concurrently(limiter, 50).await;
        assert_eq!(admitted, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_shared() {
        let (_store, limiter) = shared_limiter(10);
        let admitted = run_concurrently(Arc::new(limiter), 50).await;
        assert_eq!(admitted, 10);
    }

    async fn run_concurrently(limiter: Arc<RateLimiter>, requests: usize) -> usize {
        let key = client(8);
        let now = current_time_ms();
        let tasks = (0..requests).map(|_| {
            let limiter = Arc::clone(&limiter);
            let key = key.clone();
            tokio::spawn(async move { limiter.check_at(&key, now).await })
        });

        let decisions = futures::future::join_all(tasks).await;
        decisions
            .iter()
            .filter(|d| d.as_ref().unwrap().allowed)
            .count()
    }

    #[tokio::test]
    async fn test_outage_falls_back_and_recovers() {
        let (store, limiter) = shared_limiter(3);
        let key = client(9);

        // Shared store healthy: two requests recorded there
        for _ in 0..2 {
            assert_eq!(limiter.check_at(&key, 0).await.backend, Backend::Shared);
        }

        // Outage: enforcement continues locally, it does not admit everything
        store.set_down(true);
        let mut outage = Vec::new();
        for _ in 0..5 {
            let decision = limiter.check_at(&key, 1_000).await;
            assert_eq!(decision.backend, Backend::Local);
            outage.push(decision.allowed);
        }
        assert_eq!(outage, vec![true, true, true, false, false]);

        // Recovery: the very next call is served by the shared store again
        store.set_down(false);
        let decision = limiter.check_at(&key, 2_000).await;
        assert_eq!(decision.backend, Backend::Shared);
        assert!(decision.allowed);
        assert_eq!(decision.used, 3);

        let decision = limiter.check_at(&key, 2_000).await;
        assert_eq!(decision.backend, Backend::Shared);
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn test_slow_shared_store_times_out_to_local() {
        let store = Arc::new(MemorySharedStore::new());
        store.set_delay(Duration::from_millis(200));
        let limiter = RateLimiter::with_shared_store(
            RateLimitPolicy::new(5, WINDOW),
            store.clone(),
            Duration::from_millis(20),
        );
        let key = client(10);

        let decision = limiter.check_at(&key, 0).await;
        assert_eq!(decision.backend, Backend::Local);
        assert!(decision.allowed);

        // The abandoned shared call still completes in the background
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.calls(), 1);
        assert_eq!(store.stored("ip:10.0.0.10"), 1);
    }

    #[tokio::test]
    async fn test_shared_store_status() {
        let local = RateLimiter::new(RateLimitPolicy::new(1, WINDOW));
        assert_eq!(local.shared_store_status().await, SharedStoreStatus::Disabled);

        let (store, limiter) = shared_limiter(1);
        assert_eq!(limiter.shared_store_status().await, SharedStoreStatus::Reachable);
        store.set_down(true);
        assert_eq!(limiter.shared_store_status().await, SharedStoreStatus::Unreachable);
    }

    #[test]
    fn test_decision_serializes_backend() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, WINDOW));
        let decision = tokio_test::block_on(limiter.check(&client(12)));

        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["backend"], "local");
        assert_eq!(json["tier"], "anonymous");
        assert_eq!(json["remaining"], 0);
    }

    #[test]
    fn test_from_config_local_only() {
        let config = RateLimitingConfig::default();
        let limiter = RateLimiter::from_config(&config).unwrap();
        assert!(!limiter.has_shared_store());
        assert_eq!(limiter.policy().default_limit, 60);
    }

    #[test]
    fn test_from_config_with_shared_store() {
        let mut config = RateLimitingConfig::default();
        config.shared_store_url = Some("redis://127.0.0.1:6379".into());
        let limiter = RateLimiter::from_config(&config).unwrap();
        assert!(limiter.has_shared_store());
    }

    #[test]
    fn test_from_config_bad_url() {
        let mut config = RateLimitingConfig::default();
        config.shared_store_url = Some("definitely not a url".into());
        assert!(matches!(
            RateLimiter::from_config(&config),
            Err(TollgateError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_sweeper_drops_idle_keys() {
        let limiter = Arc::new(RateLimiter::new(RateLimitPolicy::new(1, WINDOW)));
        // Recorded at the epoch, so long expired by wall-clock time
        limiter.check_at(&client(11), 0).await;
        assert_eq!(limiter.local_store().tracked_keys(), 1);

        let handle = limiter.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(limiter.local_store().tracked_keys(), 0);

        drop(limiter);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop once the limiter is dropped")
            .unwrap();
    }
}
