//! Redis-backed shared window store.
//!
//! Each key is a sorted set of request members scored by their timestamp.
//! A single Lua script trims the expired range, inserts the new member,
//! counts the survivors and refreshes the key's TTL, so every instance
//! sees the same linearised sequence for a key.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use super::backend::{SharedOutcome, SharedWindowStore};
use super::window::WindowSnapshot;
use crate::error::StoreError;

/// Upper bound on establishing the connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound on a single script invocation.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);

/// Trim, insert, count and expire in one atomic step.
///
/// KEYS[1] = window key, ARGV[1] = now (ms), ARGV[2] = window (ms),
/// ARGV[3] = unique member. Returns `{count, oldest_score}`.
const WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. (now - window))
redis.call('ZADD', key, now, ARGV[3])
local count = redis.call('ZCARD', key)
redis.call('PEXPIRE', key, window)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
return {count, tonumber(oldest[2])}
"#;

/// A shared window store backed by Redis sorted sets.
pub struct RedisWindowStore {
    client: redis::Client,
    /// Established lazily; `None` until the first successful connect
    connection: RwLock<Option<ConnectionManager>>,
    /// Held while a connect attempt is in flight
    connecting: Mutex<()>,
    key_prefix: String,
    script: redis::Script,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisWindowStore {
    /// Create a store for the given connection URL.
    ///
    /// Only the URL is validated here; the connection is opened on first use
    /// and retried on every call until it succeeds.
    pub fn new(url: &str, key_prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connection: RwLock::new(None),
            connecting: Mutex::new(()),
            key_prefix: key_prefix.to_string(),
            script: redis::Script::new(WINDOW_SCRIPT),
        })
    }

    /// The sorted-set key for a rate-limit key.
    fn storage_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    /// A member that is unique even for identical timestamps.
    fn unique_member(now_ms: i64) -> String {
        format!("{}-{:016x}", now_ms, rand::random::<u64>())
    }

    /// The shared connection, opening it if needed.
    ///
    /// Only one connect attempt runs at a time; callers arriving during an
    /// attempt fail immediately instead of queueing behind it.
    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        if let Some(conn) = self.connection.read().as_ref() {
            return Ok(conn.clone());
        }

        let Ok(_attempt) = self.connecting.try_lock() else {
            return Err(StoreError::Connecting);
        };

        // Another caller may have connected while we were checking
        if let Some(conn) = self.connection.read().as_ref() {
            return Ok(conn.clone());
        }

        let connect = ConnectionManager::new(self.client.clone());
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| StoreError::Timeout(CONNECT_TIMEOUT.as_millis() as u64))??;

        info!(key_prefix = %self.key_prefix, "Connected to shared window store");
        *self.connection.write() = Some(conn.clone());
        Ok(conn)
    }

    async fn try_record(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
    ) -> Result<WindowSnapshot, StoreError> {
        let mut conn = self.connection().await?;
        let storage_key = self.storage_key(key);

        let mut invocation = self.script.key(&storage_key);
        invocation
            .arg(now_ms)
            .arg(window_ms)
            .arg(Self::unique_member(now_ms));

        let reply: Vec<i64> =
            tokio::time::timeout(COMMAND_TIMEOUT, invocation.invoke_async(&mut conn))
                .await
                .map_err(|_| StoreError::Timeout(COMMAND_TIMEOUT.as_millis() as u64))??;

        match reply.as_slice() {
            [count, oldest_ms] if *count > 0 => {
                trace!(
                    key = %storage_key,
                    count = count,
                    oldest_ms = oldest_ms,
                    "Recorded request in shared window"
                );
                Ok(WindowSnapshot {
                    count: *count as u64,
                    oldest_ms: *oldest_ms,
                })
            }
            other => Err(StoreError::Protocol(format!(
                "expected [count, oldest], got {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl SharedWindowStore for RedisWindowStore {
    async fn record_and_check(&self, key: &str, now_ms: i64, window_ms: i64) -> SharedOutcome {
        match self.try_record(key, now_ms, window_ms).await {
            Ok(snapshot) => SharedOutcome::Counted(snapshot),
            Err(e) => {
                debug!(key = %key, error = %e, "Shared window store unavailable");
                SharedOutcome::Unavailable(e)
            }
        }
    }

    async fn ping(&self) -> bool {
        let Ok(mut conn) = self.connection().await else {
            return false;
        };
        let cmd = redis::cmd("PING");
        let ping = cmd.query_async::<String>(&mut conn);
        matches!(
            tokio::time::timeout(COMMAND_TIMEOUT, ping).await,
            Ok(Ok(ref pong)) if pong == "PONG"
        )
    }
}
