//! Admission policy: the window, the default limit and per-tier overrides.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::RateLimitingConfig;

use super::key::RateLimitKey;

/// The limit and window applied to a key.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    /// Requests admitted per window when no tier override applies
    pub default_limit: u32,
    /// Length of the trailing window
    pub window: Duration,
    /// Tier name -> limit
    pub tiers: HashMap<String, u32>,
}

impl RateLimitPolicy {
    /// Create a policy with a single limit and no tier overrides.
    pub fn new(default_limit: u32, window: Duration) -> Self {
        Self {
            default_limit,
            window,
            tiers: HashMap::new(),
        }
    }

    /// Build the policy from validated configuration.
    pub fn from_config(config: &RateLimitingConfig) -> Self {
        Self {
            default_limit: config.limit_per_minute,
            window: config.window(),
            tiers: config.tiers.clone(),
        }
    }

    /// Add a tier override.
    pub fn with_tier(mut self, tier: impl Into<String>, limit: u32) -> Self {
        self.tiers.insert(tier.into(), limit);
        self
    }

    /// The limit that applies to a key.
    ///
    /// Unknown tiers fall back to the default limit.
    pub fn limit_for(&self, key: &RateLimitKey) -> u32 {
        key.tier()
            .and_then(|tier| self.tiers.get(tier).copied())
            .unwrap_or(self.default_limit)
    }

    /// The window length in milliseconds, saturating at `i64::MAX`.
    pub fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }
}
