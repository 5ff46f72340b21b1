//! Configuration management for Tollgate.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `TOLLGATE_`-prefixed environment variables using `__` as the nesting
//! separator (for example `TOLLGATE_RATE_LIMITING__LIMIT_PER_MINUTE=120`).
//! The result is validated before the service is allowed to start.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};

/// Longest accepted window, in seconds (one day).
pub const MAX_WINDOW_SECONDS: u64 = 86_400;

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests admitted per key within one window
    #[serde(default = "default_limit_per_minute")]
    pub limit_per_minute: u32,

    /// Length of the trailing window in seconds
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Shared store connection URL; absent means local-only enforcement
    #[serde(default)]
    pub shared_store_url: Option<String>,

    /// Upper bound on a shared store round trip, in milliseconds
    #[serde(default = "default_shared_store_timeout_ms")]
    pub shared_store_timeout_ms: u64,

    /// Prefix for keys written to the shared store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-tier limit overrides for authenticated principals
    #[serde(default)]
    pub tiers: HashMap<String, u32>,

    /// Request paths that bypass admission control
    #[serde(default)]
    pub exempt_paths: Vec<String>,

    /// Use the first `X-Forwarded-For` hop as the client address
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Attach `X-RateLimit-*` headers to admitted responses
    #[serde(default = "default_expose_headers")]
    pub expose_headers: bool,

    /// How often idle keys are swept from the local store, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            limit_per_minute: default_limit_per_minute(),
            window_seconds: default_window_seconds(),
            shared_store_url: None,
            shared_store_timeout_ms: default_shared_store_timeout_ms(),
            key_prefix: default_key_prefix(),
            tiers: HashMap::new(),
            exempt_paths: Vec::new(),
            trust_forwarded_for: false,
            expose_headers: default_expose_headers(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_limit_per_minute() -> u32 {
    60
}

fn default_window_seconds() -> u64 {
    60
}

fn default_shared_store_timeout_ms() -> u64 {
    25
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_expose_headers() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    60
}

impl RateLimitingConfig {
    /// The trailing window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    /// The shared store round-trip budget as a duration.
    pub fn shared_store_timeout(&self) -> Duration {
        Duration::from_millis(self.shared_store_timeout_ms)
    }

    /// The local sweep interval as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// The shared store URL, treating an empty string as unset.
    pub fn shared_store_url(&self) -> Option<&str> {
        self.shared_store_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Environment source shared by every loader.
fn environment() -> Environment {
    Environment::with_prefix("TOLLGATE")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("rate_limiting.exempt_paths")
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).format(FileFormat::Yaml));
        }
        Self::finish(builder.add_source(environment()))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::finish(
            config::Config::builder().add_source(config::File::from_str(yaml, FileFormat::Yaml)),
        )
    }

    /// Load configuration from an explicit set of `TOLLGATE_*` variables.
    pub fn from_env_map(vars: HashMap<String, String>) -> Result<Self> {
        Self::finish(config::Config::builder().add_source(environment().source(Some(vars))))
    }

    fn finish(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config: TollgateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would leave the admission policy undefined.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;

        if rl.limit_per_minute == 0 {
            return Err(TollgateError::Config(
                "rate_limiting.limit_per_minute must be greater than zero".into(),
            ));
        }
        if rl.window_seconds == 0 {
            return Err(TollgateError::Config(
                "rate_limiting.window_seconds must be greater than zero".into(),
            ));
        }
        if rl.window_seconds > MAX_WINDOW_SECONDS {
            return Err(TollgateError::Config(format!(
                "rate_limiting.window_seconds must be at most {MAX_WINDOW_SECONDS}"
            )));
        }
        if rl.shared_store_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "rate_limiting.shared_store_timeout_ms must be greater than zero".into(),
            ));
        }
        if rl.sweep_interval_secs == 0 {
            return Err(TollgateError::Config(
                "rate_limiting.sweep_interval_secs must be greater than zero".into(),
            ));
        }
        if let Some((tier, _)) = rl.tiers.iter().find(|(_, limit)| **limit == 0) {
            return Err(TollgateError::Config(format!(
                "rate_limiting.tiers.{tier} must be greater than zero"
            )));
        }

        Ok(())
    }
}
