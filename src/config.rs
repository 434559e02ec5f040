//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::BucketConfiguration;

/// Environment variable prefix, e.g. `TOLLGATE_BACKEND__HOST`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate admission layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Distributed backend connection
    #[serde(default)]
    pub backend: BackendConfig,

    /// Shared token bucket
    #[serde(default)]
    pub bucket: BucketConfig,

    /// Process-local fallback counter
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Façade behaviour
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Redis connection settings.
///
/// An empty host means no distributed backend; the limiter then runs purely
/// on the local fallback counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Redis host name or address
    #[serde(default)]
    pub host: String,

    /// Redis port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Connect and per-command timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Idle bucket state expires from the store after this many seconds
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            idle_ttl_secs: default_idle_ttl(),
        }
    }
}

fn default_port() -> u16 {
    6379
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_idle_ttl() -> u64 {
    60
}

impl BackendConfig {
    /// Whether a backend endpoint is configured at all.
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

/// Token bucket shared by all instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Limiter identity; every instance using the same key shares one bucket
    #[serde(default = "default_bucket_key")]
    pub key: String,

    /// Burst ceiling
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Tokens added per refill interval
    #[serde(default = "default_refill_tokens")]
    pub refill_tokens: u64,

    /// Refill interval in milliseconds
    #[serde(default = "default_refill_interval")]
    pub refill_interval_ms: u64,

    /// Compare-and-swap attempts before giving up on the backend
    #[serde(default = "default_max_cas_attempts")]
    pub max_cas_attempts: u32,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            key: default_bucket_key(),
            capacity: default_capacity(),
            refill_tokens: default_refill_tokens(),
            refill_interval_ms: default_refill_interval(),
            max_cas_attempts: default_max_cas_attempts(),
        }
    }
}

fn default_bucket_key() -> String {
    "global".to_string()
}

fn default_capacity() -> u64 {
    100
}

fn default_refill_tokens() -> u64 {
    100
}

fn default_refill_interval() -> u64 {
    1000
}

fn default_max_cas_attempts() -> u32 {
    8
}

impl BucketConfig {
    /// The algorithm parameters of this bucket.
    pub fn configuration(&self) -> BucketConfiguration {
        BucketConfiguration {
            capacity: self.capacity,
            refill_tokens: self.refill_tokens,
            refill_interval: Duration::from_millis(self.refill_interval_ms),
        }
    }
}

/// Fixed-window counter used while the backend is down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Window length in milliseconds
    #[serde(default = "default_window")]
    pub window_ms: u64,

    /// Requests admitted per window by this process
    #[serde(default = "default_local_limit")]
    pub limit: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window(),
            limit: default_local_limit(),
        }
    }
}

fn default_window() -> u64 {
    1000
}

fn default_local_limit() -> u64 {
    100
}

impl FallbackConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Façade settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Request paths starting with any of these skip limiting
    #[serde(default = "default_exempt_prefixes")]
    pub exempt_prefixes: Vec<String>,

    /// Seconds after which an unavailable backend is probed again; 0 never re-probes
    #[serde(default = "default_reprobe_interval")]
    pub reprobe_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            exempt_prefixes: default_exempt_prefixes(),
            reprobe_interval_secs: default_reprobe_interval(),
        }
    }
}

fn default_exempt_prefixes() -> Vec<String> {
    vec!["/actuator/".to_string()]
}

fn default_reprobe_interval() -> u64 {
    30
}

impl LimiterConfig {
    /// `None` when re-probing is disabled.
    pub fn reprobe_interval(&self) -> Option<Duration> {
        match self.reprobe_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file overlaid with
    /// `TOLLGATE_*` environment variables (`__` separates nested keys).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("limiter.exempt_prefixes"),
            )
            .build()
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        let config: TollgateConfig = settings
            .try_deserialize()
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the limiters cannot work with.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.bucket.capacity == 0, "bucket.capacity must be greater than zero"),
            (self.bucket.refill_tokens == 0, "bucket.refill_tokens must be greater than zero"),
            (self.bucket.refill_interval_ms == 0, "bucket.refill_interval_ms must be greater than zero"),
            (self.bucket.max_cas_attempts == 0, "bucket.max_cas_attempts must be greater than zero"),
            (self.bucket.key.is_empty(), "bucket.key must not be empty"),
            (self.fallback.window_ms == 0, "fallback.window_ms must be greater than zero"),
            (self.fallback.limit == 0, "fallback.limit must be greater than zero"),
            (self.backend.connect_timeout_ms == 0, "backend.connect_timeout_ms must be greater than zero"),
            (self.backend.idle_ttl_secs == 0, "backend.idle_ttl_secs must be greater than zero"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(TollgateError::Config(message.to_string())),
            None => Ok(()),
        }
    }
}
