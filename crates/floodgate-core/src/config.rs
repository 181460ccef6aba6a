//! Configuration structures for floodgate.
//!
//! Configuration is loaded from TOML files and can be overridden via CLI flags.
//! Every section is optional; missing values fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Hot cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Rate limiter instances
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    /// Batch writer configuration
    #[serde(default)]
    pub batch_writer: BatchWriterConfig,

    /// Circuit breaker guarding the document store
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    /// HTTP gateway configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Hot cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Maximum number of entries
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    /// TTL applied by `set` when none is given
    #[serde(default = "default_cache_ttl_seconds")]
    pub default_ttl_seconds: u64,

    /// Interval of the background expiry sweep
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

impl CacheConfig {
    /// Default entry TTL.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    /// Sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            default_ttl_seconds: default_cache_ttl_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

/// Token bucket parameters for one rate limiter instance.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RateLimiterConfig {
    /// Name used in logs and metrics
    #[serde(default = "default_limiter_name")]
    pub name: String,

    /// Bucket capacity (burst size)
    pub max_tokens: f64,

    /// Tokens added per second
    pub refill_rate_per_second: f64,

    /// Maximum number of tracked clients
    pub max_clients: usize,

    /// Interval of the idle bucket cleanup
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,

    /// Buckets untouched for longer than this are dropped by the cleanup
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
}

impl RateLimiterConfig {
    /// Create a limiter configuration with default maintenance intervals.
    pub fn new(
        name: impl Into<String>,
        max_tokens: f64,
        refill_rate_per_second: f64,
        max_clients: usize,
    ) -> Self {
        Self {
            name: name.into(),
            max_tokens,
            refill_rate_per_second,
            max_clients,
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
        }
    }

    /// Cleanup interval.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    /// Idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    /// Tight per-endpoint limiter.
    pub fn endpoint() -> Self {
        Self::new("endpoint", 100.0, 10.0, 10_000)
    }

    /// Looser write-path limiter.
    pub fn write() -> Self {
        Self::new("write", 30.0, 5.0, 10_000)
    }

    /// System-wide limiter with a single shared bucket.
    pub fn global() -> Self {
        Self::new("global", 20_000.0, 10_000.0, 1)
    }

    fn validate(&self) -> crate::Result<()> {
        if !(self.max_tokens > 0.0) {
            return Err(crate::Error::Config(format!(
                "rate limiter '{}': max_tokens must be positive",
                self.name
            )));
        }
        if !(self.refill_rate_per_second > 0.0) {
            return Err(crate::Error::Config(format!(
                "rate limiter '{}': refill_rate_per_second must be positive",
                self.name
            )));
        }
        if self.max_clients == 0 {
            return Err(crate::Error::Config(format!(
                "rate limiter '{}': max_clients must be at least 1",
                self.name
            )));
        }
        if self.cleanup_interval_seconds == 0 {
            return Err(crate::Error::Config(format!(
                "rate limiter '{}': cleanup_interval_seconds must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// The three limiter instances used by the gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitsConfig {
    /// Per-client limiter applied to every request
    #[serde(default = "RateLimiterConfig::endpoint")]
    pub endpoint: RateLimiterConfig,

    /// Per-client limiter applied to mutations
    #[serde(default = "RateLimiterConfig::write")]
    pub write: RateLimiterConfig,

    /// Single bucket shared by all requests
    #[serde(default = "RateLimiterConfig::global")]
    pub global: RateLimiterConfig,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            endpoint: RateLimiterConfig::endpoint(),
            write: RateLimiterConfig::write(),
            global: RateLimiterConfig::global(),
        }
    }
}

/// Batch writer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchWriterConfig {
    /// Timer flush interval in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Maximum buffered operations before enqueue is rejected
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,

    /// Operations per commit (store hard limit is 500)
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Upper bound for one commit call
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
}

impl BatchWriterConfig {
    /// Flush interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Commit timeout.
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            max_buffer_size: default_max_buffer_size(),
            max_batch_size: default_max_batch_size(),
            commit_timeout_ms: default_commit_timeout_ms(),
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds to wait before probing a half-open circuit
    #[serde(default = "default_reset_timeout_seconds")]
    pub reset_timeout_seconds: u64,

    /// Successes in half-open state required to close
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_seconds: default_reset_timeout_seconds(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Port serving documents, health and metrics
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log level.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Directive understood by `EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions

fn default_cache_max_size() -> usize {
    1000
}
fn default_cache_ttl_seconds() -> u64 {
    300
}
fn default_sweep_interval_seconds() -> u64 {
    30
}
fn default_limiter_name() -> String {
    "default".to_string()
}
fn default_cleanup_interval_seconds() -> u64 {
    60
}
fn default_idle_timeout_seconds() -> u64 {
    120
}
fn default_flush_interval_ms() -> u64 {
    100
}
fn default_max_buffer_size() -> usize {
    10_000
}
fn default_max_batch_size() -> usize {
    crate::store::MAX_BATCH_WRITES
}
fn default_commit_timeout_ms() -> u64 {
    10_000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_seconds() -> u64 {
    30
}
fn default_success_threshold() -> u32 {
    2
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.cache.max_size == 0 {
            return Err(crate::Error::Config(
                "cache.max_size must be at least 1".into(),
            ));
        }

        if self.cache.default_ttl_seconds > crate::cache::MAX_TTL.as_secs() {
            return Err(crate::Error::Config(format!(
                "cache.default_ttl_seconds must be at most {}",
                crate::cache::MAX_TTL.as_secs()
            )));
        }

        if self.cache.sweep_interval_seconds == 0 {
            return Err(crate::Error::Config(
                "cache.sweep_interval_seconds must be at least 1".into(),
            ));
        }

        self.rate_limits.endpoint.validate()?;
        self.rate_limits.write.validate()?;
        self.rate_limits.global.validate()?;

        let writer = &self.batch_writer;
        if writer.max_batch_size == 0 || writer.max_batch_size > crate::store::MAX_BATCH_WRITES {
            return Err(crate::Error::Config(format!(
                "batch_writer.max_batch_size must be between 1 and {}",
                crate::store::MAX_BATCH_WRITES
            )));
        }

        if writer.max_buffer_size == 0 {
            return Err(crate::Error::Config(
                "batch_writer.max_buffer_size must be at least 1".into(),
            ));
        }

        if writer.flush_interval_ms == 0 {
            return Err(crate::Error::Config(
                "batch_writer.flush_interval_ms must be at least 1".into(),
            ));
        }

        if writer.max_buffer_size < writer.max_batch_size {
            tracing::warn!(
                max_buffer_size = writer.max_buffer_size,
                max_batch_size = writer.max_batch_size,
                "Buffer smaller than one batch; size-triggered flushes will never fire"
            );
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(crate::Error::Config(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
