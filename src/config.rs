//! Configuration management for the chef
//!
//! TOML file support, environment variable overrides and sensible defaults.
//!
//! ```toml
//! [sacks]
//! num_sacks = 128
//! lock_prefix = "kuba-sack"
//!
//! [refresh]
//! default_timeout_ms = 10000
//!
//! [lock]
//! backend = "redis"
//! redis_url = "redis://127.0.0.1:6379"
//! lease_ttl_ms = 30000
//! poll_interval_ms = 50
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use crate::error::{Error, ValidationError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChefConfig {
    /// Sack layout
    #[serde(default)]
    pub sacks: SackConfig,

    /// Single-metric refresh settings
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Lock backend settings
    #[serde(default)]
    pub lock: LockConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sack layout configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SackConfig {
    /// Number of sacks metrics are spread over
    #[serde(default = "default_num_sacks")]
    pub num_sacks: u32,

    /// Prefix of the lock-name template `{prefix}-{sack}-lock`
    #[serde(default = "default_lock_prefix")]
    pub lock_prefix: String,
}

/// Refresh configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RefreshConfig {
    /// Default wait for the sack lock when refreshing a metric
    #[serde(default = "default_refresh_timeout_ms")]
    pub default_timeout_ms: u64,
}

/// Lock backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// Process-local locks
    Memory,
    /// Redis `SET NX PX` leases
    Redis,
}

/// Lock backend configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockConfig {
    /// Which backend hands out sack locks
    #[serde(default = "default_lock_backend")]
    pub backend: LockBackend,

    /// Redis server URL (redis backend only)
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Lease length; a crashed holder's lock expires after this
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Retry interval while waiting for a contended lock
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace) or an EnvFilter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

// Default value functions
fn default_num_sacks() -> u32 { 128 }
fn default_lock_prefix() -> String { crate::sack::DEFAULT_LOCK_PREFIX.to_string() }
fn default_refresh_timeout_ms() -> u64 { 10_000 }
fn default_lock_backend() -> LockBackend { LockBackend::Memory }
fn default_redis_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_lease_ttl_ms() -> u64 { 30_000 }
fn default_poll_interval_ms() -> u64 { 50 }
fn default_log_level() -> String { "info".to_string() }

impl Default for SackConfig {
    fn default() -> Self {
        Self {
            num_sacks: default_num_sacks(),
            lock_prefix: default_lock_prefix(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_refresh_timeout_ms(),
        }
    }
}

impl RefreshConfig {
    /// Default refresh timeout as a duration
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: default_lock_backend(),
            redis_url: default_redis_url(),
            lease_ttl_ms: default_lease_ttl_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl ChefConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;

        toml::from_str(&contents)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file {}: {}", path, e)))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, Error> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Sacks
        if let Ok(num_sacks) = std::env::var("KUBA_CHEF_NUM_SACKS") {
            if let Ok(n) = num_sacks.parse() {
                self.sacks.num_sacks = n;
            }
        }
        if let Ok(prefix) = std::env::var("KUBA_CHEF_LOCK_PREFIX") {
            self.sacks.lock_prefix = prefix;
        }

        // Refresh
        if let Ok(timeout) = std::env::var("KUBA_CHEF_REFRESH_TIMEOUT_MS") {
            if let Ok(t) = timeout.parse() {
                self.refresh.default_timeout_ms = t;
            }
        }

        // Lock
        if let Ok(backend) = std::env::var("KUBA_CHEF_LOCK_BACKEND") {
            match backend.to_ascii_lowercase().as_str() {
                "memory" => self.lock.backend = LockBackend::Memory,
                "redis" => self.lock.backend = LockBackend::Redis,
                other => tracing::warn!(backend = other, "Ignoring unknown lock backend override"),
            }
        }
        if let Ok(url) = std::env::var("KUBA_CHEF_REDIS_URL") {
            self.lock.redis_url = url;
        }

        // Logging
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.sacks.num_sacks == 0 {
            return Err(ValidationError::OutOfRange {
                field: "sacks.num_sacks".to_string(),
                value: "0".to_string(),
                min: "1".to_string(),
                max: u32::MAX.to_string(),
            });
        }

        if self.sacks.lock_prefix.is_empty() {
            return Err(ValidationError::MissingField("sacks.lock_prefix".to_string()));
        }

        if self.lock.backend == LockBackend::Redis {
            if self.lock.redis_url.is_empty() {
                return Err(ValidationError::MissingField("lock.redis_url".to_string()));
            }
            if self.lock.lease_ttl_ms == 0 {
                return Err(ValidationError::OutOfRange {
                    field: "lock.lease_ttl_ms".to_string(),
                    value: "0".to_string(),
                    min: "1".to_string(),
                    max: u64::MAX.to_string(),
                });
            }
        }

        if self.lock.poll_interval_ms == 0 {
            return Err(ValidationError::OutOfRange {
                field: "lock.poll_interval_ms".to_string(),
                value: "0".to_string(),
                min: "1".to_string(),
                max: u64::MAX.to_string(),
            });
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &str) -> Result<(), Error> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents)?;
        Ok(())
    }
}
