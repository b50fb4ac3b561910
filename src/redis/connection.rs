//! Redis connection handling with retry logic
//!
//! One multiplexed connection is shared by every lock handle; Redis
//! pipelines concurrent commands over it. Commands run through
//! [`RedisPool::execute`], which applies a timeout, retries transient
//! failures with exponential backoff and reconnects after dropped
//! connections. [`RedisPool::execute_once`] makes a single attempt for
//! callers that must answer within one command timeout.
//!
//! # Example
//!
//! ```rust,no_run
//! use kuba_chef::redis::{RedisConfig, RedisPool};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = RedisPool::new(RedisConfig::with_url("redis://localhost:6379")).await?;
//! let pong: String = pool
//!     .execute(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::LockConfig;
use crate::error::LockError;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::util::safe_redis_error;

/// Redis connection configuration
#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// Redis server URL (e.g., "redis://localhost:6379")
    pub url: String,

    /// Timeout for establishing a connection
    /// Default: 5 seconds
    pub connection_timeout: Duration,

    /// Timeout for a single command
    /// Default: 1 second
    pub command_timeout: Duration,

    /// Retry policy for failed commands
    pub retry_policy: RetryPolicy,

    /// Connect over TLS (`rediss://`)
    /// Default: false
    pub tls_enabled: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
            tls_enabled: false,
        }
    }
}

impl RedisConfig {
    /// Create a config for the given URL; TLS follows the URL scheme
    pub fn with_url(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            tls_enabled: url.starts_with("rediss://"),
            url,
            ..Default::default()
        }
    }

    /// Connection settings for the Redis lock backend
    pub fn from_lock_config(config: &LockConfig) -> Self {
        Self::with_url(config.redis_url.clone())
    }

    /// Set the command timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the retry policy
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }

        #[cfg(not(feature = "redis-tls"))]
        if self.tls_enabled {
            return Err(
                "TLS requested but the 'redis-tls' feature is not compiled in".to_string(),
            );
        }

        if self.tls_enabled != self.url.starts_with("rediss://") {
            return Err("TLS setting does not match the URL scheme; use 'rediss://' for TLS \
                 and 'redis://' otherwise"
                .to_string());
        }

        Ok(())
    }
}

/// Retry policy with exponential backoff
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    /// Default: 3
    pub max_retries: u32,

    /// Delay before the first retry
    /// Default: 50ms
    pub initial_delay: Duration,

    /// Upper bound on any single delay
    /// Default: 2 seconds
    pub max_delay: Duration,

    /// Multiplier for exponential backoff
    /// Default: 2.0
    pub multiplier: f64,

    /// Add up to 25% random jitter to delays
    /// Default: true
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let delay_ms = if self.jitter {
            capped * (1.0 + rand::random::<f64>() * 0.25)
        } else {
            capped
        };

        Duration::from_millis(delay_ms as u64)
    }

    /// Whether another retry is allowed after `attempt` failures
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Shared Redis connection
pub struct RedisPool {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    config: RedisConfig,
}

impl RedisPool {
    /// Validate the config and open the connection
    pub async fn new(config: RedisConfig) -> Result<Self, LockError> {
        config.validate().map_err(LockError::ConnectionError)?;

        let client = Client::open(config.url.as_str())
            .map_err(|e| LockError::ConnectionError(safe_redis_error(&config.url, &e)))?;

        let pool = Self {
            client,
            connection: RwLock::new(None),
            config,
        };
        pool.connect().await?;

        debug!("Redis lock connection initialized");
        Ok(pool)
    }

    async fn connect(&self) -> Result<MultiplexedConnection, LockError> {
        let start = Instant::now();

        let conn = tokio::time::timeout(
            self.config.connection_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| LockError::ConnectionError("Connection timeout".to_string()))?
        .map_err(|e| LockError::ConnectionError(safe_redis_error(&self.config.url, &e)))?;

        *self.connection.write().await = Some(conn.clone());
        debug!(elapsed = ?start.elapsed(), "Redis connection established");
        Ok(conn)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, LockError> {
        let existing = self.connection.read().await.clone();
        match existing {
            Some(conn) => Ok(conn),
            None => self.connect().await,
        }
    }

    /// Run a command with timeout and retry
    ///
    /// `f` receives a clone of the shared connection and may be called once
    /// per attempt.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, LockError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        self.run(&self.config.retry_policy, f).await
    }

    /// Run a command once, bounded by the command timeout
    ///
    /// The bound covers reconnecting too, so the call never waits on the
    /// longer connection timeout.
    pub async fn execute_once<F, Fut, T>(&self, f: F) -> Result<T, LockError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        tokio::time::timeout(self.config.command_timeout, self.run(&RetryPolicy::none(), f))
            .await
            .map_err(|_| LockError::ConnectionError("Command timeout".to_string()))?
    }

    async fn run<F, Fut, T>(&self, policy: &RetryPolicy, f: F) -> Result<T, LockError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        let mut attempt = 0;

        loop {
            let conn = self.connection().await?;

            match tokio::time::timeout(self.config.command_timeout, f(conn)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    if !(policy.should_retry(attempt) && is_retriable_error(&e)) {
                        if e.is_connection_dropped() || e.is_io_error() {
                            *self.connection.write().await = None;
                        }
                        return Err(LockError::Backend(safe_redis_error(&self.config.url, &e)));
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay = ?delay,
                        error = %safe_redis_error(&self.config.url, &e),
                        "Redis command failed, retrying"
                    );
                    tokio::time::sleep(delay).await;

                    if e.is_connection_dropped() || e.is_io_error() {
                        *self.connection.write().await = None;
                    }
                },
                Err(_) => {
                    if !policy.should_retry(attempt) {
                        return Err(LockError::ConnectionError("Command timeout".to_string()));
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    warn!(attempt = attempt + 1, delay = ?delay, "Redis command timed out, retrying");
                    tokio::time::sleep(delay).await;
                },
            }

            attempt += 1;
        }
    }

    /// Connection configuration
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }
}

/// Transient failures worth another attempt
fn is_retriable_error(e: &RedisError) -> bool {
    e.is_connection_dropped()
        || e.is_timeout()
        || e.is_io_error()
        || matches!(
            e.kind(),
            redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain
        )
}
