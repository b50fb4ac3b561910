//! Redis lease locks
//!
//! A sack lock is the key `{lock name}` holding a random token:
//!
//! ```text
//! acquire:  EVALSHA acquire_lock 1 <name> <token> <lease_ttl_ms>   (SET NX PX, idempotent per token)
//! renew:    EVALSHA extend_lock  1 <name> <token> <lease_ttl_ms>   (compare-and-expire)
//! release:  EVALSHA release_lock 1 <name> <token>                  (compare-and-delete)
//! ```
//!
//! The lease bounds how long a crashed worker can keep a sack locked. A live
//! holder renews it every third of the lease until release or drop.
//! Non-blocking acquisitions make one bounded attempt; blocking and timed
//! ones poll at `poll_interval`.

use super::connection::{RedisConfig, RedisPool};
use super::scripts::LuaScripts;
use crate::config::LockConfig;
use crate::engine::traits::{AcquireMode, LockProvider, SackLock};
use crate::error::LockError;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::Script;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// [`LockProvider`] backed by Redis
#[derive(Clone)]
pub struct RedisLockProvider {
    pool: Arc<RedisPool>,
    scripts: Arc<LuaScripts>,
    lease_ttl: Duration,
    poll_interval: Duration,
}

impl RedisLockProvider {
    /// Connect using the lock section of the chef configuration
    pub async fn connect(config: &LockConfig) -> Result<Self, LockError> {
        let pool = RedisPool::new(RedisConfig::from_lock_config(config)).await?;
        Ok(Self::with_pool(
            Arc::new(pool),
            Duration::from_millis(config.lease_ttl_ms),
            Duration::from_millis(config.poll_interval_ms),
        ))
    }

    /// Build on an existing connection
    pub fn with_pool(pool: Arc<RedisPool>, lease_ttl: Duration, poll_interval: Duration) -> Self {
        Self {
            pool,
            scripts: Arc::new(LuaScripts::new()),
            lease_ttl,
            poll_interval,
        }
    }

    /// Lease applied to every acquired lock
    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }
}

impl LockProvider for RedisLockProvider {
    fn lock_for(&self, name: &str) -> Box<dyn SackLock> {
        Box::new(RedisSackLock {
            name: name.to_string(),
            pool: Arc::clone(&self.pool),
            acquire_script: self.scripts.acquire_lock(),
            extend_script: self.scripts.extend_lock(),
            release_script: self.scripts.release_lock(),
            lease_ms: lease_millis(self.lease_ttl),
            poll_interval: self.poll_interval,
            held: Mutex::new(None),
        })
    }
}

/// Lease in whole milliseconds, never zero (`PX 0` is rejected by Redis)
fn lease_millis(lease: Duration) -> u64 {
    (lease.as_millis() as u64).max(1)
}

/// Pause between renewals of a lease
fn renew_interval(lease_ms: u64) -> Duration {
    Duration::from_millis((lease_ms / 3).max(1))
}

/// Lease this handle currently holds
struct Held {
    token: String,
    renewal: JoinHandle<()>,
}

/// Handle on one Redis lease lock
pub struct RedisSackLock {
    name: String,
    pool: Arc<RedisPool>,
    acquire_script: Arc<Script>,
    extend_script: Arc<Script>,
    release_script: Arc<Script>,
    lease_ms: u64,
    poll_interval: Duration,
    held: Mutex<Option<Held>>,
}

impl RedisSackLock {
    async fn try_set(&self, token: &str) -> Result<bool, LockError> {
        let acquired: i32 = self
            .pool
            .execute(|mut conn| {
                let script = Arc::clone(&self.acquire_script);
                let name = self.name.clone();
                let token = token.to_string();
                let lease_ms = self.lease_ms;
                async move {
                    script
                        .key(name)
                        .arg(token)
                        .arg(lease_ms)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(acquired == 1)
    }

    /// Single attempt for callers that must not wait
    async fn try_set_once(&self, token: &str) -> Result<bool, LockError> {
        let acquired: i32 = self
            .pool
            .execute_once(|mut conn| {
                let script = Arc::clone(&self.acquire_script);
                let name = self.name.clone();
                let token = token.to_string();
                let lease_ms = self.lease_ms;
                async move {
                    script
                        .key(name)
                        .arg(token)
                        .arg(lease_ms)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(acquired == 1)
    }

    async fn poll_until(&self, token: &str, deadline: Option<Instant>) -> Result<bool, LockError> {
        loop {
            if self.try_set(token).await? {
                return Ok(true);
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    self.poll_interval.min(deadline - now)
                },
                None => self.poll_interval,
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// Keep the lease alive until the task is aborted or the lease is lost
    fn spawn_renewal(&self, token: String) -> JoinHandle<()> {
        let pool = Arc::clone(&self.pool);
        let script = Arc::clone(&self.extend_script);
        let name = self.name.clone();
        let lease_ms = self.lease_ms;
        let interval = renew_interval(lease_ms);

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let result: Result<i32, LockError> = pool
                    .execute(|mut conn| {
                        let script = Arc::clone(&script);
                        let name = name.clone();
                        let token = token.clone();
                        async move {
                            script
                                .key(name)
                                .arg(token)
                                .arg(lease_ms)
                                .invoke_async(&mut conn)
                                .await
                        }
                    })
                    .await;
                match result {
                    Ok(1) => debug!(lock = %name, "Renewed Redis lease"),
                    Ok(_) => {
                        warn!(lock = %name, "Lease lost before release, no longer renewing");
                        return;
                    },
                    Err(e) => warn!(lock = %name, error = %e, "Failed to renew Redis lease"),
                }
            }
        })
    }
}

/// Compare-and-delete off the caller's task
fn spawn_release(pool: Arc<RedisPool>, script: Arc<Script>, name: String, token: String) {
    // Without a runtime the lease simply runs out
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };

    handle.spawn(async move {
        let result: Result<i32, LockError> = pool
            .execute(|mut conn| {
                let script = Arc::clone(&script);
                let name = name.clone();
                let token = token.clone();
                async move { script.key(name).arg(token).invoke_async(&mut conn).await }
            })
            .await;
        if let Err(e) = result {
            warn!(lock = %name, error = %e, "Failed to release Redis lock in background");
        }
    });
}

#[async_trait]
impl SackLock for RedisSackLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&self, mode: AcquireMode) -> Result<bool, LockError> {
        if self.held.lock().is_some() {
            return Err(LockError::Backend(format!(
                "lock {} is already held by this handle",
                self.name
            )));
        }

        // One token per call so a retried attempt recognises its own key
        let token = Uuid::new_v4().to_string();
        let result = match mode {
            AcquireMode::NonBlocking => self.try_set_once(&token).await,
            AcquireMode::Timeout(timeout) if timeout.is_zero() => self.try_set_once(&token).await,
            AcquireMode::Timeout(timeout) => {
                self.poll_until(&token, Some(Instant::now() + timeout)).await
            },
            AcquireMode::Blocking => self.poll_until(&token, None).await,
        };

        let acquired = match result {
            Ok(acquired) => acquired,
            Err(e) => {
                // The write may have landed before the error; drop it if so
                spawn_release(
                    Arc::clone(&self.pool),
                    Arc::clone(&self.release_script),
                    self.name.clone(),
                    token,
                );
                return Err(e);
            },
        };

        if acquired {
            let renewal = self.spawn_renewal(token.clone());
            *self.held.lock() = Some(Held { token, renewal });
        }
        Ok(acquired)
    }

    async fn release(&self) -> Result<(), LockError> {
        let Held { token, renewal } = self
            .held
            .lock()
            .take()
            .ok_or_else(|| LockError::NotHeld(self.name.clone()))?;
        renewal.abort();

        let deleted: i32 = self
            .pool
            .execute(|mut conn| {
                let script = Arc::clone(&self.release_script);
                let name = self.name.clone();
                let token = token.clone();
                async move { script.key(name).arg(token).invoke_async(&mut conn).await }
            })
            .await?;

        if deleted == 0 {
            warn!(lock = %self.name, "Lease expired before release");
        }
        Ok(())
    }
}

impl Drop for RedisSackLock {
    fn drop(&mut self) {
        let Some(Held { token, renewal }) = self.held.get_mut().take() else {
            return;
        };
        renewal.abort();

        debug!(lock = %self.name, "Releasing Redis lock on drop");
        spawn_release(
            Arc::clone(&self.pool),
            Arc::clone(&self.release_script),
            std::mem::take(&mut self.name),
            token,
        );
    }
}
