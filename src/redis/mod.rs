//! Redis lock backend
//!
//! Sack locks for multi-node deployments. Every worker that points at the
//! same Redis server and uses the same lock prefix shares the sack locks.
//!
//! # Example
//!
//! ```rust,no_run
//! use kuba_chef::config::LockConfig;
//! use kuba_chef::engine::traits::{AcquireMode, LockProvider};
//! use kuba_chef::redis::RedisLockProvider;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = RedisLockProvider::connect(&LockConfig::default()).await?;
//! let lock = provider.lock_for("kuba-sack-demo");
//! if lock.acquire(AcquireMode::NonBlocking).await? {
//!     lock.release().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod lock;
pub mod scripts;
pub mod util;

pub use connection::{RedisConfig, RedisPool, RetryPolicy};
pub use lock::{RedisLockProvider, RedisSackLock};
pub use scripts::LuaScripts;
