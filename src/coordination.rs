//! Process-local lock backend
//!
//! [`MemoryLockProvider`] hands out named locks that exclude each other
//! within one process. It backs single-node deployments and tests; cluster
//! deployments use [`RedisLockProvider`](crate::redis::RedisLockProvider).
//!
//! Handles created from clones of the same provider share one lock table.
//!
//! # Example
//!
//! ```rust
//! use kuba_chef::coordination::MemoryLockProvider;
//! use kuba_chef::engine::traits::{AcquireMode, LockProvider};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let provider = MemoryLockProvider::new();
//! let first = provider.lock_for("sack-1");
//! let second = provider.lock_for("sack-1");
//!
//! assert!(first.acquire(AcquireMode::NonBlocking).await.unwrap());
//! assert!(!second.acquire(AcquireMode::NonBlocking).await.unwrap());
//! first.release().await.unwrap();
//! assert!(second.acquire(AcquireMode::NonBlocking).await.unwrap());
//! # }
//! ```

use crate::engine::traits::{AcquireMode, LockProvider, SackLock};
use crate::error::LockError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Names currently held, plus a wake-up for waiters
#[derive(Default)]
struct LockTable {
    held: Mutex<HashSet<String>>,
    released: Notify,
}

impl LockTable {
    fn remove(&self, name: &str) {
        self.held.lock().remove(name);
        self.released.notify_waiters();
    }
}

/// In-process [`LockProvider`]
#[derive(Clone, Default)]
pub struct MemoryLockProvider {
    table: Arc<LockTable>,
}

impl MemoryLockProvider {
    /// Create a provider with an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any handle currently holds the named lock
    pub fn is_held(&self, name: &str) -> bool {
        self.table.held.lock().contains(name)
    }

    /// Number of locks currently held
    pub fn held_count(&self) -> usize {
        self.table.held.lock().len()
    }
}

impl LockProvider for MemoryLockProvider {
    fn lock_for(&self, name: &str) -> Box<dyn SackLock> {
        Box::new(MemoryLock {
            name: name.to_string(),
            table: Arc::clone(&self.table),
            held: AtomicBool::new(false),
        })
    }
}

/// Handle on one named in-process lock
///
/// Dropping a handle that still holds its lock releases it.
pub struct MemoryLock {
    name: String,
    table: Arc<LockTable>,
    held: AtomicBool,
}

impl MemoryLock {
    fn try_take(&self) -> bool {
        let taken = self.table.held.lock().insert(self.name.clone());
        if taken {
            self.held.store(true, Ordering::Release);
        }
        taken
    }

    async fn wait_for(&self) {
        loop {
            // Register before checking so a release in between is not missed
            let released = self.table.released.notified();
            if self.try_take() {
                return;
            }
            released.await;
        }
    }
}

#[async_trait]
impl SackLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&self, mode: AcquireMode) -> Result<bool, LockError> {
        if self.held.load(Ordering::Acquire) {
            return Err(LockError::Backend(format!(
                "lock {} is already held by this handle",
                self.name
            )));
        }

        match mode {
            AcquireMode::NonBlocking => Ok(self.try_take()),
            AcquireMode::Blocking => {
                self.wait_for().await;
                Ok(true)
            },
            AcquireMode::Timeout(timeout) if timeout.is_zero() => Ok(self.try_take()),
            AcquireMode::Timeout(timeout) => {
                Ok(tokio::time::timeout(timeout, self.wait_for()).await.is_ok())
            },
        }
    }

    async fn release(&self) -> Result<(), LockError> {
        if !self.held.swap(false, Ordering::AcqRel) {
            return Err(LockError::NotHeld(self.name.clone()));
        }
        self.table.remove(&self.name);
        Ok(())
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        if self.held.swap(false, Ordering::AcqRel) {
            tracing::debug!(lock = %self.name, "Releasing in-memory lock on drop");
            self.table.remove(&self.name);
        }
    }
}
