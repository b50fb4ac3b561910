//! Sack assignment and per-sack lock naming
//!
//! Metrics are spread over a fixed number of sacks. A sack is the unit of
//! distributed locking: workers serialise on a sack, never on the whole
//! metric population.
//!
//! Lock names are the hex SHA-256 of `"{prefix}-{sack}-lock"`, so every
//! name is 64 ASCII characters no matter how wide the sack number is. Some
//! lock backends cap key length; this keeps names under any such cap.
//!
//! # Example
//!
//! ```rust
//! use kuba_chef::sack::{lock_name, SackAssigner};
//! use kuba_chef::types::MetricId;
//!
//! let assigner = SackAssigner::new(128);
//! let metric_id = MetricId::new();
//! assert_eq!(assigner.sack_for(&metric_id), assigner.sack_for(&metric_id));
//!
//! let name = lock_name("kuba-sack", assigner.sack_for(&metric_id));
//! assert_eq!(name.len(), 64);
//! ```

use crate::engine::traits::{AcquireMode, LockProvider, SackLock};
use crate::error::LockError;
use crate::metrics;
use crate::types::{MetricId, SackId};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;

/// Default prefix of the lock-name template
pub const DEFAULT_LOCK_PREFIX: &str = "kuba-sack";

/// Deterministic metric → sack mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackAssigner {
    num_sacks: u32,
}

impl SackAssigner {
    /// Create an assigner over `num_sacks` sacks
    ///
    /// # Panics
    ///
    /// Panics if `num_sacks` is 0.
    pub fn new(num_sacks: u32) -> Self {
        assert!(num_sacks > 0, "num_sacks must be > 0");
        Self { num_sacks }
    }

    /// Number of sacks metrics are spread over
    pub fn num_sacks(&self) -> u32 {
        self.num_sacks
    }

    /// Sack of a metric; stable for the metric's whole lifetime
    pub fn sack_for(&self, metric_id: &MetricId) -> SackId {
        SackId((metric_id.as_u128() % self.num_sacks as u128) as u32)
    }
}

/// Backend lock name for a sack
pub fn lock_name(prefix: &str, sack: SackId) -> String {
    let digest = Sha256::digest(format!("{}-{}-lock", prefix, sack).as_bytes());
    hex::encode(digest)
}

/// Sack-keyed view over a [`LockProvider`]
///
/// Derives lock names and records how long acquisitions wait.
#[derive(Clone)]
pub struct SackLocks {
    provider: Arc<dyn LockProvider>,
    prefix: String,
}

impl SackLocks {
    /// Wrap a provider with the given lock-name prefix
    pub fn new(provider: Arc<dyn LockProvider>, prefix: impl Into<String>) -> Self {
        Self {
            provider,
            prefix: prefix.into(),
        }
    }

    /// Same provider, different prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Lock-name prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Lock name for a sack
    pub fn name_for(&self, sack: SackId) -> String {
        lock_name(&self.prefix, sack)
    }

    /// Lock handle for a sack
    pub fn lock_for(&self, sack: SackId) -> Box<dyn SackLock> {
        self.provider.lock_for(&self.name_for(sack))
    }

    /// Acquire a handle, timing the wait
    pub async fn acquire(&self, lock: &dyn SackLock, mode: AcquireMode) -> Result<bool, LockError> {
        let start = Instant::now();
        let result = lock.acquire(mode).await;
        metrics::record_lock_wait(mode.label(), start.elapsed().as_secs_f64());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_sack_assignment_is_stable() {
        let assigner = SackAssigner::new(64);
        for _ in 0..100 {
            let id = MetricId::new();
            let sack = assigner.sack_for(&id);
            assert!(sack.0 < 64);
            assert_eq!(sack, assigner.sack_for(&id));
        }
    }

    #[test]
    fn test_sack_assignment_uses_uuid_integer() {
        let assigner = SackAssigner::new(10);
        let id = MetricId::from(uuid::Uuid::from_u128(1234));
        assert_eq!(assigner.sack_for(&id), SackId(4));
    }

    #[test]
    fn test_single_sack() {
        let assigner = SackAssigner::new(1);
        assert_eq!(assigner.sack_for(&MetricId::new()), SackId(0));
    }

    #[test]
    #[should_panic(expected = "num_sacks must be > 0")]
    fn test_zero_sacks_panics() {
        SackAssigner::new(0);
    }

    #[test]
    fn test_lock_name_fixed_length() {
        let short = lock_name(DEFAULT_LOCK_PREFIX, SackId(0));
        let long = lock_name(DEFAULT_LOCK_PREFIX, SackId(u32::MAX));
        assert_eq!(short.len(), 64);
        assert_eq!(long.len(), 64);
        assert!(short.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_lock_name_matches_template_digest() {
        let expected = hex::encode(Sha256::digest(b"kuba-sack-42-lock"));
        assert_eq!(lock_name("kuba-sack", SackId(42)), expected);
    }

    #[test]
    fn test_lock_name_depends_on_prefix() {
        assert_ne!(lock_name("a", SackId(1)), lock_name("b", SackId(1)));
        let names: HashSet<_> = (0..1024).map(|s| lock_name("kuba-sack", SackId(s))).collect();
        assert_eq!(names.len(), 1024);
    }
}
