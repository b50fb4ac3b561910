//! Capability traits for the collaborators the chef drives
//!
//! Each trait exposes only the operations the chef actually calls, so
//! test doubles stay small and the external surface stays explicit.

use crate::error::{IndexError, IngestionError, LockError, StorageError};
use crate::types::{Measure, Metric, MetricFilter, MetricId, SackId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

// =============================================================================
// MetricIndex Trait
// =============================================================================

/// Metadata index holding metric records and their lifecycle status
#[async_trait]
pub trait MetricIndex: Send + Sync + 'static {
    /// List metrics matching the filter, in index order
    async fn list_metrics(&self, filter: &MetricFilter) -> Result<Vec<Metric>, IndexError>;

    /// Remove the metric record permanently
    ///
    /// Fails with [`IndexError::NoSuchMetric`] if the record is already gone.
    async fn expunge_metric(&self, metric_id: &MetricId) -> Result<(), IndexError>;
}

// =============================================================================
// MeasureIngestor Trait
// =============================================================================

/// Incoming measure queue, partitioned into sacks
#[async_trait]
pub trait MeasureIngestor: Send + Sync + 'static {
    /// Number of sacks the queue is partitioned into
    fn num_sacks(&self) -> u32;

    /// Sack the metric's measures are queued in
    fn sack_for(&self, metric_id: &MetricId) -> SackId;

    /// Metrics that currently have unprocessed measures in a sack
    async fn metrics_with_pending(&self, sack: SackId) -> Result<Vec<MetricId>, IngestionError>;

    /// Drop every queued, unprocessed measure for the metric
    async fn delete_unprocessed_measures(&self, metric_id: &MetricId)
        -> Result<(), IngestionError>;

    /// Claim the pending measures of the given metrics for one processing attempt
    async fn claim_measures(
        &self,
        metric_ids: &[MetricId],
    ) -> Result<Box<dyn MeasureClaim>, IngestionError>;
}

/// Exclusive handle over the measures claimed by one processing attempt
///
/// The claim ends with exactly one of [`commit`](MeasureClaim::commit) or
/// [`abort`](MeasureClaim::abort). Implementations must behave like `abort`
/// when dropped without either, so claimed measures never stay claimed.
#[async_trait]
pub trait MeasureClaim: Send {
    /// Move the claimed measures out of the handle, keyed by metric
    ///
    /// Returns an empty map on subsequent calls.
    fn take_measures(&mut self) -> HashMap<MetricId, Vec<Measure>>;

    /// Record that the metric's measures are durably folded into storage
    fn mark_processed(&mut self, metric_id: &MetricId);

    /// Finish the attempt: every claimed measure is consumed
    async fn commit(self: Box<Self>) -> Result<(), IngestionError>;

    /// Give up: measures of processed metrics are consumed, the rest return to pending
    async fn abort(self: Box<Self>) -> Result<(), IngestionError>;
}

// =============================================================================
// SeriesStore Trait
// =============================================================================

/// Persistent timeseries storage
#[async_trait]
pub trait SeriesStore: Send + Sync + 'static {
    /// Fold new measures into the metric's stored series and persist them
    async fn fold_and_persist(&self, metric: &Metric, measures: &[Measure])
        -> Result<(), StorageError>;

    /// Physically delete the metric's stored series
    async fn delete_series(&self, metric: &Metric) -> Result<(), StorageError>;
}

// =============================================================================
// LockProvider Trait
// =============================================================================

/// How long a lock acquisition may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Single attempt, never waits
    NonBlocking,
    /// Wait until the lock is free
    Blocking,
    /// Wait at most this long; zero means a single attempt
    Timeout(Duration),
}

impl AcquireMode {
    /// Blocking for synchronous callers, a single attempt otherwise
    pub fn for_sync(sync: bool) -> Self {
        if sync {
            AcquireMode::Blocking
        } else {
            AcquireMode::NonBlocking
        }
    }

    /// Label used for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            AcquireMode::NonBlocking => "non_blocking",
            AcquireMode::Blocking => "blocking",
            AcquireMode::Timeout(_) => "timeout",
        }
    }
}

impl fmt::Display for AcquireMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireMode::Timeout(d) => write!(f, "timeout({:?})", d),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Produces named mutual-exclusion handles
pub trait LockProvider: Send + Sync + 'static {
    /// Handle for the lock with this name; acquiring it is up to the caller
    fn lock_for(&self, name: &str) -> Box<dyn SackLock>;
}

/// A named lock handle
#[async_trait]
pub trait SackLock: Send + Sync {
    /// Lock name as known to the backend
    fn name(&self) -> &str;

    /// Try to take the lock; `Ok(false)` means contended
    async fn acquire(&self, mode: AcquireMode) -> Result<bool, LockError>;

    /// Release a lock taken through this handle
    async fn release(&self) -> Result<(), LockError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_mode_for_sync() {
        assert_eq!(AcquireMode::for_sync(true), AcquireMode::Blocking);
        assert_eq!(AcquireMode::for_sync(false), AcquireMode::NonBlocking);
    }

    #[test]
    fn test_acquire_mode_display() {
        assert_eq!(AcquireMode::NonBlocking.to_string(), "non_blocking");
        assert_eq!(
            AcquireMode::Timeout(Duration::from_millis(5)).to_string(),
            "timeout(5ms)"
        );
        assert_eq!(AcquireMode::Timeout(Duration::ZERO).label(), "timeout");
    }
}
