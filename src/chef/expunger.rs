//! Purging metrics marked for deletion
//!
//! Pending-delete metrics are grouped by sack. Each sack's lock is probed
//! once: taken and released straight away. A free lock means no other
//! expunger is working the sack, so its metrics are purged; a contended lock
//! defers the whole sack to a later call. The deletion itself runs without
//! the lock, because the pending-delete status already keeps measure
//! processing away from these metrics.
//!
//! Each metric is purged in three steps, in order: queued measures, stored
//! series, index record. An index record that is already gone means another
//! process finished the job, which is fine.

use super::report::{ExpungeReport, MetricOutcome, SackOutcome, SackReport};
use crate::engine::traits::{AcquireMode, MeasureIngestor, MetricIndex, SeriesStore};
use crate::error::{Error, IndexError, LockError, Result};
use crate::metrics;
use crate::sack::SackLocks;
use crate::types::{Metric, MetricFilter, SackId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Runs expunge passes
pub struct MetricExpunger {
    index: Arc<dyn MetricIndex>,
    ingestor: Arc<dyn MeasureIngestor>,
    storage: Arc<dyn SeriesStore>,
    locks: SackLocks,
}

impl MetricExpunger {
    /// Create an expunger over the given collaborators
    pub fn new(
        index: Arc<dyn MetricIndex>,
        ingestor: Arc<dyn MeasureIngestor>,
        storage: Arc<dyn SeriesStore>,
        locks: SackLocks,
    ) -> Self {
        Self {
            index,
            ingestor,
            storage,
            locks,
        }
    }

    pub(crate) fn set_locks(&mut self, locks: SackLocks) {
        self.locks = locks;
    }

    /// Purge every pending-delete metric whose sack is free
    ///
    /// Without `sync`, lock probes never wait, contended sacks are deferred
    /// and a failing metric is logged and skipped.
    ///
    /// With `sync`, lock probes wait, and the first failure is returned
    /// immediately. Metrics and sacks after the failing one are not
    /// attempted in that call, unlike the skip-and-continue handling of
    /// contended sacks.
    pub async fn expunge(&self, sync: bool) -> Result<ExpungeReport> {
        let pending = self
            .index
            .list_metrics(&MetricFilter::pending_delete())
            .await?;

        let mut report = ExpungeReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        let groups = self.group_by_sack(pending);
        debug!(sacks = groups.len(), sync, "Expunging pending-delete metrics");

        let mode = AcquireMode::for_sync(sync);
        for (sack, group) in groups {
            match self.probe_sack(sack, mode).await {
                Ok(true) => {},
                Ok(false) => {
                    debug!(sack = %sack, "Sack is locked by another process, deferring expunge");
                    metrics::record_sack_deferred("expunge");
                    report.sacks.push(SackReport::skipped(
                        sack,
                        SackOutcome::Deferred,
                        group.iter().map(|m| m.id).collect(),
                    ));
                    continue;
                },
                Err(e) => {
                    metrics::record_error("lock", "expunge");
                    if sync {
                        return Err(e.into());
                    }
                    error!(sack = %sack, error = %e, "Unable to lock sack for expunge");
                    report.sacks.push(SackReport::skipped(
                        sack,
                        SackOutcome::LockFailed(e.to_string()),
                        group.iter().map(|m| m.id).collect(),
                    ));
                    continue;
                },
            }

            let mut sack_report = SackReport::probed(sack);
            for metric in &group {
                let outcome = match self.expunge_metric(metric).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        metrics::record_error(e.kind(), "expunge");
                        if sync {
                            return Err(e);
                        }
                        error!(
                            metric_id = %metric.id,
                            sack = %sack,
                            error = %e,
                            "Unable to expunge metric"
                        );
                        MetricOutcome::Failed(e.to_string())
                    },
                };
                metrics::record_expunge(outcome.label());
                sack_report.metrics.push((metric.id, outcome));
            }
            report.sacks.push(sack_report);
        }

        Ok(report)
    }

    /// Group metrics by sack; sacks ascend, metrics keep index order
    fn group_by_sack(&self, metrics: Vec<Metric>) -> BTreeMap<SackId, Vec<Metric>> {
        let mut groups: BTreeMap<SackId, Vec<Metric>> = BTreeMap::new();
        for metric in metrics {
            groups
                .entry(self.ingestor.sack_for(&metric.id))
                .or_default()
                .push(metric);
        }
        groups
    }

    /// Take and immediately release a sack's lock; `false` if contended
    async fn probe_sack(
        &self,
        sack: SackId,
        mode: AcquireMode,
    ) -> std::result::Result<bool, LockError> {
        let lock = self.locks.lock_for(sack);
        if !self.locks.acquire(lock.as_ref(), mode).await? {
            return Ok(false);
        }
        lock.release().await?;
        Ok(true)
    }

    /// Remove one metric from every store
    async fn expunge_metric(&self, metric: &Metric) -> Result<MetricOutcome> {
        debug!(metric_id = %metric.id, "Deleting metric");

        self.ingestor.delete_unprocessed_measures(&metric.id).await?;
        self.storage.delete_series(metric).await?;

        match self.index.expunge_metric(&metric.id).await {
            Ok(()) => Ok(MetricOutcome::Deleted),
            Err(IndexError::NoSuchMetric(_)) => {
                debug!(metric_id = %metric.id, "Metric already expunged by another process");
                Ok(MetricOutcome::AlreadyGone)
            },
            Err(e) => Err(Error::Index(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryLockProvider;
    use crate::engine::stubs::{InMemoryIngestor, InMemoryMetricIndex, InMemorySeriesStore};
    use crate::engine::traits::LockProvider;
    use crate::sack::DEFAULT_LOCK_PREFIX;
    use crate::types::{Measure, MetricStatus};

    struct Fixture {
        index: Arc<InMemoryMetricIndex>,
        ingestor: Arc<InMemoryIngestor>,
        storage: Arc<InMemorySeriesStore>,
        locks: MemoryLockProvider,
        expunger: MetricExpunger,
    }

    fn fixture() -> Fixture {
        let index = Arc::new(InMemoryMetricIndex::new());
        let ingestor = Arc::new(InMemoryIngestor::new(4));
        let storage = Arc::new(InMemorySeriesStore::new());
        let locks = MemoryLockProvider::new();
        let expunger = MetricExpunger::new(
            index.clone(),
            ingestor.clone(),
            storage.clone(),
            SackLocks::new(Arc::new(locks.clone()), DEFAULT_LOCK_PREFIX),
        );
        Fixture {
            index,
            ingestor,
            storage,
            locks,
            expunger,
        }
    }

    fn doomed() -> Metric {
        Metric::active_new().with_status(MetricStatus::PendingDelete)
    }

    #[tokio::test]
    async fn test_purges_all_stores() {
        let f = fixture();
        let metric = doomed();
        f.index.insert(metric.clone());
        f.ingestor.add_measures(metric.id, [Measure::new(1, 1.0)]);
        f.storage.insert_series(metric.id, vec![Measure::new(0, 0.0)]);

        let report = f.expunger.expunge(false).await.unwrap();
        assert_eq!(report.deleted(), vec![metric.id]);
        assert!(f.index.get(&metric.id).is_none());
        assert!(f.storage.series(&metric.id).is_none());
        assert!(f.ingestor.pending_measures(&metric.id).is_empty());
        assert_eq!(f.locks.held_count(), 0);
    }

    #[tokio::test]
    async fn test_active_metrics_untouched() {
        let f = fixture();
        let live = Metric::active_new();
        f.index.insert(live.clone());

        let report = f.expunger.expunge(true).await.unwrap();
        assert!(report.sacks.is_empty());
        assert_eq!(f.index.len(), 1);
        assert_eq!(f.storage.delete_calls(&live.id), 0);
    }

    #[tokio::test]
    async fn test_sacks_visited_once_in_order() {
        let f = fixture();
        for _ in 0..32 {
            f.index.insert(doomed());
        }

        let report = f.expunger.expunge(false).await.unwrap();
        let sacks: Vec<SackId> = report.sacks.iter().map(|s| s.sack).collect();
        let mut sorted = sacks.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sacks, sorted);
        assert_eq!(report.deleted().len(), 32);
    }

    #[tokio::test]
    async fn test_contended_sack_deferred() {
        let f = fixture();
        let metric = doomed();
        f.index.insert(metric.clone());

        let sack = f.ingestor.sack_for(&metric.id);
        let holder = f
            .locks
            .lock_for(&crate::sack::lock_name(DEFAULT_LOCK_PREFIX, sack));
        assert!(holder.acquire(AcquireMode::NonBlocking).await.unwrap());

        let report = f.expunger.expunge(false).await.unwrap();
        assert_eq!(report.deferred_sacks(), vec![sack]);
        assert_eq!(report.sacks[0].skipped, vec![metric.id]);
        assert!(f.index.get(&metric.id).is_some());
        assert_eq!(f.ingestor.delete_calls(&metric.id), 0);
    }

    #[tokio::test]
    async fn test_raced_metric_is_already_gone() {
        let f = fixture();
        let metric = doomed();
        f.index.insert(metric.clone());
        f.index.race_expunge(metric.id);

        let report = f.expunger.expunge(true).await.unwrap();
        assert_eq!(report.already_gone(), vec![metric.id]);
        assert_eq!(f.storage.delete_calls(&metric.id), 1);
        assert_eq!(f.ingestor.delete_calls(&metric.id), 1);
    }

    #[tokio::test]
    async fn test_async_failure_continues() {
        let f = fixture();
        let broken = doomed();
        let fine = doomed();
        f.index.insert(broken.clone());
        f.index.insert(fine.clone());
        f.ingestor.fail_delete_for(broken.id, "queue offline");

        let report = f.expunger.expunge(false).await.unwrap();
        assert_eq!(report.deleted(), vec![fine.id]);
        let failed = report.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, broken.id);
        assert!(failed[0].1.contains("queue offline"));
        // Later steps for the failing metric were not attempted
        assert_eq!(f.storage.delete_calls(&broken.id), 0);
        assert!(f.index.get(&broken.id).is_some());
    }

    #[tokio::test]
    async fn test_listing_failure_propagates() {
        let f = fixture();
        let metric = doomed();
        f.index.insert(metric.clone());
        f.index.fail_listing("index down");

        assert!(matches!(
            f.expunger.expunge(false).await,
            Err(Error::Index(IndexError::ConnectionError(_)))
        ));
        assert_eq!(f.ingestor.delete_calls(&metric.id), 0);
    }
}
