//! In-memory implementations of the chef's collaborators.
//!
//! These implementations are intended for:
//! - **Unit testing** without external dependencies (Redis, object stores, SQL indexers)
//! - **Integration testing** of the expunge and processing workflows
//! - **Development and prototyping** of new workers
//!
//! # Available Stubs
//!
//! - [`InMemoryMetricIndex`]: metric records with lifecycle status
//! - [`InMemoryIngestor`]: per-metric pending measure queues with exclusive claims
//! - [`InMemorySeriesStore`]: folded series kept in memory
//!
//! Each stub can be told to fail specific calls, and counts the calls it
//! receives, so tests can assert on partial-failure behaviour.
//!
//! # Warning
//!
//! **These stubs are NOT suitable for production use:** all state is lost on
//! restart and nothing is shared between processes.

use crate::engine::traits::{MeasureClaim, MeasureIngestor, MetricIndex, SeriesStore};
use crate::error::{IndexError, IngestionError, StorageError};
use crate::sack::SackAssigner;
use crate::types::{Measure, Metric, MetricFilter, MetricId, MetricStatus, SackId};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// In-Memory Metric Index
// =============================================================================

/// In-memory metric index
///
/// Keeps records in insertion order, which is the order `list_metrics`
/// returns them in.
#[derive(Default)]
pub struct InMemoryMetricIndex {
    metrics: RwLock<Vec<Metric>>,
    /// Metrics another "process" removes just before our expunge lands
    raced: Mutex<HashSet<MetricId>>,
    failing_list: Mutex<Option<String>>,
    expunge_calls: Mutex<HashMap<MetricId, usize>>,
}

impl InMemoryMetricIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a metric record
    pub fn insert(&self, metric: Metric) {
        let mut metrics = self.metrics.write();
        match metrics.iter_mut().find(|m| m.id == metric.id) {
            Some(existing) => *existing = metric,
            None => metrics.push(metric),
        }
    }

    /// Mark a metric for deletion; returns false if unknown
    pub fn mark_pending_delete(&self, metric_id: &MetricId) -> bool {
        let mut metrics = self.metrics.write();
        match metrics.iter_mut().find(|m| m.id == *metric_id) {
            Some(metric) => {
                metric.status = MetricStatus::PendingDelete;
                true
            },
            None => false,
        }
    }

    /// Look up a metric record
    pub fn get(&self, metric_id: &MetricId) -> Option<Metric> {
        self.metrics.read().iter().find(|m| m.id == *metric_id).cloned()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    /// Whether the index has no records
    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }

    /// Simulate a concurrent expunge: the record disappears right before ours
    pub fn race_expunge(&self, metric_id: MetricId) {
        self.raced.lock().insert(metric_id);
    }

    /// Make every `list_metrics` call fail with this message
    pub fn fail_listing(&self, reason: impl Into<String>) {
        *self.failing_list.lock() = Some(reason.into());
    }

    /// Number of `expunge_metric` calls seen for a metric
    pub fn expunge_calls(&self, metric_id: &MetricId) -> usize {
        self.expunge_calls.lock().get(metric_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MetricIndex for InMemoryMetricIndex {
    async fn list_metrics(&self, filter: &MetricFilter) -> Result<Vec<Metric>, IndexError> {
        if let Some(reason) = self.failing_list.lock().clone() {
            return Err(IndexError::ConnectionError(reason));
        }

        Ok(self
            .metrics
            .read()
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect())
    }

    async fn expunge_metric(&self, metric_id: &MetricId) -> Result<(), IndexError> {
        *self.expunge_calls.lock().entry(*metric_id).or_default() += 1;

        let mut metrics = self.metrics.write();
        if self.raced.lock().remove(metric_id) {
            metrics.retain(|m| m.id != *metric_id);
            return Err(IndexError::NoSuchMetric(*metric_id));
        }

        let before = metrics.len();
        metrics.retain(|m| m.id != *metric_id);
        if metrics.len() == before {
            return Err(IndexError::NoSuchMetric(*metric_id));
        }
        Ok(())
    }
}

// =============================================================================
// In-Memory Ingestor
// =============================================================================

#[derive(Default)]
struct QueueState {
    pending: HashMap<MetricId, Vec<Measure>>,
    claimed: HashSet<MetricId>,
}

/// In-memory measure queue
///
/// Claims are exclusive per metric: claiming a metric that another live
/// claim holds fails with [`IngestionError::AlreadyClaimed`].
pub struct InMemoryIngestor {
    assigner: SackAssigner,
    state: Arc<Mutex<QueueState>>,
    failing_deletes: Mutex<HashMap<MetricId, String>>,
    delete_calls: Mutex<HashMap<MetricId, usize>>,
}

impl InMemoryIngestor {
    /// Create a queue spread over `num_sacks` sacks
    pub fn new(num_sacks: u32) -> Self {
        Self {
            assigner: SackAssigner::new(num_sacks),
            state: Arc::new(Mutex::new(QueueState::default())),
            failing_deletes: Mutex::new(HashMap::new()),
            delete_calls: Mutex::new(HashMap::new()),
        }
    }

    /// Queue measures for a metric
    pub fn add_measures(&self, metric_id: MetricId, measures: impl IntoIterator<Item = Measure>) {
        self.state
            .lock()
            .pending
            .entry(metric_id)
            .or_default()
            .extend(measures);
    }

    /// Measures currently queued (unclaimed) for a metric
    pub fn pending_measures(&self, metric_id: &MetricId) -> Vec<Measure> {
        self.state
            .lock()
            .pending
            .get(metric_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether a live claim holds the metric
    pub fn is_claimed(&self, metric_id: &MetricId) -> bool {
        self.state.lock().claimed.contains(metric_id)
    }

    /// Make `delete_unprocessed_measures` fail for a metric
    pub fn fail_delete_for(&self, metric_id: MetricId, reason: impl Into<String>) {
        self.failing_deletes.lock().insert(metric_id, reason.into());
    }

    /// Number of `delete_unprocessed_measures` calls seen for a metric
    pub fn delete_calls(&self, metric_id: &MetricId) -> usize {
        self.delete_calls.lock().get(metric_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MeasureIngestor for InMemoryIngestor {
    fn num_sacks(&self) -> u32 {
        self.assigner.num_sacks()
    }

    fn sack_for(&self, metric_id: &MetricId) -> SackId {
        self.assigner.sack_for(metric_id)
    }

    async fn metrics_with_pending(&self, sack: SackId) -> Result<Vec<MetricId>, IngestionError> {
        let state = self.state.lock();
        let mut ids: Vec<MetricId> = state
            .pending
            .iter()
            .filter(|(id, measures)| !measures.is_empty() && self.assigner.sack_for(id) == sack)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete_unprocessed_measures(
        &self,
        metric_id: &MetricId,
    ) -> Result<(), IngestionError> {
        *self.delete_calls.lock().entry(*metric_id).or_default() += 1;

        if let Some(reason) = self.failing_deletes.lock().get(metric_id) {
            return Err(IngestionError::DeleteError(reason.clone()));
        }

        self.state.lock().pending.remove(metric_id);
        Ok(())
    }

    async fn claim_measures(
        &self,
        metric_ids: &[MetricId],
    ) -> Result<Box<dyn MeasureClaim>, IngestionError> {
        let mut state = self.state.lock();

        if let Some(busy) = metric_ids.iter().find(|id| state.claimed.contains(id)) {
            return Err(IngestionError::AlreadyClaimed(*busy));
        }

        let mut claimed = HashMap::with_capacity(metric_ids.len());
        for id in metric_ids {
            let measures = state.pending.remove(id).unwrap_or_default();
            state.claimed.insert(*id);
            claimed.insert(*id, measures);
        }

        Ok(Box::new(InMemoryClaim {
            state: Arc::clone(&self.state),
            claimed,
            processed: HashSet::new(),
            taken: false,
            finished: false,
        }))
    }
}

/// Claim handed out by [`InMemoryIngestor`]
pub struct InMemoryClaim {
    state: Arc<Mutex<QueueState>>,
    claimed: HashMap<MetricId, Vec<Measure>>,
    processed: HashSet<MetricId>,
    taken: bool,
    finished: bool,
}

impl InMemoryClaim {
    /// Put unprocessed measures back ahead of anything queued since the claim
    fn release(&mut self, consume_all: bool) {
        if self.finished {
            return;
        }
        self.finished = true;

        let mut state = self.state.lock();
        for (id, measures) in self.claimed.drain() {
            state.claimed.remove(&id);
            if consume_all || self.processed.contains(&id) || measures.is_empty() {
                continue;
            }
            let queue = state.pending.entry(id).or_default();
            let arrived_since = std::mem::take(queue);
            *queue = measures;
            queue.extend(arrived_since);
        }
    }
}

#[async_trait]
impl MeasureClaim for InMemoryClaim {
    fn take_measures(&mut self) -> HashMap<MetricId, Vec<Measure>> {
        if std::mem::replace(&mut self.taken, true) {
            return HashMap::new();
        }
        // Originals stay behind so abort can put them back
        self.claimed
            .iter()
            .map(|(id, measures)| (*id, measures.clone()))
            .filter(|(_, measures)| !measures.is_empty())
            .collect()
    }

    fn mark_processed(&mut self, metric_id: &MetricId) {
        self.processed.insert(*metric_id);
    }

    async fn commit(mut self: Box<Self>) -> Result<(), IngestionError> {
        self.release(true);
        Ok(())
    }

    async fn abort(mut self: Box<Self>) -> Result<(), IngestionError> {
        self.release(false);
        Ok(())
    }
}

impl Drop for InMemoryClaim {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(metrics = self.claimed.len(), "Releasing measure claim on drop");
            self.release(false);
        }
    }
}

// =============================================================================
// In-Memory Series Store
// =============================================================================

/// In-memory series storage
///
/// Folding merges new measures by timestamp; a later value for an existing
/// timestamp replaces the stored one.
#[derive(Default)]
pub struct InMemorySeriesStore {
    series: RwLock<HashMap<MetricId, Vec<Measure>>>,
    failing_folds: Mutex<HashMap<MetricId, String>>,
    failing_deletes: Mutex<HashMap<MetricId, String>>,
    fold_delay: Mutex<Option<Duration>>,
    fold_calls: Mutex<Vec<MetricId>>,
    delete_calls: Mutex<HashMap<MetricId, usize>>,
}

impl InMemorySeriesStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored series for a metric, sorted by timestamp
    pub fn series(&self, metric_id: &MetricId) -> Option<Vec<Measure>> {
        self.series.read().get(metric_id).cloned()
    }

    /// Seed a stored series
    pub fn insert_series(&self, metric_id: MetricId, measures: Vec<Measure>) {
        self.series.write().insert(metric_id, measures);
    }

    /// Make `fold_and_persist` fail for a metric
    pub fn fail_fold_for(&self, metric_id: MetricId, reason: impl Into<String>) {
        self.failing_folds.lock().insert(metric_id, reason.into());
    }

    /// Make `delete_series` fail for a metric
    pub fn fail_delete_for(&self, metric_id: MetricId, reason: impl Into<String>) {
        self.failing_deletes.lock().insert(metric_id, reason.into());
    }

    /// Sleep this long inside every fold
    pub fn set_fold_delay(&self, delay: Duration) {
        *self.fold_delay.lock() = Some(delay);
    }

    /// Metrics passed to `fold_and_persist`, in call order
    pub fn fold_calls(&self) -> Vec<MetricId> {
        self.fold_calls.lock().clone()
    }

    /// Number of `delete_series` calls seen for a metric
    pub fn delete_calls(&self, metric_id: &MetricId) -> usize {
        self.delete_calls.lock().get(metric_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SeriesStore for InMemorySeriesStore {
    async fn fold_and_persist(
        &self,
        metric: &Metric,
        measures: &[Measure],
    ) -> Result<(), StorageError> {
        self.fold_calls.lock().push(metric.id);

        let delay = *self.fold_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(reason) = self.failing_folds.lock().get(&metric.id) {
            return Err(StorageError::FoldFailed {
                metric_id: metric.id,
                reason: reason.clone(),
            });
        }

        let mut series = self.series.write();
        let stored = series.entry(metric.id).or_default();
        for measure in measures {
            match stored.binary_search_by_key(&measure.timestamp, |m| m.timestamp) {
                Ok(pos) => stored[pos] = *measure,
                Err(pos) => stored.insert(pos, *measure),
            }
        }
        Ok(())
    }

    async fn delete_series(&self, metric: &Metric) -> Result<(), StorageError> {
        *self.delete_calls.lock().entry(metric.id).or_default() += 1;

        if let Some(reason) = self.failing_deletes.lock().get(&metric.id) {
            return Err(StorageError::DeleteFailed {
                metric_id: metric.id,
                reason: reason.clone(),
            });
        }

        self.series.write().remove(&metric.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_index_expunge_and_race() {
        let index = InMemoryMetricIndex::new();
        let a = Metric::active_new();
        let b = Metric::active_new();
        index.insert(a.clone());
        index.insert(b.clone());

        index.expunge_metric(&a.id).await.unwrap();
        assert!(matches!(
            index.expunge_metric(&a.id).await,
            Err(IndexError::NoSuchMetric(_))
        ));

        index.race_expunge(b.id);
        assert!(matches!(
            index.expunge_metric(&b.id).await,
            Err(IndexError::NoSuchMetric(_))
        ));
        assert!(index.is_empty());
        assert_eq!(index.expunge_calls(&b.id), 1);
    }

    #[tokio::test]
    async fn test_index_lists_in_insertion_order() {
        let index = InMemoryMetricIndex::new();
        let ids: Vec<_> = (0..5).map(|_| Metric::active_new()).collect();
        for m in &ids {
            index.insert(m.clone());
        }
        index.mark_pending_delete(&ids[2].id);

        let active = index.list_metrics(&MetricFilter::active()).await.unwrap();
        assert_eq!(active.len(), 4);
        assert_eq!(active[0].id, ids[0].id);
        assert_eq!(active[2].id, ids[3].id);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let ingestor = InMemoryIngestor::new(4);
        let id = MetricId::new();
        ingestor.add_measures(id, [Measure::new(1, 1.0)]);

        let claim = ingestor.claim_measures(&[id]).await.unwrap();
        assert!(ingestor.is_claimed(&id));
        assert!(matches!(
            ingestor.claim_measures(&[id]).await,
            Err(IngestionError::AlreadyClaimed(_))
        ));

        claim.commit().await.unwrap();
        assert!(!ingestor.is_claimed(&id));
        assert!(ingestor.pending_measures(&id).is_empty());
    }

    #[tokio::test]
    async fn test_abort_restores_unprocessed_in_order() {
        let ingestor = InMemoryIngestor::new(4);
        let done = MetricId::new();
        let left = MetricId::new();
        ingestor.add_measures(done, [Measure::new(1, 1.0)]);
        ingestor.add_measures(left, [Measure::new(1, 1.0), Measure::new(2, 2.0)]);

        let mut claim = ingestor.claim_measures(&[done, left]).await.unwrap();
        let batch = claim.take_measures();
        assert_eq!(batch.len(), 2);
        assert!(claim.take_measures().is_empty());
        claim.mark_processed(&done);

        // Arrives while the claim is outstanding
        ingestor.add_measures(left, [Measure::new(3, 3.0)]);

        claim.abort().await.unwrap();
        assert!(ingestor.pending_measures(&done).is_empty());
        let restored: Vec<i64> = ingestor
            .pending_measures(&left)
            .iter()
            .map(|m| m.timestamp)
            .collect();
        assert_eq!(restored, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_dropped_claim_behaves_like_abort() {
        let ingestor = InMemoryIngestor::new(4);
        let id = MetricId::new();
        ingestor.add_measures(id, [Measure::new(1, 1.0)]);

        {
            let mut claim = ingestor.claim_measures(&[id]).await.unwrap();
            let _ = claim.take_measures();
        }

        assert!(!ingestor.is_claimed(&id));
        assert_eq!(ingestor.pending_measures(&id).len(), 1);
    }

    #[tokio::test]
    async fn test_metrics_with_pending_by_sack() {
        let ingestor = InMemoryIngestor::new(2);
        let ids: Vec<_> = (0..20).map(|_| MetricId::new()).collect();
        for id in &ids {
            ingestor.add_measures(*id, [Measure::new(1, 1.0)]);
        }

        let sack0 = ingestor.metrics_with_pending(SackId(0)).await.unwrap();
        let sack1 = ingestor.metrics_with_pending(SackId(1)).await.unwrap();
        assert_eq!(sack0.len() + sack1.len(), 20);
        assert!(sack0.iter().all(|id| ingestor.sack_for(id) == SackId(0)));
    }

    #[tokio::test]
    async fn test_series_fold_merges_by_timestamp() {
        let store = InMemorySeriesStore::new();
        let metric = Metric::active_new();

        store
            .fold_and_persist(&metric, &[Measure::new(3, 3.0), Measure::new(1, 1.0)])
            .await
            .unwrap();
        store
            .fold_and_persist(&metric, &[Measure::new(2, 2.0), Measure::new(3, 30.0)])
            .await
            .unwrap();

        let series = store.series(&metric.id).unwrap();
        let timestamps: Vec<i64> = series.iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![1, 2, 3]);
        assert_eq!(series[2].value, 30.0);
    }

    #[tokio::test]
    async fn test_series_fault_injection() {
        let store = InMemorySeriesStore::new();
        let metric = Metric::active_new();
        store.fail_fold_for(metric.id, "boom");
        store.fail_delete_for(metric.id, "boom");

        assert!(store.fold_and_persist(&metric, &[]).await.is_err());
        assert!(store.delete_series(&metric).await.is_err());
        assert_eq!(store.delete_calls(&metric.id), 1);
        assert_eq!(store.fold_calls(), vec![metric.id]);
    }
}
