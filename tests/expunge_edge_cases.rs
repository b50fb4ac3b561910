//! Edge Case Tests for Metric Expunge
//!
//! Contended sacks, races with other expungers, failing deletion steps and
//! lock backend failures, in both best-effort and synchronous mode.

use async_trait::async_trait;
use kuba_chef::coordination::MemoryLockProvider;
use kuba_chef::engine::stubs::{InMemoryIngestor, InMemoryMetricIndex, InMemorySeriesStore};
use kuba_chef::engine::traits::{AcquireMode, LockProvider, SackLock};
use kuba_chef::error::{IngestionError, LockError, StorageError};
use kuba_chef::{Chef, Error, Metric, MetricId, MetricOutcome, MetricStatus, SackId, SackOutcome};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const NUM_SACKS: u32 = 4;

// =============================================================================
// Helper Functions
// =============================================================================

struct Fixture {
    index: Arc<InMemoryMetricIndex>,
    ingestor: Arc<InMemoryIngestor>,
    storage: Arc<InMemorySeriesStore>,
    locks: MemoryLockProvider,
    chef: Chef,
}

fn fixture() -> Fixture {
    let index = Arc::new(InMemoryMetricIndex::new());
    let ingestor = Arc::new(InMemoryIngestor::new(NUM_SACKS));
    let storage = Arc::new(InMemorySeriesStore::new());
    let locks = MemoryLockProvider::new();
    let chef = Chef::new(
        index.clone(),
        ingestor.clone(),
        storage.clone(),
        Arc::new(locks.clone()),
    );
    Fixture {
        index,
        ingestor,
        storage,
        locks,
        chef,
    }
}

fn doomed_in_sack(sack: u32, salt: u128) -> Metric {
    let id = Uuid::from_u128(salt * NUM_SACKS as u128 + sack as u128);
    Metric::new(MetricId::from(id)).with_status(MetricStatus::PendingDelete)
}

/// Hold a sack's lock the way another worker would
async fn hold_sack(f: &Fixture, sack: SackId) -> Box<dyn SackLock> {
    let lock = f.locks.lock_for(&f.chef.lock_name(sack));
    assert!(lock.acquire(AcquireMode::NonBlocking).await.unwrap());
    lock
}

/// Lock provider whose backend is unreachable
struct UnreachableLocks;

struct UnreachableLock(String);

impl LockProvider for UnreachableLocks {
    fn lock_for(&self, name: &str) -> Box<dyn SackLock> {
        Box::new(UnreachableLock(name.to_string()))
    }
}

#[async_trait]
impl SackLock for UnreachableLock {
    fn name(&self) -> &str {
        &self.0
    }

    async fn acquire(&self, _mode: AcquireMode) -> Result<bool, LockError> {
        Err(LockError::ConnectionError("lock service unreachable".to_string()))
    }

    async fn release(&self) -> Result<(), LockError> {
        Err(LockError::NotHeld(self.0.clone()))
    }
}

// =============================================================================
// Edge Cases: Contention
// =============================================================================

#[tokio::test]
async fn test_async_expunge_skips_locked_sack() {
    let f = fixture();
    let locked = [doomed_in_sack(1, 1), doomed_in_sack(1, 2)];
    let free = doomed_in_sack(2, 3);
    for m in locked.iter().chain([&free]) {
        f.index.insert(m.clone());
    }

    let _held = hold_sack(&f, SackId(1)).await;
    let report = f.chef.expunge_metrics(false).await.unwrap();

    assert_eq!(report.deferred_sacks(), vec![SackId(1)]);
    assert_eq!(report.deleted(), vec![free.id]);
    for m in &locked {
        assert!(f.index.get(&m.id).is_some());
        assert_eq!(f.ingestor.delete_calls(&m.id), 0);
        assert_eq!(f.storage.delete_calls(&m.id), 0);
        assert_eq!(f.index.expunge_calls(&m.id), 0);
    }
}

#[tokio::test]
async fn test_deferred_sack_picked_up_by_later_call() {
    let f = fixture();
    let metric = doomed_in_sack(3, 1);
    f.index.insert(metric.clone());

    let held = hold_sack(&f, SackId(3)).await;
    let report = f.chef.expunge_metrics(false).await.unwrap();
    assert_eq!(report.sacks[0].outcome, SackOutcome::Deferred);
    assert_eq!(report.sacks[0].skipped, vec![metric.id]);

    held.release().await.unwrap();
    let report = f.chef.expunge_metrics(false).await.unwrap();
    assert_eq!(report.deleted(), vec![metric.id]);
}

#[tokio::test]
async fn test_sync_expunge_waits_for_lock() {
    let f = fixture();
    let metric = doomed_in_sack(0, 1);
    f.index.insert(metric.clone());

    let held = hold_sack(&f, SackId(0)).await;
    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        held.release().await.unwrap();
    });

    let report = f.chef.expunge_metrics(true).await.unwrap();
    assert_eq!(report.deleted(), vec![metric.id]);
    releaser.await.unwrap();
}

#[tokio::test]
async fn test_lock_probe_does_not_hold_lock() {
    let f = fixture();
    for salt in 0..10 {
        f.index.insert(doomed_in_sack((salt % 4) as u32, salt));
    }

    f.chef.expunge_metrics(false).await.unwrap();
    assert_eq!(f.locks.held_count(), 0);
}

// =============================================================================
// Edge Cases: Races
// =============================================================================

#[tokio::test]
async fn test_metric_already_gone_is_not_an_error() {
    let f = fixture();
    let metric = doomed_in_sack(2, 1);
    f.index.insert(metric.clone());
    f.index.race_expunge(metric.id);

    let report = f.chef.expunge_metrics(true).await.unwrap();
    assert_eq!(report.outcome_for(&metric.id), Some(&MetricOutcome::AlreadyGone));
    assert!(report.is_complete());

    // Each step ran exactly once
    assert_eq!(f.ingestor.delete_calls(&metric.id), 1);
    assert_eq!(f.storage.delete_calls(&metric.id), 1);
    assert_eq!(f.index.expunge_calls(&metric.id), 1);

    // Gone from the index, so a second pass does not touch it again
    let report = f.chef.expunge_metrics(true).await.unwrap();
    assert!(report.sacks.is_empty());
    assert_eq!(f.storage.delete_calls(&metric.id), 1);
}

#[tokio::test]
async fn test_no_pending_delete_metrics() {
    let f = fixture();
    f.index.insert(Metric::active_new());

    let report = f.chef.expunge_metrics(false).await.unwrap();
    assert!(report.sacks.is_empty());
    assert!(report.is_complete());
}

// =============================================================================
// Edge Cases: Failures
// =============================================================================

#[tokio::test]
async fn test_sync_failure_returns_original_error() {
    let f = fixture();
    let metric = doomed_in_sack(1, 1);
    f.index.insert(metric.clone());
    f.storage.fail_delete_for(metric.id, "bucket is read-only");

    let err = f.chef.expunge_metrics(true).await.unwrap_err();
    match &err {
        Error::Storage(StorageError::DeleteFailed { metric_id, reason }) => {
            assert_eq!(*metric_id, metric.id);
            assert_eq!(reason, "bucket is read-only");
        },
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().contains("bucket is read-only"));
}

#[tokio::test]
async fn test_sync_failure_abandons_rest_of_call() {
    // Known asymmetry: a contended sack is skipped and the call goes on, but
    // in sync mode a failing metric ends the whole call.
    let f = fixture();
    let failing = doomed_in_sack(0, 1);
    let same_sack_after = doomed_in_sack(0, 2);
    let later_sack = doomed_in_sack(3, 3);
    for m in [&failing, &same_sack_after, &later_sack] {
        f.index.insert(m.clone());
    }
    f.ingestor.fail_delete_for(failing.id, "queue offline");

    let err = f.chef.expunge_metrics(true).await.unwrap_err();
    assert!(matches!(err, Error::Ingestion(IngestionError::DeleteError(_))));

    for m in [&same_sack_after, &later_sack] {
        assert_eq!(f.ingestor.delete_calls(&m.id), 0);
        assert_eq!(f.storage.delete_calls(&m.id), 0);
        assert!(f.index.get(&m.id).is_some());
    }
}

#[tokio::test]
async fn test_async_failure_is_per_metric() {
    let f = fixture();
    let failing = doomed_in_sack(0, 1);
    let same_sack_after = doomed_in_sack(0, 2);
    let later_sack = doomed_in_sack(3, 3);
    for m in [&failing, &same_sack_after, &later_sack] {
        f.index.insert(m.clone());
    }
    f.ingestor.fail_delete_for(failing.id, "queue offline");

    let report = f.chef.expunge_metrics(false).await.unwrap();
    assert_eq!(report.deleted(), vec![same_sack_after.id, later_sack.id]);
    assert_eq!(report.failed().len(), 1);
    assert_eq!(f.storage.delete_calls(&failing.id), 0);
    assert!(f.index.get(&failing.id).unwrap().is_pending_delete());
}

#[tokio::test]
async fn test_lock_backend_failure() {
    let index = Arc::new(InMemoryMetricIndex::new());
    let ingestor = Arc::new(InMemoryIngestor::new(NUM_SACKS));
    let storage = Arc::new(InMemorySeriesStore::new());
    let chef = Chef::new(
        index.clone(),
        ingestor.clone(),
        storage.clone(),
        Arc::new(UnreachableLocks),
    );
    let metric = doomed_in_sack(2, 1);
    index.insert(metric.clone());

    let report = chef.expunge_metrics(false).await.unwrap();
    assert!(matches!(
        &report.sacks[0].outcome,
        SackOutcome::LockFailed(cause) if cause.contains("unreachable")
    ));
    assert!(index.get(&metric.id).is_some());

    assert!(matches!(
        chef.expunge_metrics(true).await,
        Err(Error::Lock(LockError::ConnectionError(_)))
    ));
    assert_eq!(storage.delete_calls(&metric.id), 0);
}
