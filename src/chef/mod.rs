//! The chef: sack-locked measure processing and metric expunge
//!
//! A [`Chef`] is stateless apart from its collaborators; any number of
//! workers, in one process or many, can run chefs against the same index,
//! queue and storage. They coordinate only through the sack locks.
//!
//! # Operations
//!
//! - [`Chef::expunge_metrics`]: purge metrics marked for deletion
//! - [`Chef::process_new_measures`]: fold pending measures of given metrics
//! - [`Chef::refresh_metric`]: fold one metric's measures under its sack lock
//! - [`Chef::process_sack`]: fold everything pending in one sack under its lock
//!
//! # Example
//!
//! ```rust
//! use kuba_chef::ChefBuilder;
//! use kuba_chef::engine::stubs::{InMemoryIngestor, InMemoryMetricIndex, InMemorySeriesStore};
//! use kuba_chef::types::{Measure, Metric};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> kuba_chef::Result<()> {
//! let index = Arc::new(InMemoryMetricIndex::new());
//! let ingestor = Arc::new(InMemoryIngestor::new(128));
//! let chef = ChefBuilder::new()
//!     .with_index(index.clone())
//!     .with_ingestor(ingestor.clone())
//!     .with_storage(Arc::new(InMemorySeriesStore::new()))
//!     .build()
//!     .await?;
//!
//! let metric = Metric::active_new();
//! index.insert(metric.clone());
//! ingestor.add_measures(metric.id, [Measure::new(1, 0.5)]);
//!
//! let report = chef.refresh_metric(&metric, std::time::Duration::from_secs(1)).await?;
//! assert_eq!(report.processed, vec![metric.id]);
//! # Ok(())
//! # }
//! ```

pub mod expunger;
pub mod processor;
pub mod report;

pub use expunger::MetricExpunger;
pub use processor::MeasureProcessor;
pub use report::{
    ExpungeReport, MetricOutcome, ProcessFailure, ProcessReport, SackOutcome, SackReport,
};

use crate::config::RefreshConfig;
use crate::engine::traits::{
    AcquireMode, LockProvider, MeasureIngestor, MetricIndex, SackLock, SeriesStore,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::sack::{SackLocks, DEFAULT_LOCK_PREFIX};
use crate::types::{Metric, MetricId, SackId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, warn, Instrument, Span};

/// Orchestrates processing and expunge over the sack locks
pub struct Chef {
    ingestor: Arc<dyn MeasureIngestor>,
    locks: SackLocks,
    processor: MeasureProcessor,
    expunger: MetricExpunger,
    refresh_timeout: Duration,
    span: Span,
}

impl Chef {
    /// Create a chef with the default lock prefix and refresh timeout
    pub fn new(
        index: Arc<dyn MetricIndex>,
        ingestor: Arc<dyn MeasureIngestor>,
        storage: Arc<dyn SeriesStore>,
        lock_provider: Arc<dyn LockProvider>,
    ) -> Self {
        let locks = SackLocks::new(lock_provider, DEFAULT_LOCK_PREFIX);
        Self {
            processor: MeasureProcessor::new(
                Arc::clone(&index),
                Arc::clone(&ingestor),
                Arc::clone(&storage),
            ),
            expunger: MetricExpunger::new(index, Arc::clone(&ingestor), storage, locks.clone()),
            ingestor,
            locks,
            refresh_timeout: RefreshConfig::default().default_timeout(),
            span: info_span!("chef"),
        }
    }

    /// Use a different lock-name prefix
    ///
    /// Chefs only exclude each other when they share a prefix.
    pub fn with_lock_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.locks = self.locks.with_prefix(prefix);
        self.expunger.set_locks(self.locks.clone());
        self
    }

    /// Timeout used by [`refresh_metric_default`](Self::refresh_metric_default)
    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Log every operation under this span
    ///
    /// Lets callers route or capture a chef's logs without touching the
    /// global subscriber.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Timeout used by [`refresh_metric_default`](Self::refresh_metric_default)
    pub fn refresh_timeout(&self) -> Duration {
        self.refresh_timeout
    }

    /// Span the chef logs under
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Lock name used for a sack
    pub fn lock_name(&self, sack: SackId) -> String {
        self.locks.name_for(sack)
    }

    /// Sack a metric belongs to
    pub fn sack_for(&self, metric_id: &MetricId) -> SackId {
        self.ingestor.sack_for(metric_id)
    }

    /// Purge every pending-delete metric whose sack is free
    ///
    /// With `sync = false` the call never waits on a lock and returns `Ok`
    /// whatever happens to individual metrics; see the report for details.
    ///
    /// With `sync = true` each sack lock is waited for, and the first
    /// deletion failure is returned. That failure abandons every remaining
    /// metric and sack of the call, even though contended sacks are skipped
    /// rather than abandoned in the non-sync mode.
    pub async fn expunge_metrics(&self, sync: bool) -> Result<ExpungeReport> {
        self.expunger
            .expunge(sync)
            .instrument(info_span!(parent: &self.span, "expunge_metrics", sync))
            .await
    }

    /// Fold pending measures of the given metrics into storage
    ///
    /// Ids that are unknown or pending delete are ignored. With `sync = true`
    /// the first failure is returned; metrics folded before it stay folded.
    /// With `sync = false` the failure is logged and reported instead.
    pub async fn process_new_measures(
        &self,
        metric_ids: &[MetricId],
        sync: bool,
    ) -> Result<ProcessReport> {
        self.processor
            .process(metric_ids, sync)
            .instrument(info_span!(
                parent: &self.span,
                "process_new_measures",
                metrics = metric_ids.len(),
                sync
            ))
            .await
    }

    /// Fold one metric's pending measures while holding its sack lock
    ///
    /// Waits at most `timeout` for the lock; a zero timeout makes a single
    /// attempt. Fails with [`Error::LockTimeout`] if the lock stays busy.
    /// Processing errors are returned as-is, and the lock is released on
    /// every path.
    pub async fn refresh_metric(
        &self,
        metric: &Metric,
        timeout: Duration,
    ) -> Result<ProcessReport> {
        let sack = self.ingestor.sack_for(&metric.id);
        let span = info_span!(
            parent: &self.span,
            "refresh_metric",
            metric_id = %metric.id,
            sack = %sack
        );

        async move {
            let lock = self.locks.lock_for(sack);
            if !self
                .locks
                .acquire(lock.as_ref(), AcquireMode::Timeout(timeout))
                .await?
            {
                metrics::record_refresh_timeout();
                debug!(timeout = ?timeout, "Sack lock busy, giving up refresh");
                return Err(Error::LockTimeout {
                    metric_id: metric.id,
                    sack,
                });
            }

            with_lock_held(lock.as_ref(), self.processor.process(&[metric.id], true)).await
        }
        .instrument(span)
        .await
    }

    /// [`refresh_metric`](Self::refresh_metric) with the configured timeout
    pub async fn refresh_metric_default(&self, metric: &Metric) -> Result<ProcessReport> {
        self.refresh_metric(metric, self.refresh_timeout).await
    }

    /// Fold every metric with pending measures in a sack, under its lock
    ///
    /// With `sync = false` a busy sack is reported as deferred instead of
    /// waited for. Failures follow [`process_new_measures`](Self::process_new_measures).
    pub async fn process_sack(&self, sack: SackId, sync: bool) -> Result<ProcessReport> {
        let span = info_span!(parent: &self.span, "process_sack", sack = %sack, sync);

        async move {
            let lock = self.locks.lock_for(sack);
            if !self
                .locks
                .acquire(lock.as_ref(), AcquireMode::for_sync(sync))
                .await?
            {
                debug!("Sack is locked by another process, deferring processing");
                metrics::record_sack_deferred("process");
                return Ok(ProcessReport::deferred());
            }

            with_lock_held(lock.as_ref(), async {
                let pending = self.ingestor.metrics_with_pending(sack).await?;
                debug!(metrics = pending.len(), "Processing sack");
                self.processor.process(&pending, sync).await
            })
            .await
        }
        .instrument(span)
        .await
    }
}

/// Run `work` and release `lock` afterwards, whatever `work` returned
///
/// An error from `work` wins over an error from the release.
async fn with_lock_held<T, F>(lock: &dyn SackLock, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let result = work.await;
    let released = lock.release().await;

    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_err)) => {
            warn!(lock = lock.name(), error = %release_err, "Failed to release sack lock");
            Err(e)
        },
    }
}
