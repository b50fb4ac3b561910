//! Folding pending measures into stored series
//!
//! One call is one batch: the requested ids are re-resolved against the
//! index, their pending measures are claimed, and each metric's measures are
//! folded in index order. The first fold failure stops the batch. Metrics
//! folded before it stay folded; the rest go back to pending when the claim
//! is aborted.

use super::report::{ProcessFailure, ProcessReport};
use crate::engine::traits::{MeasureIngestor, MetricIndex, SeriesStore};
use crate::error::{Error, Result};
use crate::metrics;
use crate::types::{Metric, MetricFilter, MetricId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Runs measure-processing batches
pub struct MeasureProcessor {
    index: Arc<dyn MetricIndex>,
    ingestor: Arc<dyn MeasureIngestor>,
    storage: Arc<dyn SeriesStore>,
}

impl MeasureProcessor {
    /// Create a processor over the given collaborators
    pub fn new(
        index: Arc<dyn MetricIndex>,
        ingestor: Arc<dyn MeasureIngestor>,
        storage: Arc<dyn SeriesStore>,
    ) -> Self {
        Self {
            index,
            ingestor,
            storage,
        }
    }

    /// Process pending measures for the given metrics
    ///
    /// Ids that are unknown or pending delete are dropped silently. With
    /// `sync` a claim or fold failure is returned as-is; without it the
    /// failure is logged and recorded in the report. Index lookup failures
    /// are returned in both modes.
    pub async fn process(&self, metric_ids: &[MetricId], sync: bool) -> Result<ProcessReport> {
        let ids: HashSet<MetricId> = metric_ids.iter().copied().collect();
        let mut report = ProcessReport::new(ids.len());
        if ids.is_empty() {
            return Ok(report);
        }

        let resolved = self
            .index
            .list_metrics(&MetricFilter::active().with_ids(ids))
            .await?;
        report.resolved = resolved.len();
        if resolved.is_empty() {
            debug!(requested = report.requested, "No active metrics to process");
            return Ok(report);
        }

        if let Err((metric_id, e)) = self.fold_batch(&resolved, &mut report).await {
            metrics::record_error(e.kind(), "process_new_measures");
            if sync {
                return Err(e);
            }

            match metric_id {
                Some(metric_id) => error!(
                    metric_id = %metric_id,
                    processed = report.processed.len(),
                    resolved = report.resolved,
                    error = %e,
                    "Error processing new measures"
                ),
                None => error!(
                    resolved = report.resolved,
                    error = %e,
                    "Error claiming new measures"
                ),
            }
            report.failure = Some(ProcessFailure {
                metric_id,
                cause: e.to_string(),
            });
        }

        Ok(report)
    }

    /// Claim, fold and settle one batch
    ///
    /// The claim is settled on every path: committed after the last fold,
    /// aborted after a failed one, and dropped (which aborts) if the future
    /// is cancelled mid-batch.
    async fn fold_batch(
        &self,
        batch: &[Metric],
        report: &mut ProcessReport,
    ) -> std::result::Result<(), (Option<MetricId>, Error)> {
        let ids: Vec<MetricId> = batch.iter().map(|m| m.id).collect();
        let mut claim = self
            .ingestor
            .claim_measures(&ids)
            .await
            .map_err(|e| (None, Error::from(e)))?;
        let mut pending = claim.take_measures();

        for metric in batch {
            let Some(measures) = pending.remove(&metric.id).filter(|m| !m.is_empty()) else {
                continue;
            };

            if let Err(e) = self.storage.fold_and_persist(metric, &measures).await {
                if let Err(abort_err) = claim.abort().await {
                    warn!(error = %abort_err, "Failed to abort measure claim");
                }
                return Err((Some(metric.id), e.into()));
            }

            claim.mark_processed(&metric.id);
            metrics::record_processed(measures.len());
            report.processed.push(metric.id);
            report.measures_folded += measures.len();
            debug!(metric_id = %metric.id, measures = measures.len(), "Folded new measures");
        }

        claim.commit().await.map_err(|e| (None, Error::from(e)))
    }
}
