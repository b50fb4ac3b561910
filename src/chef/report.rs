//! Typed outcomes of chef operations
//!
//! Best-effort calls return `Ok` even when some work failed; these reports
//! say exactly what happened to each sack and metric.

use crate::types::{MetricId, SackId};
use std::fmt;

/// What happened to one pending-delete metric
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricOutcome {
    /// Queued measures, series and index record are gone
    Deleted,
    /// Another process removed the index record first
    AlreadyGone,
    /// A deletion step failed; the metric stays pending-delete
    Failed(String),
}

impl MetricOutcome {
    /// Label used for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            MetricOutcome::Deleted => "deleted",
            MetricOutcome::AlreadyGone => "already_gone",
            MetricOutcome::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for MetricOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricOutcome::Failed(cause) => write!(f, "failed: {}", cause),
            other => f.write_str(other.label()),
        }
    }
}

/// What happened to one sack during expunge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SackOutcome {
    /// Lock was free; the sack's metrics were handled
    Probed,
    /// Lock was held elsewhere; the sack is left for a later call
    Deferred,
    /// The lock backend failed; the sack is left for a later call
    LockFailed(String),
}

/// Per-sack section of an [`ExpungeReport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SackReport {
    /// Sack the metrics belong to
    pub sack: SackId,
    /// Lock probe result
    pub outcome: SackOutcome,
    /// Metrics of a probed sack, in index order, with their outcome
    pub metrics: Vec<(MetricId, MetricOutcome)>,
    /// Metrics of a skipped sack, left untouched
    pub skipped: Vec<MetricId>,
}

impl SackReport {
    pub(crate) fn probed(sack: SackId) -> Self {
        Self {
            sack,
            outcome: SackOutcome::Probed,
            metrics: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub(crate) fn skipped(sack: SackId, outcome: SackOutcome, skipped: Vec<MetricId>) -> Self {
        Self {
            sack,
            outcome,
            metrics: Vec::new(),
            skipped,
        }
    }
}

/// Result of [`Chef::expunge_metrics`](crate::Chef::expunge_metrics)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpungeReport {
    /// One entry per sack that had pending-delete metrics, in sack order
    pub sacks: Vec<SackReport>,
}

impl ExpungeReport {
    fn metrics_with<'a>(
        &'a self,
        pred: impl Fn(&MetricOutcome) -> bool + 'a,
    ) -> impl Iterator<Item = MetricId> + 'a {
        self.sacks
            .iter()
            .flat_map(|s| s.metrics.iter())
            .filter(move |(_, outcome)| pred(outcome))
            .map(|(id, _)| *id)
    }

    /// Metrics fully removed by this call
    pub fn deleted(&self) -> Vec<MetricId> {
        self.metrics_with(|o| *o == MetricOutcome::Deleted).collect()
    }

    /// Metrics another process had already removed from the index
    pub fn already_gone(&self) -> Vec<MetricId> {
        self.metrics_with(|o| *o == MetricOutcome::AlreadyGone).collect()
    }

    /// Metrics whose deletion failed, with the cause
    pub fn failed(&self) -> Vec<(MetricId, String)> {
        self.sacks
            .iter()
            .flat_map(|s| s.metrics.iter())
            .filter_map(|(id, outcome)| match outcome {
                MetricOutcome::Failed(cause) => Some((*id, cause.clone())),
                _ => None,
            })
            .collect()
    }

    /// Sacks skipped because their lock was contended
    pub fn deferred_sacks(&self) -> Vec<SackId> {
        self.sacks
            .iter()
            .filter(|s| s.outcome == SackOutcome::Deferred)
            .map(|s| s.sack)
            .collect()
    }

    /// Outcome recorded for a metric, if its sack was probed
    pub fn outcome_for(&self, metric_id: &MetricId) -> Option<&MetricOutcome> {
        self.sacks
            .iter()
            .flat_map(|s| s.metrics.iter())
            .find(|(id, _)| id == metric_id)
            .map(|(_, outcome)| outcome)
    }

    /// Whether every pending-delete metric was handled without failure
    pub fn is_complete(&self) -> bool {
        self.sacks.iter().all(|s| {
            s.outcome == SackOutcome::Probed
                && s.metrics
                    .iter()
                    .all(|(_, o)| !matches!(o, MetricOutcome::Failed(_)))
        })
    }
}

/// Where a best-effort processing call stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessFailure {
    /// Metric whose fold failed; `None` when the claim itself failed
    pub metric_id: Option<MetricId>,
    /// Error message
    pub cause: String,
}

/// Result of a measure-processing call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Distinct metric ids asked for
    pub requested: usize,
    /// Ids still active in the index
    pub resolved: usize,
    /// Metrics whose measures were folded, in fold order
    pub processed: Vec<MetricId>,
    /// Total measures folded
    pub measures_folded: usize,
    /// Failure swallowed in best-effort mode
    pub failure: Option<ProcessFailure>,
    /// The sack lock was contended and nothing was attempted
    pub deferred: bool,
}

impl ProcessReport {
    pub(crate) fn new(requested: usize) -> Self {
        Self {
            requested,
            ..Default::default()
        }
    }

    pub(crate) fn deferred() -> Self {
        Self {
            deferred: true,
            ..Default::default()
        }
    }

    /// Whether the call finished without deferral or failure
    pub fn is_complete(&self) -> bool {
        !self.deferred && self.failure.is_none()
    }
}
