//! Core data types shared by the chef and its collaborators
//!
//! # Key Types
//!
//! - **`MetricId`**: Unique identifier for a metric (UUID)
//! - **`Metric`**: Index record for a metric with its lifecycle status
//! - **`Measure`**: A single pending timestamped value
//! - **`SackId`**: Partition bucket a metric is assigned to
//! - **`MetricFilter`**: Restriction used when listing metrics from the index
//!
//! # Example
//!
//! ```rust
//! use kuba_chef::types::{Metric, MetricFilter, MetricStatus};
//!
//! let metric = Metric::active_new();
//! assert!(MetricFilter::active().matches(&metric));
//!
//! let doomed = metric.clone().with_status(MetricStatus::PendingDelete);
//! assert!(MetricFilter::pending_delete().matches(&doomed));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricId(pub Uuid);

impl MetricId {
    /// Create a new random metric ID (UUID v4)
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The identifier as a 128-bit integer
    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }
}

impl Default for MetricId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MetricId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for MetricId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Partition bucket used as the distributed lock granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SackId(pub u32);

impl fmt::Display for SackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a metric in the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    /// Metric accepts and processes new measures
    Active,
    /// Metric is marked for deletion and waits to be expunged
    PendingDelete,
}

impl fmt::Display for MetricStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricStatus::Active => write!(f, "active"),
            MetricStatus::PendingDelete => write!(f, "pending_delete"),
        }
    }
}

/// Metric record as returned by the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Unique identifier
    pub id: MetricId,
    /// Lifecycle status
    pub status: MetricStatus,
    /// Optional metric name (e.g., "cpu.usage")
    pub name: Option<String>,
    /// Archive policy the series is stored with
    pub archive_policy: Option<String>,
}

impl Metric {
    /// Create an active metric record for an existing ID
    pub fn new(id: MetricId) -> Self {
        Self {
            id,
            status: MetricStatus::Active,
            name: None,
            archive_policy: None,
        }
    }

    /// Create an active metric record with a fresh ID
    pub fn active_new() -> Self {
        Self::new(MetricId::new())
    }

    /// Set the lifecycle status
    pub fn with_status(mut self, status: MetricStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the metric name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the archive policy name
    pub fn with_archive_policy(mut self, policy: impl Into<String>) -> Self {
        self.archive_policy = Some(policy.into());
        self
    }

    /// Whether the metric is marked for deletion
    pub fn is_pending_delete(&self) -> bool {
        self.status == MetricStatus::PendingDelete
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", self.id, name),
            None => write!(f, "{}", self.id),
        }
    }
}

/// A timestamped value pending incorporation into a metric's series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    /// Unix timestamp in nanoseconds
    pub timestamp: i64,
    /// Measured value
    pub value: f64,
}

impl Measure {
    /// Create a new measure
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Restriction applied when listing metrics from the index
///
/// Every set field must match; an empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricFilter {
    /// Only metrics in this lifecycle status
    pub status: Option<MetricStatus>,
    /// Only metrics with one of these IDs
    pub ids: Option<HashSet<MetricId>>,
}

impl MetricFilter {
    /// Match every metric
    pub fn all() -> Self {
        Self::default()
    }

    /// Match active metrics
    pub fn active() -> Self {
        Self {
            status: Some(MetricStatus::Active),
            ids: None,
        }
    }

    /// Match metrics marked for deletion
    pub fn pending_delete() -> Self {
        Self {
            status: Some(MetricStatus::PendingDelete),
            ids: None,
        }
    }

    /// Restrict to the given IDs
    pub fn with_ids(mut self, ids: impl IntoIterator<Item = MetricId>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    /// Check whether a metric satisfies the filter
    pub fn matches(&self, metric: &Metric) -> bool {
        if let Some(status) = self.status {
            if metric.status != status {
                return false;
            }
        }
        match &self.ids {
            Some(ids) => ids.contains(&metric.id),
            None => true,
        }
    }
}
