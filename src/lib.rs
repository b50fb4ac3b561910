//! Kuba Chef - sack-locked measure processing and metric expunge
//!
//! Coordinates bulk work over a large population of metric timeseries across
//! a cluster of stateless workers:
//! - Metrics are spread over a fixed number of sacks; a sack is the unit of
//!   distributed locking
//! - New measures are folded into stored series in claim/commit batches
//! - Metrics marked for deletion are purged from the queue, the series store
//!   and the index
//! - A single metric can be refreshed synchronously with a bounded lock wait
//!
//! The index, measure queue and series store are external collaborators
//! behind the traits in [`engine::traits`]. Sack locks come from a
//! [`LockProvider`](engine::traits::LockProvider): in-process
//! ([`coordination`]) or Redis ([`redis`]).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chef;
pub mod engine;
pub mod error;
pub mod sack;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Logging setup
pub mod observability;

/// In-process lock backend
pub mod coordination;

/// Redis lock backend
pub mod redis;

// Re-export main types
pub use chef::{Chef, ExpungeReport, MetricOutcome, ProcessReport, SackOutcome};
pub use engine::ChefBuilder;
pub use error::{Error, Result};
pub use types::{Measure, Metric, MetricId, MetricStatus, SackId};
