//! Error types for the chef and its collaborators

use crate::types::{MetricId, SackId};
use thiserror::Error;

/// Main error type for chef operations
#[derive(Error, Debug)]
pub enum Error {
    /// The sack lock for a refreshed metric could not be taken in time
    #[error("Unable to refresh metric {metric_id}: sack {sack} is locked, please try again")]
    LockTimeout {
        /// Metric that was being refreshed
        metric_id: MetricId,
        /// Sack whose lock was contended
        sack: SackId,
    },

    /// Lock backend error
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Metric index error
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    /// Measure ingestion error
    #[error("Ingestion error: {0}")]
    Ingestion(#[from] IngestionError),

    /// Series storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short label used for the `error_type` metric dimension
    pub fn kind(&self) -> &'static str {
        match self {
            Error::LockTimeout { .. } => "lock_timeout",
            Error::Lock(_) => "lock",
            Error::Index(_) => "index",
            Error::Ingestion(_) => "ingestion",
            Error::Storage(_) => "storage",
            Error::Configuration(_) => "configuration",
            Error::Io(_) => "io",
        }
    }
}

/// Metric index errors
#[derive(Error, Debug)]
pub enum IndexError {
    /// The metric record is not (or no longer) in the index
    #[error("No such metric: {0}")]
    NoSuchMetric(MetricId),

    /// Connection to the index backend failed
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// Measure ingestion errors
#[derive(Error, Debug)]
pub enum IngestionError {
    /// Another processing attempt already holds a claim on this metric
    #[error("Measures for metric {0} are already claimed")]
    AlreadyClaimed(MetricId),

    /// Deleting queued measures failed
    #[error("Delete error: {0}")]
    DeleteError(String),
}

/// Series storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Folding new measures into the series failed
    #[error("Fold failed for metric {metric_id}: {reason}")]
    FoldFailed {
        /// Metric whose series could not be updated
        metric_id: MetricId,
        /// Backend supplied reason
        reason: String,
    },

    /// Deleting the series failed
    #[error("Delete failed for metric {metric_id}: {reason}")]
    DeleteFailed {
        /// Metric whose series could not be deleted
        metric_id: MetricId,
        /// Backend supplied reason
        reason: String,
    },
}

/// Distributed lock errors
#[derive(Error, Debug)]
pub enum LockError {
    /// Connection to the lock backend failed
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Release was called on a lock this handle does not hold
    #[error("Lock {0} is not held by this handle")]
    NotHeld(String),

    /// Backend rejected or failed the command
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Value is out of allowed range
    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Field name being validated
        field: String,
        /// The invalid value
        value: String,
        /// Minimum allowed value
        min: String,
        /// Maximum allowed value
        max: String,
    },

    /// Required field is missing
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Values that must agree do not
    #[error("{field} is {value} but {other} is {other_value}")]
    Mismatch {
        /// Configured field
        field: String,
        /// Its configured value
        value: String,
        /// What it must agree with
        other: String,
        /// The value found there
        other_value: String,
    },
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Configuration(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_names_metric() {
        let metric_id = MetricId::new();
        let err = Error::LockTimeout {
            metric_id,
            sack: SackId(7),
        };
        let msg = err.to_string();
        assert!(msg.contains(&metric_id.to_string()));
        assert!(msg.contains("sack 7"));
        assert_eq!(err.kind(), "lock_timeout");
    }

    #[test]
    fn test_storage_error_keeps_source_message() {
        let metric_id = MetricId::new();
        let err: Error = StorageError::DeleteFailed {
            metric_id,
            reason: "disk on fire".to_string(),
        }
        .into();
        assert!(matches!(err, Error::Storage(StorageError::DeleteFailed { .. })));
        assert!(err.to_string().contains("disk on fire"));
    }

    #[test]
    fn test_validation_error_converts_to_configuration() {
        let err: Error = ValidationError::MissingField("sacks.num_sacks".to_string()).into();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_mismatch_names_both_sides() {
        let err: Error = ValidationError::Mismatch {
            field: "sacks.num_sacks".to_string(),
            value: "1".to_string(),
            other: "the ingestor's sack count".to_string(),
            other_value: "64".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Configuration error: sacks.num_sacks is 1 but the ingestor's sack count is 64"
        );
        assert_eq!(err.kind(), "configuration");
    }
}
