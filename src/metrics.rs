//! Prometheus metrics for chef operations
//!
//! Counters for expunge outcomes, deferred sacks, processed measures and
//! failures, plus lock wait latency.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec, Encoder,
    HistogramVec, TextEncoder,
};

lazy_static! {
    /// Metrics handled by expunge, by outcome
    pub static ref METRICS_EXPUNGED_TOTAL: CounterVec = register_counter_vec!(
        "kuba_chef_metrics_expunged_total",
        "Metrics handled by expunge, by outcome",
        &["outcome"]
    ).unwrap();

    /// Sacks skipped because their lock was contended
    pub static ref SACKS_DEFERRED_TOTAL: CounterVec = register_counter_vec!(
        "kuba_chef_sacks_deferred_total",
        "Sacks skipped because their lock was held elsewhere",
        &["operation"]
    ).unwrap();

    /// Measures folded into stored series
    pub static ref MEASURES_PROCESSED_TOTAL: Counter = register_counter!(
        "kuba_chef_measures_processed_total",
        "Measures folded into stored series"
    ).unwrap();

    /// Metrics whose pending measures were folded
    pub static ref METRICS_PROCESSED_TOTAL: Counter = register_counter!(
        "kuba_chef_metrics_processed_total",
        "Metrics whose pending measures were folded"
    ).unwrap();

    /// Refresh calls that gave up waiting for the sack lock
    pub static ref REFRESH_TIMEOUTS_TOTAL: Counter = register_counter!(
        "kuba_chef_refresh_timeouts_total",
        "Refresh calls that timed out on the sack lock"
    ).unwrap();

    /// Errors by type and operation
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "kuba_chef_errors_total",
        "Total errors by type and operation",
        &["error_type", "operation"]
    ).unwrap();

    /// Lock wait duration
    pub static ref LOCK_WAIT_DURATION: HistogramVec = register_histogram_vec!(
        "kuba_chef_lock_wait_seconds",
        "Time spent acquiring sack locks",
        &["mode"],
        vec![0.0001, 0.001, 0.01, 0.1, 1.0, 10.0]
    ).unwrap();
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record one expunged metric
#[inline]
pub fn record_expunge(outcome: &str) {
    METRICS_EXPUNGED_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a sack skipped on contention
#[inline]
pub fn record_sack_deferred(operation: &str) {
    SACKS_DEFERRED_TOTAL.with_label_values(&[operation]).inc();
}

/// Record a metric whose measures were folded
#[inline]
pub fn record_processed(measure_count: usize) {
    METRICS_PROCESSED_TOTAL.inc();
    MEASURES_PROCESSED_TOTAL.inc_by(measure_count as f64);
}

/// Record a refresh lock timeout
#[inline]
pub fn record_refresh_timeout() {
    REFRESH_TIMEOUTS_TOTAL.inc();
}

/// Record an error
#[inline]
pub fn record_error(error_type: &str, operation: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type, operation]).inc();
}

/// Record time spent acquiring a lock
#[inline]
pub fn record_lock_wait(mode: &str, duration_secs: f64) {
    LOCK_WAIT_DURATION
        .with_label_values(&[mode])
        .observe(duration_secs);
}
