//! Metrics for the sync filter pipeline
//!
//! Records through the `metrics` facade; any installed recorder (Prometheus,
//! statsd, ...) picks them up.

use metrics::{counter, histogram};
use std::time::{Duration, Instant};

/// Metric names as constants for consistency
pub mod names {
    pub const ROWS_TOTAL: &str = "sync_filter_rows_total";
    pub const ROWS_SUPPRESSED: &str = "sync_filter_rows_suppressed_total";
    pub const ROWS_WRITTEN: &str = "sync_filter_rows_written_total";
    pub const BATCHES_TOTAL: &str = "sync_filter_batches_total";
    pub const BATCH_RETRIES: &str = "sync_filter_batch_retries_total";
    pub const BATCH_LATENCY: &str = "sync_filter_batch_latency_seconds";
    pub const FLUSHES_TOTAL: &str = "sync_filter_flushes_total";
    pub const FLUSH_BYTES: &str = "sync_filter_flush_bytes";
    pub const PUBLISH_FAILURES: &str = "sync_filter_publish_failures_total";
}

/// Labels for metrics
pub mod labels {
    pub const COMPONENT: &str = "component";
    pub const TABLE: &str = "table";
    pub const KIND: &str = "kind";
    pub const FILTER: &str = "filter";
    pub const STATUS: &str = "status";
}

/// Batch processing metrics
#[derive(Clone)]
pub struct PipelineMetrics {
    component: String,
}

impl PipelineMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Record a row offered to the chain
    pub fn record_row(&self, table: &str, kind: &str) {
        counter!(
            names::ROWS_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::TABLE => table.to_string(),
            labels::KIND => kind.to_string(),
        )
        .increment(1);
    }

    /// Record a row the chain told the writer to skip
    pub fn record_suppressed(&self, table: &str) {
        counter!(
            names::ROWS_SUPPRESSED,
            labels::COMPONENT => self.component.clone(),
            labels::TABLE => table.to_string(),
        )
        .increment(1);
    }

    /// Record rows handed to the target writer
    pub fn record_written(&self, count: u64) {
        counter!(
            names::ROWS_WRITTEN,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(count);
    }

    /// Record a finished batch
    pub fn record_batch(&self, status: &str) {
        counter!(
            names::BATCHES_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::STATUS => status.to_string(),
        )
        .increment(1);
    }

    /// Record a whole-batch retry
    pub fn record_retry(&self) {
        counter!(
            names::BATCH_RETRIES,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
    }

    /// Record batch latency
    pub fn record_batch_latency(&self, duration: Duration) {
        histogram!(
            names::BATCH_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }
}

/// Accumulating filter metrics
#[derive(Clone)]
pub struct FlushMetrics {
    filter: String,
}

impl FlushMetrics {
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
        }
    }

    /// Record a published artifact
    pub fn record_flush(&self, bytes: usize) {
        counter!(
            names::FLUSHES_TOTAL,
            labels::FILTER => self.filter.clone(),
        )
        .increment(1);
        histogram!(
            names::FLUSH_BYTES,
            labels::FILTER => self.filter.clone(),
        )
        .record(bytes as f64);
    }

    /// Record a failed publish
    pub fn record_publish_failure(&self) {
        counter!(
            names::PUBLISH_FAILURES,
            labels::FILTER => self.filter.clone(),
        )
        .increment(1);
    }
}

/// Timer guard for automatic latency recording
pub struct LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    /// Start a new timer
    pub fn start(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Get elapsed time without stopping
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop timer and record
    pub fn stop(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if let Some(f) = self.on_drop.take() {
            f(elapsed);
        }
        elapsed
    }
}

impl<F> Drop for LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}
