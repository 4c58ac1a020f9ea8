//! Storage metrics recorded through the `metrics` crate facade.
//!
//! Nothing is exported unless the embedding application installs a recorder;
//! without one every call is a no-op.
//!
//! All metrics follow the pattern `rillet_core_{name}_{unit}`.

use std::time::{Duration, Instant};

pub use metrics::{counter, gauge, histogram};

/// Partition log and cursor metrics
pub struct CoreMetrics;

impl CoreMetrics {
    // ---- Counters ----

    /// Total messages appended to partitions
    pub fn add_messages_appended(count: u64) {
        metrics::counter!("rillet_core_messages_appended_total").increment(count);
    }

    /// Total messages returned by reads
    pub fn add_messages_read(count: u64) {
        metrics::counter!("rillet_core_messages_read_total").increment(count);
    }

    /// Segments created by rollover
    pub fn increment_segments_rolled() {
        metrics::counter!("rillet_core_segments_rolled_total").increment(1);
    }

    /// Segments removed by trimming or archival
    pub fn add_segments_evicted(count: u64) {
        metrics::counter!("rillet_core_segments_evicted_total").increment(count);
    }

    /// Reads that found no data and waited for a write
    pub fn increment_reads_parked() {
        metrics::counter!("rillet_core_reads_parked_total").increment(1);
    }

    pub fn increment_reads_timed_out() {
        metrics::counter!("rillet_core_reads_timed_out_total").increment(1);
    }

    pub fn increment_cursor_commits() {
        metrics::counter!("rillet_core_cursor_commits_total").increment(1);
    }

    // ---- Gauges ----

    /// Reads currently waiting on a partition
    pub fn set_pending_reads(count: u64) {
        metrics::gauge!("rillet_core_pending_reads").set(count as f64);
    }

    // ---- Histograms ----

    /// Record append latency in microseconds
    pub fn record_append_latency_us(us: u64) {
        metrics::histogram!("rillet_core_append_latency_seconds").record(us as f64 / 1_000_000.0);
    }

    /// Record non-blocking read latency in microseconds
    pub fn record_read_latency_us(us: u64) {
        metrics::histogram!("rillet_core_read_latency_seconds").record(us as f64 / 1_000_000.0);
    }
}

/// Timer for measuring operation durations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed time in microseconds
    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
