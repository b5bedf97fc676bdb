//! Metrics definitions for the staking client.
//!
//! This module defines all metrics used throughout the core.
//! Metrics are collected using the `metrics` crate and can be exported
//! to Prometheus via `metrics-exporter-prometheus`.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

/// Initialize all metric descriptions.
/// Call this once at startup before any metrics are recorded.
pub fn init_metrics() {
    describe_counter!(
        "cache_lookups_total",
        "Total number of query cache lookups, labelled hit or miss"
    );
    describe_counter!(
        "cache_teardowns_total",
        "Total number of cache entries torn down after their last subscriber left"
    );
    describe_counter!(
        "upstream_errors_total",
        "Total number of errors that terminated a shared query stream"
    );
    describe_counter!(
        "extrinsics_submitted_total",
        "Total number of extrinsics appended to the submission queue"
    );
    describe_counter!(
        "extrinsics_failed_total",
        "Total number of extrinsics that ended in the Failed status"
    );
    describe_counter!(
        "extrinsic_transitions_total",
        "Total number of extrinsic status transitions applied"
    );
    describe_counter!(
        "signer_discovery_attempts_total",
        "Total number of signer discovery attempts"
    );
    describe_histogram!(
        "extrinsic_ack_duration_seconds",
        "Time between submission and node acknowledgment in seconds"
    );
}

/// Record a cache lookup.
///
/// # Arguments
/// * `cache` - The memoized query name
/// * `hit` - Whether an existing entry was reused
pub fn record_cache_lookup(cache: &'static str, hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!("cache_lookups_total", "cache" => cache, "outcome" => outcome).increment(1);
}

/// Record an idle cache entry being torn down.
pub fn record_cache_teardown(cache: &'static str) {
    counter!("cache_teardowns_total", "cache" => cache).increment(1);
}

/// Record an error that terminated a shared stream.
pub fn record_upstream_error(cache: &'static str) {
    counter!("upstream_errors_total", "cache" => cache).increment(1);
}

/// Record a new submission.
pub fn record_extrinsic_submitted(method: &'static str) {
    counter!("extrinsics_submitted_total", "method" => method).increment(1);
}

/// Record a submission reaching `Failed`.
pub fn record_extrinsic_failed(method: &str) {
    counter!("extrinsics_failed_total", "method" => method.to_string()).increment(1);
}

/// Record a status transition.
///
/// # Arguments
/// * `status` - The status the entry moved to
pub fn record_extrinsic_transition(status: &'static str) {
    counter!("extrinsic_transitions_total", "status" => status).increment(1);
}

/// Record a signer discovery attempt.
pub fn record_discovery_attempt(attempt: u32) {
    counter!("signer_discovery_attempts_total", "attempt" => attempt.to_string()).increment(1);
}

/// A timer that records the acknowledgment latency when dropped.
pub struct AckTimer {
    start: Instant,
}

impl AckTimer {
    /// Start a new acknowledgment timer.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for AckTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AckTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        histogram!("extrinsic_ack_duration_seconds").record(duration);
    }
}
