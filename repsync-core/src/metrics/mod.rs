//! Metrics for the sync layer
//!
//! Recorded through the `metrics` facade. Nothing is exported unless the
//! host application installs a recorder.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

pub const QUEUE_ENQUEUED: &str = "sync.queue.enqueued";
pub const QUEUE_DEPTH: &str = "sync.queue.depth";
pub const BATCHES_DELIVERED: &str = "sync.batches.delivered";
pub const BATCHES_FAILED: &str = "sync.batches.failed";
pub const ITEMS_EXHAUSTED: &str = "sync.items.exhausted";
pub const CONFLICTS_DETECTED: &str = "sync.conflicts.detected";
pub const CONFLICTS_RESOLVED: &str = "sync.conflicts.resolved";
pub const FLUSH_DURATION_MS: &str = "sync.flush.duration_ms";
pub const INVALIDATION_FAILED: &str = "sync.invalidation.failed";

/// Initialize metrics with descriptions
pub fn init_metrics() {
    // Queue
    describe_counter!(QUEUE_ENQUEUED, "Write intents added to the queue");
    describe_gauge!(QUEUE_DEPTH, "Items currently waiting in the queue");

    // Flush
    describe_counter!(BATCHES_DELIVERED, "Batches accepted by the remote");
    describe_counter!(BATCHES_FAILED, "Batches rejected or lost in transit");
    describe_counter!(ITEMS_EXHAUSTED, "Items dropped after the maximum delivery attempts");
    describe_histogram!(FLUSH_DURATION_MS, "Flush pass duration in milliseconds");

    // Conflicts
    describe_counter!(CONFLICTS_DETECTED, "Version conflicts raised");
    describe_counter!(CONFLICTS_RESOLVED, "Version conflicts settled");

    describe_counter!(INVALIDATION_FAILED, "Read view invalidations that failed");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a gauge metric
pub fn record_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}

/// Record a histogram metric
pub fn record_histogram(name: &'static str, value: f64) {
    histogram!(name).record(value);
}

/// Records elapsed milliseconds into a histogram when stopped
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    pub fn stop(self) {
        record_histogram(self.name, self.start.elapsed().as_secs_f64() * 1000.0);
    }
}
