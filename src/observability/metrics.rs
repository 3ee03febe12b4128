//! Metrics collection using metrics-rs.

use metrics::{Counter, Gauge, Histogram, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const BUFFERS_ALLOCATED: &str = "bufferqueue_buffers_allocated";
const BUFFERS_REQUESTED: &str = "bufferqueue_buffers_requested";
const BUFFERS_PUSHED: &str = "bufferqueue_buffers_pushed";
const BUFFERS_ACQUIRED: &str = "bufferqueue_buffers_acquired";
const BUFFERS_RELEASED: &str = "bufferqueue_buffers_released";
const BUFFERS_DROPPED: &str = "bufferqueue_buffers_dropped";
const REQUEST_TIMEOUTS: &str = "bufferqueue_request_timeouts";
const REQUEST_WAIT_NS: &str = "bufferqueue_request_wait_ns";
const FREE_BUFFERS: &str = "bufferqueue_free_buffers";
const DIRTY_BUFFERS: &str = "bufferqueue_dirty_buffers";
const CACHED_BUFFERS: &str = "bufferqueue_cached_buffers";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        BUFFERS_ALLOCATED,
        Unit::Count,
        "Buffers allocated or reallocated by the queue"
    );
    metrics::describe_counter!(
        BUFFERS_REQUESTED,
        Unit::Count,
        "Buffers handed to producers"
    );
    metrics::describe_counter!(BUFFERS_PUSHED, Unit::Count, "Buffers pushed by producers");
    metrics::describe_counter!(
        BUFFERS_ACQUIRED,
        Unit::Count,
        "Buffers handed to consumers"
    );
    metrics::describe_counter!(
        BUFFERS_RELEASED,
        Unit::Count,
        "Buffers returned to the free list"
    );
    metrics::describe_counter!(
        BUFFERS_DROPPED,
        Unit::Count,
        "Buffers deleted by eviction or deferred deletion"
    );
    metrics::describe_counter!(
        REQUEST_TIMEOUTS,
        Unit::Count,
        "Blocking requests that timed out"
    );
    metrics::describe_histogram!(
        REQUEST_WAIT_NS,
        Unit::Nanoseconds,
        "Time a blocking request waited for a free buffer"
    );
    metrics::describe_gauge!(FREE_BUFFERS, Unit::Count, "Buffers in the free list");
    metrics::describe_gauge!(DIRTY_BUFFERS, Unit::Count, "Buffers in the dirty list");
    metrics::describe_gauge!(CACHED_BUFFERS, Unit::Count, "Buffers owned by the queue");
}

/// Metrics collector for one queue.
///
/// Handles are resolved once with the queue's label, so recording is just
/// an atomic update on the hot path.
#[derive(Clone)]
pub struct QueueMetrics {
    allocated: Counter,
    requested: Counter,
    pushed: Counter,
    acquired: Counter,
    released: Counter,
    dropped: Counter,
    timeouts: Counter,
    wait_time: Histogram,
    free: Gauge,
    dirty: Gauge,
    cached: Gauge,
}

impl QueueMetrics {
    /// Create a collector labelled with `queue`.
    pub fn new(queue: &str) -> Self {
        let label = queue.to_string();
        Self {
            allocated: counter!(BUFFERS_ALLOCATED, "queue" => label.clone()),
            requested: counter!(BUFFERS_REQUESTED, "queue" => label.clone()),
            pushed: counter!(BUFFERS_PUSHED, "queue" => label.clone()),
            acquired: counter!(BUFFERS_ACQUIRED, "queue" => label.clone()),
            released: counter!(BUFFERS_RELEASED, "queue" => label.clone()),
            dropped: counter!(BUFFERS_DROPPED, "queue" => label.clone()),
            timeouts: counter!(REQUEST_TIMEOUTS, "queue" => label.clone()),
            wait_time: histogram!(REQUEST_WAIT_NS, "queue" => label.clone()),
            free: gauge!(FREE_BUFFERS, "queue" => label.clone()),
            dirty: gauge!(DIRTY_BUFFERS, "queue" => label.clone()),
            cached: gauge!(CACHED_BUFFERS, "queue" => label),
        }
    }

    /// A collector that records nothing.
    pub fn disabled() -> Self {
        Self {
            allocated: Counter::noop(),
            requested: Counter::noop(),
            pushed: Counter::noop(),
            acquired: Counter::noop(),
            released: Counter::noop(),
            dropped: Counter::noop(),
            timeouts: Counter::noop(),
            wait_time: Histogram::noop(),
            free: Gauge::noop(),
            dirty: Gauge::noop(),
            cached: Gauge::noop(),
        }
    }

    /// Record a new or regrown allocation.
    #[inline]
    pub fn record_allocated(&self) {
        self.allocated.increment(1);
    }

    /// Record a buffer handed to a producer.
    #[inline]
    pub fn record_requested(&self) {
        self.requested.increment(1);
    }

    /// Record a push.
    #[inline]
    pub fn record_pushed(&self) {
        self.pushed.increment(1);
    }

    /// Record a buffer handed to a consumer.
    #[inline]
    pub fn record_acquired(&self) {
        self.acquired.increment(1);
    }

    /// Record a buffer returned to the free list.
    #[inline]
    pub fn record_released(&self) {
        self.released.increment(1);
    }

    /// Record buffers deleted from the queue.
    #[inline]
    pub fn record_dropped(&self, count: usize) {
        self.dropped.increment(count as u64);
    }

    /// Record a request that gave up waiting.
    #[inline]
    pub fn record_timeout(&self) {
        self.timeouts.increment(1);
    }

    /// Record how long a request blocked.
    #[inline]
    pub fn record_wait(&self, waited: Duration) {
        self.wait_time.record(waited.as_nanos() as f64);
    }

    /// Record list occupancy.
    #[inline]
    pub fn record_occupancy(&self, free: usize, dirty: usize, cached: usize) {
        self.free.set(free as f64);
        self.dirty.set(dirty as f64);
        self.cached.set(cached as f64);
    }
}

impl std::fmt::Debug for QueueMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        // Should not panic
        init_metrics();
        // Should be idempotent
        init_metrics();
    }

    #[test]
    fn test_queue_metrics_without_recorder() {
        let metrics = QueueMetrics::new("test-queue");
        metrics.record_allocated();
        metrics.record_requested();
        metrics.record_pushed();
        metrics.record_acquired();
        metrics.record_released();
        metrics.record_dropped(2);
        metrics.record_timeout();
        metrics.record_wait(Duration::from_micros(10));
        metrics.record_occupancy(1, 2, 3);
    }

    #[test]
    fn test_disabled_metrics() {
        let metrics = QueueMetrics::disabled();
        metrics.record_pushed();
        metrics.record_occupancy(0, 0, 0);
    }
}
