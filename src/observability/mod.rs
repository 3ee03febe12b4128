//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters, gauges, and histograms via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! Every queue built with metrics enabled records, labelled with `queue`:
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `bufferqueue_buffers_allocated` | Counter | New or regrown allocations |
//! | `bufferqueue_buffers_requested` | Counter | Buffers handed to producers |
//! | `bufferqueue_buffers_pushed` | Counter | Buffers pushed by producers |
//! | `bufferqueue_buffers_acquired` | Counter | Buffers handed to consumers |
//! | `bufferqueue_buffers_released` | Counter | Buffers back in the free list |
//! | `bufferqueue_buffers_dropped` | Counter | Buffers evicted or deleted lazily |
//! | `bufferqueue_request_timeouts` | Counter | Blocking requests that timed out |
//! | `bufferqueue_request_wait_ns` | Histogram | Time spent blocked in a request |
//! | `bufferqueue_free_buffers` | Gauge | Free list length |
//! | `bufferqueue_dirty_buffers` | Gauge | Dirty list length |
//! | `bufferqueue_cached_buffers` | Gauge | Buffers owned by the queue |
//!
//! ## Tracing
//!
//! Each queue owns a `buffer_queue` span; state transitions are logged at
//! `trace`, deletions and resizes at `debug`, contract misuse at `warn`.

mod metrics;
mod tracing_support;

pub use metrics::{QueueMetrics, init_metrics};
pub use tracing_support::{span_queue, trace_dropped, trace_resize, trace_transition};
