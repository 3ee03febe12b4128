//! Tracing integration for structured logging and spans.

use crate::queue::BufferState;
use tracing::{Level, Span, span};

/// Create the span a queue records its events under.
///
/// # Example
///
/// ```rust,ignore
/// use bufferqueue::observability::span_queue;
///
/// let span = span_queue("decoder-output", "heap");
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_queue(name: &str, variant: &str) -> Span {
    span!(Level::INFO, "buffer_queue", name = %name, variant = %variant)
}

/// Log a buffer changing state.
#[inline]
pub fn trace_transition(id: u64, from: BufferState, to: BufferState) {
    tracing::trace!(id = id, from = %from, to = %to, "buffer state changed");
}

/// Log a buffer leaving the queue for good.
#[inline]
pub fn trace_dropped(id: u64, reason: &str) {
    tracing::debug!(id = id, reason = %reason, "buffer deleted");
}

/// Log a queue resize.
#[inline]
pub fn trace_resize(from: u32, to: u32, evicted: usize, deferred: usize) {
    tracing::debug!(
        from = from,
        to = to,
        evicted = evicted,
        deferred = deferred,
        "queue size changed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_creation() {
        // These should not panic
        let span = span_queue("test-queue", "heap");
        let _guard = span.enter();
    }

    #[test]
    fn test_trace_functions() {
        // These should not panic even without a subscriber
        trace_transition(1, BufferState::Released, BufferState::Requested);
        trace_dropped(1, "pending delete");
        trace_resize(4, 2, 1, 1);
    }
}
