//! The buffer queue engine.
//!
//! A queue owns a bounded set of buffers and moves them between a producer
//! and a consumer without allocating on every exchange:
//!
//! ```text
//!  Producer                    Queue                      Consumer
//!  ────────                    ─────                      ────────
//!  request_buffer ──► free list (best fit) / allocate
//!  push_buffer    ──► [broker] ──► dirty list (FIFO) ──► acquire_buffer
//!                                   free list ◄────────── release_buffer
//! ```
//!
//! # Architecture
//!
//! - [`BufferQueue`]: The contract every queue variant implements
//! - [`BufferQueueCore`]: Heap-backed queue with free/dirty lists and reuse
//! - [`SurfaceBufferQueue`]: Queue delegating buffers to a [`SurfaceProvider`]
//! - [`Producer`] / [`Consumer`]: Role-scoped views handed to each side
//! - [`ListenerRegistry`]: Availability and broker callbacks
//! - [`QueueRegistry`]: Explicit owner of named queues
//!
//! # Example
//!
//! ```rust
//! use bufferqueue::queue::{BufferConfig, QueueConfig, QueueRegistry};
//! use std::time::Duration;
//!
//! let registry = QueueRegistry::new();
//! let consumer = registry.create(QueueConfig::new("video").with_queue_size(2)).unwrap();
//! let producer = consumer.producer();
//!
//! let buffer = producer
//!     .request_buffer(&BufferConfig::virtual_memory(100), Some(Duration::ZERO))
//!     .unwrap();
//! buffer.write(b"frame");
//! producer.push_buffer(&buffer, true).unwrap();
//!
//! let filled = consumer.acquire_buffer().unwrap();
//! assert_eq!(filled.id(), buffer.id());
//! consumer.release_buffer(&filled).unwrap();
//! ```

mod config;
mod consumer;
mod engine;
mod element;
mod listener;
mod producer;
mod registry;
mod state;
mod surface;

pub use config::{BufferConfig, DEFAULT_QUEUE_SIZE, MAX_QUEUE_SIZE, QueueConfig};
pub use consumer::Consumer;
pub use engine::BufferQueueCore;
pub use listener::{
    BrokerRemoval, BufferAvailableListener, BufferFilledListener, ListenerRegistry,
};
pub use producer::Producer;
pub use registry::QueueRegistry;
pub use state::BufferState;
pub use surface::{NativeBuffer, SurfaceBufferQueue, SurfaceProvider};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::memory::MemoryType;
use std::time::Duration;

/// Convert a millisecond timeout as used on the wire into a wait bound.
///
/// Negative means wait forever, zero means do not wait.
pub fn timeout_from_millis(timeout_ms: i32) -> Option<Duration> {
    u64::try_from(timeout_ms).ok().map(Duration::from_millis)
}

/// Convert a wait bound back into wire milliseconds.
pub fn timeout_to_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(t) => i32::try_from(t.as_millis()).unwrap_or(i32::MAX),
    }
}

/// The operations every buffer queue variant supports.
///
/// Producer and consumer façades only ever talk to a queue through this
/// trait, so a heap-backed queue and a surface-backed one are
/// interchangeable behind them.
///
/// All operations except [`request_buffer`](Self::request_buffer) return
/// promptly. Listener callbacks are invoked after the queue's lock has been
/// released, so they may call back into the queue.
pub trait BufferQueue: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Memory type the queue has been fixed to, if any.
    fn memory_type(&self) -> Option<MemoryType>;

    /// Maximum number of buffers the queue holds.
    fn queue_size(&self) -> u32;

    /// Grow or shrink the queue.
    ///
    /// Shrinking evicts free buffers first, then filled ones, and marks
    /// buffers that are currently held for deletion when they come back.
    fn set_queue_size(&self, size: u32) -> Result<()>;

    /// Get an empty buffer for writing.
    ///
    /// `timeout` of `None` waits forever, `Some(Duration::ZERO)` does not wait.
    fn request_buffer(&self, config: &BufferConfig, timeout: Option<Duration>) -> Result<Buffer>;

    /// Hand a written buffer to the queue, or give it back unused when
    /// `available` is false.
    fn push_buffer(&self, id: u64, available: bool) -> Result<()>;

    /// Finish delivery of a pushed buffer (called by brokers, or internally
    /// when no broker is registered).
    fn return_buffer(&self, id: u64, available: bool) -> Result<()>;

    /// Take the oldest filled buffer.
    fn acquire_buffer(&self) -> Result<Buffer>;

    /// Give a consumed buffer back for reuse.
    fn release_buffer(&self, id: u64) -> Result<()>;

    /// Inject an externally created buffer. A filled buffer goes on to the
    /// consumer, an empty one into the free list.
    fn attach_buffer(&self, buffer: Buffer, is_filled: bool) -> Result<()>;

    /// Remove a buffer from the queue and hand it to the caller.
    ///
    /// Without `force`, only buffers currently held by a producer or a
    /// consumer may be detached.
    fn detach_buffer(&self, id: u64, force: bool) -> Result<Buffer>;

    /// Grow the queue to `size` and attach `buffer` in one step.
    fn set_queue_size_and_attach_buffer(
        &self,
        size: u32,
        buffer: Buffer,
        is_filled: bool,
    ) -> Result<()> {
        self.set_queue_size(size)?;
        self.attach_buffer(buffer, is_filled)
    }

    /// Move every pushed or filled buffer back to the free list.
    fn clear(&self) -> Result<()>;

    /// Move filled buffers matching `predicate` back to the free list.
    /// Returns the number of filled buffers left.
    ///
    /// The predicate runs under the queue's lock and must not call back
    /// into the queue.
    fn clear_buffer_if(&self, predicate: &dyn Fn(&Buffer) -> bool) -> Result<usize>;

    /// Number of buffers the queue currently owns.
    fn cached_buffer_count(&self) -> usize;

    /// Number of buffers in the free list.
    fn free_buffer_count(&self) -> usize;

    /// Number of filled buffers waiting for the consumer.
    fn filled_buffer_count(&self) -> usize;

    /// Current state of a buffer, or `None` if the queue does not own it.
    fn buffer_state(&self, id: u64) -> Option<BufferState>;

    /// Does the queue own a buffer with this id?
    fn is_buffer_in_queue(&self, id: u64) -> bool {
        self.buffer_state(id).is_some()
    }

    /// Point-in-time copy of the queue's bookkeeping.
    fn snapshot(&self) -> QueueSnapshot;

    /// The queue's listener slots.
    fn listeners(&self) -> &ListenerRegistry;

    /// Wake every blocked request and make future requests fail with
    /// [`Error::QueueReleased`].
    fn close(&self);
}

/// One buffer as seen by a [`QueueSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementSnapshot {
    /// Buffer identifier.
    pub id: u64,
    /// Lifecycle state.
    pub state: BufferState,
    /// Allocation size.
    pub capacity: i64,
    /// Marked for deferred deletion.
    pub pending_delete: bool,
}

/// Point-in-time copy of a queue's bookkeeping, for diagnostics and tests.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    /// Maximum number of buffers.
    pub queue_size: u32,
    /// Fixed memory type, if any.
    pub memory_type: Option<MemoryType>,
    /// Every buffer the queue owns, ordered by id.
    pub elements: Vec<ElementSnapshot>,
    /// Free list, smallest capacity first.
    pub free_list: Vec<u64>,
    /// Dirty list, oldest first.
    pub dirty_list: Vec<u64>,
}

impl QueueSnapshot {
    /// Look up one buffer.
    pub fn element(&self, id: u64) -> Option<&ElementSnapshot> {
        self.elements.iter().find(|e| e.id == id)
    }

    /// Number of buffers marked for deferred deletion.
    pub fn pending_delete_count(&self) -> usize {
        self.elements.iter().filter(|e| e.pending_delete).count()
    }

    /// Verify the list invariants.
    ///
    /// Every listed id is owned by the queue and appears in exactly one
    /// list; free buffers are `Released`, filled ones `Returned`; held
    /// buffers are in no list; the free list is ordered by capacity.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        for element in &self.elements {
            let in_free = self.free_list.iter().filter(|&&id| id == element.id).count();
            let in_dirty = self.dirty_list.iter().filter(|&&id| id == element.id).count();
            if in_free + in_dirty > 1 {
                return Err(format!("buffer {} listed {} times", element.id, in_free + in_dirty));
            }
            let expected = match element.state {
                BufferState::Released => (1, 0),
                BufferState::Returned => (0, 1),
                _ => (0, 0),
            };
            if (in_free, in_dirty) != expected {
                return Err(format!(
                    "buffer {} in state {} has free/dirty membership {:?}",
                    element.id,
                    element.state,
                    (in_free, in_dirty)
                ));
            }
        }
        for id in self.free_list.iter().chain(&self.dirty_list) {
            if self.element(*id).is_none() {
                return Err(format!("listed buffer {} is not owned by the queue", id));
            }
        }
        let capacities: Vec<i64> = self
            .free_list
            .iter()
            .filter_map(|id| self.element(*id).map(|e| e.capacity))
            .collect();
        if capacities.windows(2).any(|w| w[0] > w[1]) {
            return Err(format!("free list not ordered by capacity: {:?}", capacities));
        }
        Ok(())
    }
}

/// Check that a filled buffer actually carries data.
///
/// An end-of-stream buffer may be empty when `allow_eos` is set.
pub(crate) fn check_filled(buffer: &Buffer, allow_eos: bool) -> Result<i64> {
    let size = i64::try_from(buffer.size()).unwrap_or(i64::MAX);
    if size > 0 || (allow_eos && buffer.is_eos()) {
        Ok(size)
    } else {
        Err(Error::InvalidBufferSize(size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_conversion() {
        assert_eq!(timeout_from_millis(-1), None);
        assert_eq!(timeout_from_millis(0), Some(Duration::ZERO));
        assert_eq!(timeout_from_millis(25), Some(Duration::from_millis(25)));

        assert_eq!(timeout_to_millis(None), -1);
        assert_eq!(timeout_to_millis(Some(Duration::from_millis(25))), 25);
        assert_eq!(timeout_to_millis(Some(Duration::from_secs(u64::MAX))), i32::MAX);
    }

    #[test]
    fn test_snapshot_invariants_detect_double_listing() {
        let snapshot = QueueSnapshot {
            queue_size: 2,
            memory_type: Some(MemoryType::Virtual),
            elements: vec![ElementSnapshot {
                id: 1,
                state: BufferState::Released,
                capacity: 10,
                pending_delete: false,
            }],
            free_list: vec![1],
            dirty_list: vec![1],
        };
        assert!(snapshot.check_invariants().is_err());
    }

    #[test]
    fn test_snapshot_invariants_detect_listed_held_buffer() {
        let snapshot = QueueSnapshot {
            queue_size: 2,
            memory_type: None,
            elements: vec![ElementSnapshot {
                id: 1,
                state: BufferState::Acquired,
                capacity: 10,
                pending_delete: false,
            }],
            free_list: vec![1],
            dirty_list: vec![],
        };
        assert!(snapshot.check_invariants().is_err());
    }

    #[test]
    fn test_snapshot_invariants_detect_unordered_free_list() {
        let element = |id, capacity| ElementSnapshot {
            id,
            state: BufferState::Released,
            capacity,
            pending_delete: false,
        };
        let snapshot = QueueSnapshot {
            queue_size: 2,
            memory_type: None,
            elements: vec![element(1, 200), element(2, 100)],
            free_list: vec![1, 2],
            dirty_list: vec![],
        };
        assert!(snapshot.check_invariants().is_err());
    }
}
