//! Consumer-side view of a buffer queue.

use super::{BufferAvailableListener, BufferQueue, BufferState, Producer, QueueSnapshot};
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::memory::MemoryType;
use std::sync::{Arc, Weak};

/// The consuming side of a buffer queue.
///
/// A consumer acquires filled buffers in push order and releases them once
/// it is done. Like [`Producer`], it only holds a weak reference to the
/// queue.
#[derive(Clone)]
pub struct Consumer {
    queue: Weak<dyn BufferQueue>,
}

impl Consumer {
    pub(crate) fn new(queue: &Arc<dyn BufferQueue>) -> Self {
        Self {
            queue: Arc::downgrade(queue),
        }
    }

    fn queue(&self) -> Result<Arc<dyn BufferQueue>> {
        self.queue.upgrade().ok_or(Error::QueueReleased)
    }

    /// A producer for the same queue.
    pub fn producer(&self) -> Producer {
        Producer::from_weak(self.queue.clone())
    }

    /// Name of the underlying queue.
    pub fn name(&self) -> Result<String> {
        Ok(self.queue()?.name().to_string())
    }

    /// Take the oldest filled buffer. Never blocks.
    pub fn acquire_buffer(&self) -> Result<Buffer> {
        self.queue()?.acquire_buffer()
    }

    /// Give a consumed buffer back for reuse.
    pub fn release_buffer(&self, buffer: &Buffer) -> Result<()> {
        self.queue()?.release_buffer(buffer.id())
    }

    /// Inject an externally created buffer.
    pub fn attach_buffer(&self, buffer: Buffer, is_filled: bool) -> Result<()> {
        self.queue()?.attach_buffer(buffer, is_filled)
    }

    /// Take a buffer the consumer holds out of the queue.
    pub fn detach_buffer(&self, buffer: &Buffer) -> Result<Buffer> {
        self.queue()?.detach_buffer(buffer.id(), false)
    }

    /// Remove any buffer from the queue, whatever its state.
    pub fn force_detach_buffer(&self, buffer: &Buffer) -> Result<Buffer> {
        self.queue()?.detach_buffer(buffer.id(), true)
    }

    /// Be told whenever a filled buffer is ready.
    pub fn set_buffer_available_listener(
        &self,
        listener: Arc<dyn BufferAvailableListener>,
    ) -> Result<()> {
        self.queue()?.listeners().set_consumer(listener);
        Ok(())
    }

    /// Maximum number of buffers in the queue.
    pub fn queue_size(&self) -> Result<u32> {
        Ok(self.queue()?.queue_size())
    }

    /// Grow or shrink the queue.
    pub fn set_queue_size(&self, size: u32) -> Result<()> {
        self.queue()?.set_queue_size(size)
    }

    /// Memory type the queue has been fixed to, if any.
    pub fn memory_type(&self) -> Result<Option<MemoryType>> {
        Ok(self.queue()?.memory_type())
    }

    /// Number of buffers the queue owns.
    pub fn cached_buffer_count(&self) -> Result<usize> {
        Ok(self.queue()?.cached_buffer_count())
    }

    /// Number of filled buffers waiting.
    pub fn filled_buffer_count(&self) -> Result<usize> {
        Ok(self.queue()?.filled_buffer_count())
    }

    /// Number of free buffers.
    pub fn free_buffer_count(&self) -> Result<usize> {
        Ok(self.queue()?.free_buffer_count())
    }

    /// Does the queue own this buffer?
    pub fn is_buffer_in_queue(&self, buffer: &Buffer) -> Result<bool> {
        Ok(self.queue()?.is_buffer_in_queue(buffer.id()))
    }

    /// Current state of a buffer.
    pub fn buffer_state(&self, buffer: &Buffer) -> Result<Option<BufferState>> {
        Ok(self.queue()?.buffer_state(buffer.id()))
    }

    /// Point-in-time copy of the queue's bookkeeping.
    pub fn snapshot(&self) -> Result<QueueSnapshot> {
        Ok(self.queue()?.snapshot())
    }

    /// Does the queue still exist?
    pub fn is_connected(&self) -> bool {
        self.queue.strong_count() > 0
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("connected", &self.is_connected())
            .finish()
    }
}
