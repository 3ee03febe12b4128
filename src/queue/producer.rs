//! Producer-side view of a buffer queue.

use super::{
    BrokerRemoval, BufferAvailableListener, BufferConfig, BufferFilledListener, BufferQueue,
};
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// The producing side of a buffer queue.
///
/// A producer requests empty buffers, fills them and pushes them. It does
/// not keep the queue alive: once the queue has been destroyed every call
/// fails with [`Error::QueueReleased`].
///
/// Brokers (filters that want to see or rewrite buffers before the
/// consumer does) also register through the producer.
#[derive(Clone)]
pub struct Producer {
    queue: Weak<dyn BufferQueue>,
}

impl Producer {
    pub(crate) fn new(queue: &Arc<dyn BufferQueue>) -> Self {
        Self::from_weak(Arc::downgrade(queue))
    }

    pub(crate) fn from_weak(queue: Weak<dyn BufferQueue>) -> Self {
        Self { queue }
    }

    fn queue(&self) -> Result<Arc<dyn BufferQueue>> {
        self.queue.upgrade().ok_or(Error::QueueReleased)
    }

    /// Name of the underlying queue.
    pub fn name(&self) -> Result<String> {
        Ok(self.queue()?.name().to_string())
    }

    /// Get an empty buffer with at least `config.capacity` bytes.
    ///
    /// `timeout` of `None` blocks until a buffer is free, `Some(Duration::ZERO)`
    /// fails immediately with [`Error::NoFreeBuffer`].
    pub fn request_buffer(&self, config: &BufferConfig, timeout: Option<Duration>) -> Result<Buffer> {
        self.queue()?.request_buffer(config, timeout)
    }

    /// Hand a filled buffer to the queue, or give it back unused.
    pub fn push_buffer(&self, buffer: &Buffer, available: bool) -> Result<()> {
        self.queue()?.push_buffer(buffer.id(), available)
    }

    /// Finish delivery of a buffer a broker was given.
    pub fn return_buffer(&self, buffer: &Buffer, available: bool) -> Result<()> {
        self.queue()?.return_buffer(buffer.id(), available)
    }

    /// Inject an externally created buffer.
    pub fn attach_buffer(&self, buffer: Buffer, is_filled: bool) -> Result<()> {
        self.queue()?.attach_buffer(buffer, is_filled)
    }

    /// Take a buffer the producer holds out of the queue.
    pub fn detach_buffer(&self, buffer: &Buffer) -> Result<Buffer> {
        self.queue()?.detach_buffer(buffer.id(), false)
    }

    /// Register a broker. The most recent broker intercepts pushes.
    pub fn set_buffer_filled_listener(&self, listener: Arc<dyn BufferFilledListener>) -> Result<()> {
        self.queue()?.listeners().push_broker(listener);
        Ok(())
    }

    /// Unregister a broker.
    ///
    /// Only the most recent broker can be removed; trying to remove another
    /// one is logged and leaves the stack unchanged.
    pub fn remove_buffer_filled_listener(
        &self,
        listener: &Arc<dyn BufferFilledListener>,
    ) -> Result<BrokerRemoval> {
        let queue = self.queue()?;
        let removal = queue.listeners().remove_broker(listener);
        match removal {
            BrokerRemoval::Removed => {}
            BrokerRemoval::NotTop => {
                tracing::warn!(queue = queue.name(), "broker is not on top of the stack, not removed");
            }
            BrokerRemoval::NotFound => {
                tracing::warn!(queue = queue.name(), "broker is not registered");
            }
        }
        Ok(removal)
    }

    /// Be told whenever a buffer becomes free.
    pub fn set_buffer_available_listener(
        &self,
        listener: Arc<dyn BufferAvailableListener>,
    ) -> Result<()> {
        self.queue()?.listeners().set_producer(listener);
        Ok(())
    }

    /// Move every pushed or filled buffer back to the free list.
    pub fn clear(&self) -> Result<()> {
        self.queue()?.clear()
    }

    /// Move filled buffers matching `predicate` back to the free list.
    /// Returns the number of filled buffers left.
    pub fn clear_buffer_if(&self, predicate: &dyn Fn(&Buffer) -> bool) -> Result<usize> {
        self.queue()?.clear_buffer_if(predicate)
    }

    /// Maximum number of buffers in the queue.
    pub fn queue_size(&self) -> Result<u32> {
        Ok(self.queue()?.queue_size())
    }

    /// Grow or shrink the queue.
    pub fn set_queue_size(&self, size: u32) -> Result<()> {
        self.queue()?.set_queue_size(size)
    }

    /// Grow the queue and attach `buffer` in one step.
    pub fn set_queue_size_and_attach_buffer(
        &self,
        size: u32,
        buffer: Buffer,
        is_filled: bool,
    ) -> Result<()> {
        self.queue()?
            .set_queue_size_and_attach_buffer(size, buffer, is_filled)
    }

    /// Does the queue still exist?
    pub fn is_connected(&self) -> bool {
        self.queue.strong_count() > 0
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("connected", &self.is_connected())
            .finish()
    }
}
