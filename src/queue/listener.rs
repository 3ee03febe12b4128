//! Listener registry: the callbacks that let producer, broker and consumer
//! coordinate without polling.
//!
//! Each slot has its own lock, and callbacks are always invoked with no
//! lock held (neither the slot's nor the queue's), so a callback may call
//! straight back into the queue.

use crate::buffer::Buffer;
use parking_lot::Mutex;
use std::sync::Arc;

/// Notified when the other side has made progress.
///
/// Registered by a producer, it fires when a buffer becomes free. Registered
/// by a consumer, it fires when a filled buffer becomes ready.
pub trait BufferAvailableListener: Send + Sync {
    /// A buffer is available.
    fn on_buffer_available(&self);
}

impl<F> BufferAvailableListener for F
where
    F: Fn() + Send + Sync,
{
    fn on_buffer_available(&self) {
        self()
    }
}

/// Given first refusal on a pushed buffer before the consumer sees it.
///
/// The broker may inspect or rewrite the buffer, and must eventually hand it
/// back with `return_buffer(buffer, available)`.
pub trait BufferFilledListener: Send + Sync {
    /// A producer pushed `buffer`.
    fn on_buffer_filled(&self, buffer: Buffer);
}

impl<F> BufferFilledListener for F
where
    F: Fn(Buffer) + Send + Sync,
{
    fn on_buffer_filled(&self, buffer: Buffer) {
        self(buffer)
    }
}

/// Outcome of removing a broker listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum BrokerRemoval {
    /// The listener was the top of the stack and has been removed.
    Removed,
    /// The listener is registered but not on top; the stack is unchanged.
    NotTop,
    /// The listener is not registered at all.
    NotFound,
}

/// The three independent listener slots of a queue.
#[derive(Default)]
pub struct ListenerRegistry {
    producer: Mutex<Option<Arc<dyn BufferAvailableListener>>>,
    consumer: Mutex<Option<Arc<dyn BufferAvailableListener>>>,
    brokers: Mutex<Vec<Arc<dyn BufferFilledListener>>>,
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the producer-side listener.
    pub fn set_producer(&self, listener: Arc<dyn BufferAvailableListener>) {
        *self.producer.lock() = Some(listener);
    }

    /// Install (or replace) the consumer-side listener.
    pub fn set_consumer(&self, listener: Arc<dyn BufferAvailableListener>) {
        *self.consumer.lock() = Some(listener);
    }

    /// Is anyone listening for filled buffers?
    pub fn has_consumer(&self) -> bool {
        self.consumer.lock().is_some()
    }

    /// Push a broker onto the stack. It becomes the one that intercepts pushes.
    pub fn push_broker(&self, listener: Arc<dyn BufferFilledListener>) {
        self.brokers.lock().push(listener);
    }

    /// Remove `listener` if it is the top of the broker stack.
    ///
    /// Removal is LIFO only: a listener below the top stays registered and
    /// the call reports [`BrokerRemoval::NotTop`].
    pub fn remove_broker(&self, listener: &Arc<dyn BufferFilledListener>) -> BrokerRemoval {
        let mut brokers = self.brokers.lock();
        match brokers.iter().rposition(|l| same_listener(l, listener)) {
            Some(pos) if pos + 1 == brokers.len() => {
                brokers.pop();
                BrokerRemoval::Removed
            }
            Some(_) => BrokerRemoval::NotTop,
            None => BrokerRemoval::NotFound,
        }
    }

    /// Number of registered brokers.
    pub fn broker_count(&self) -> usize {
        self.brokers.lock().len()
    }

    /// The broker currently on top of the stack.
    pub fn top_broker(&self) -> Option<Arc<dyn BufferFilledListener>> {
        self.brokers.lock().last().cloned()
    }

    /// Tell the producer a buffer is free.
    pub fn notify_producer(&self) {
        let listener = self.producer.lock().clone();
        if let Some(listener) = listener {
            listener.on_buffer_available();
        }
    }

    /// Tell the consumer a filled buffer is ready. Returns false when no
    /// consumer is listening.
    pub fn notify_consumer(&self) -> bool {
        let listener = self.consumer.lock().clone();
        match listener {
            Some(listener) => {
                listener.on_buffer_available();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("producer", &self.producer.lock().is_some())
            .field("consumer", &self.consumer.lock().is_some())
            .field("brokers", &self.broker_count())
            .finish()
    }
}

/// Identity comparison on the listener object, ignoring vtable pointers.
fn same_listener(a: &Arc<dyn BufferFilledListener>, b: &Arc<dyn BufferFilledListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
