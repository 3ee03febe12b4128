//! Buffer queue backed by an external graphics-buffer provider.
//!
//! The provider owns the physical buffers and their free/filled bookkeeping;
//! the queue only tracks the buffers currently held by a producer, a broker
//! or a consumer, and enforces the same state machine and error contract as
//! [`BufferQueueCore`](super::BufferQueueCore).
//!
//! ```text
//!  Producer ── request ──► provider.request_buffer ──► [Requested]
//!           ── push ─────► [broker] ──► provider.flush_buffer ──► consumer notified
//!  Consumer ── acquire ──► provider.acquire_buffer ──► [Acquired]
//!           ── release ──► provider.release_buffer
//! ```

use super::config::check_queue_size;
use super::{
    BufferConfig, BufferQueue, BufferState, ElementSnapshot, ListenerRegistry, QueueConfig,
    QueueSnapshot, check_filled,
};
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::memory::MemoryType;
use crate::observability::{QueueMetrics, init_metrics, span_queue, trace_transition};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

/// A buffer owned by a [`SurfaceProvider`].
///
/// The provider hands out the same [`Buffer`] handle every time it reuses a
/// slot, so buffer ids are stable per slot.
#[derive(Debug, Clone)]
pub struct NativeBuffer {
    /// Provider-side slot number.
    pub sequence: u64,
    /// The shared buffer handle.
    pub buffer: Buffer,
}

impl NativeBuffer {
    /// Pair a provider slot with its buffer.
    pub fn new(sequence: u64, buffer: Buffer) -> Self {
        Self { sequence, buffer }
    }
}

/// External source of graphics buffers.
///
/// Only [`request_buffer`](Self::request_buffer) may block. The other
/// methods are called with the queue's lock held and must not call back
/// into the queue.
pub trait SurfaceProvider: Send + Sync {
    /// Dequeue an empty buffer of at least `config.capacity` bytes.
    fn request_buffer(&self, config: &BufferConfig, timeout: Option<Duration>)
    -> Result<NativeBuffer>;

    /// Queue a filled buffer for the consumer side.
    fn flush_buffer(&self, native: NativeBuffer) -> Result<()>;

    /// Give back a buffer that was requested but not filled.
    fn cancel_buffer(&self, native: NativeBuffer) -> Result<()>;

    /// Take the oldest flushed buffer, or fail with [`Error::NoDirtyBuffer`].
    fn acquire_buffer(&self) -> Result<NativeBuffer>;

    /// Give back a consumed buffer.
    fn release_buffer(&self, native: NativeBuffer) -> Result<()>;

    /// Adopt an externally created buffer.
    fn attach_buffer(&self, native: NativeBuffer) -> Result<()> {
        let _ = native;
        Err(Error::Unsupported("attach on surface provider"))
    }

    /// Resize the provider's buffer pool.
    fn set_buffer_count(&self, count: u32) -> Result<()> {
        let _ = count;
        Ok(())
    }
}

struct SurfaceElement {
    native: NativeBuffer,
    state: BufferState,
}

impl SurfaceElement {
    fn set_state(&mut self, to: BufferState) {
        trace_transition(self.native.buffer.id(), self.state, to);
        self.state = to;
    }
}

struct SurfaceState {
    queue_size: u32,
    /// Buffers currently held outside the provider.
    held: BTreeMap<u64, SurfaceElement>,
    closed: bool,
}

impl SurfaceState {
    fn element(&self, id: u64) -> Result<&SurfaceElement> {
        self.held.get(&id).ok_or(Error::InvalidBufferId(id))
    }

    /// The provider handle of a held buffer in one of the `allowed` states.
    ///
    /// The element stays held until the provider has accepted the handle.
    fn native(&self, id: u64, allowed: fn(&BufferState) -> bool) -> Result<NativeBuffer> {
        let element = self.element(id)?;
        if !allowed(&element.state) {
            return Err(Error::InvalidBufferState {
                id,
                state: element.state,
            });
        }
        Ok(element.native.clone())
    }

    /// Stop tracking a buffer the provider has taken back.
    fn hand_over(&mut self, id: u64, to: BufferState) {
        if let Some(mut element) = self.held.remove(&id) {
            element.set_state(to);
        }
    }
}

/// Buffer queue delegating allocation and the free/filled lists to a
/// [`SurfaceProvider`].
///
/// The queue's memory type is always [`MemoryType::Surface`].
pub struct SurfaceBufferQueue {
    name: String,
    provider: Arc<dyn SurfaceProvider>,
    state: Mutex<SurfaceState>,
    listeners: ListenerRegistry,
    require_consumer_listener: bool,
    metrics: QueueMetrics,
    span: Span,
}

impl SurfaceBufferQueue {
    /// Create a queue on top of `provider`.
    pub fn new(config: QueueConfig, provider: Arc<dyn SurfaceProvider>) -> Result<Arc<Self>> {
        config.validate()?;
        if let Some(memory_type) = config.memory_type {
            if memory_type != MemoryType::Surface {
                return Err(Error::UnexpectedMemoryType {
                    expected: MemoryType::Surface,
                    actual: memory_type,
                });
            }
        }
        provider.set_buffer_count(config.queue_size)?;

        let metrics = if config.metrics {
            init_metrics();
            QueueMetrics::new(&config.name)
        } else {
            QueueMetrics::disabled()
        };
        let span = span_queue(&config.name, "surface");
        tracing::debug!(parent: &span, queue_size = config.queue_size, "surface queue created");

        Ok(Arc::new(Self {
            name: config.name,
            provider,
            state: Mutex::new(SurfaceState {
                queue_size: config.queue_size,
                held: BTreeMap::new(),
                closed: false,
            }),
            listeners: ListenerRegistry::new(),
            require_consumer_listener: config.require_consumer_listener,
            metrics,
            span,
        }))
    }

    fn check_consumer_for_delivery(&self, via_broker: bool) -> Result<()> {
        if self.require_consumer_listener && !via_broker && !self.listeners.has_consumer() {
            return Err(Error::NoConsumerListener);
        }
        Ok(())
    }

    fn check_surface(&self, memory_type: MemoryType) -> Result<()> {
        if memory_type != MemoryType::Surface {
            return Err(Error::UnexpectedMemoryType {
                expected: MemoryType::Surface,
                actual: memory_type,
            });
        }
        Ok(())
    }

    fn record_occupancy(&self, state: &SurfaceState) {
        self.metrics.record_occupancy(0, 0, state.held.len());
    }

    fn cancel(&self, id: u64, allowed: fn(&BufferState) -> bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            let native = state.native(id, allowed)?;
            self.provider.cancel_buffer(native)?;
            state.held.remove(&id);
            self.record_occupancy(&state);
        }
        tracing::trace!(id, "surface buffer cancelled");
        self.listeners.notify_producer();
        Ok(())
    }
}

impl BufferQueue for SurfaceBufferQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn memory_type(&self) -> Option<MemoryType> {
        Some(MemoryType::Surface)
    }

    fn queue_size(&self) -> u32 {
        self.state.lock().queue_size
    }

    fn set_queue_size(&self, size: u32) -> Result<()> {
        let _span = self.span.enter();
        check_queue_size(size)?;
        let mut state = self.state.lock();
        self.provider.set_buffer_count(size)?;
        tracing::debug!(from = state.queue_size, to = size, "surface queue resized");
        state.queue_size = size;
        Ok(())
    }

    fn request_buffer(&self, config: &BufferConfig, timeout: Option<Duration>) -> Result<Buffer> {
        let _span = self.span.enter();
        config.validate()?;
        self.check_surface(config.memory_type)?;
        if self.state.lock().closed {
            return Err(Error::QueueReleased);
        }

        let native = match self.provider.request_buffer(config, timeout) {
            Ok(native) => native,
            Err(Error::WaitTimeout) => {
                self.metrics.record_timeout();
                return Err(Error::WaitTimeout);
            }
            Err(e) => return Err(e),
        };
        let buffer = native.buffer.clone();

        let mut state = self.state.lock();
        if state.closed {
            self.provider.cancel_buffer(native)?;
            return Err(Error::QueueReleased);
        }
        let id = buffer.id();
        if let Some(existing) = state.held.get(&id) {
            let held_state = existing.state;
            self.provider.cancel_buffer(native)?;
            return Err(Error::InvalidBufferState {
                id,
                state: held_state,
            });
        }
        buffer.reset();
        let mut element = SurfaceElement {
            native,
            state: BufferState::Released,
        };
        element.set_state(BufferState::Requested);
        state.held.insert(id, element);
        self.metrics.record_requested();
        self.record_occupancy(&state);
        Ok(buffer)
    }

    fn push_buffer(&self, id: u64, available: bool) -> Result<()> {
        let _span = self.span.enter();
        if !available {
            return self.cancel(id, BufferState::can_push);
        }

        let broker = self.listeners.top_broker();
        let (buffer, from) = {
            let mut state = self.state.lock();
            let element = state.element(id)?;
            if !element.state.can_push() {
                return Err(Error::InvalidBufferState {
                    id,
                    state: element.state,
                });
            }
            check_filled(&element.native.buffer, true)?;
            self.check_consumer_for_delivery(broker.is_some())?;

            let element = state.held.get_mut(&id).ok_or(Error::InvalidBufferId(id))?;
            let from = element.state;
            element.set_state(BufferState::Pushed);
            (element.native.buffer.clone(), from)
        };
        self.metrics.record_pushed();

        match broker {
            Some(broker) => {
                broker.on_buffer_filled(buffer);
                Ok(())
            }
            None => self.return_buffer(id, true).inspect_err(|_| {
                // The provider refused the flush; the producer still owns the buffer.
                if let Some(element) = self.state.lock().held.get_mut(&id) {
                    if element.state == BufferState::Pushed {
                        element.set_state(from);
                    }
                }
            }),
        }
    }

    fn return_buffer(&self, id: u64, available: bool) -> Result<()> {
        let _span = self.span.enter();
        if !available {
            return self.cancel(id, BufferState::can_return);
        }

        {
            let mut state = self.state.lock();
            let element = state.element(id)?;
            if !element.state.can_return() {
                return Err(Error::InvalidBufferState {
                    id,
                    state: element.state,
                });
            }
            check_filled(&element.native.buffer, true)?;
            self.check_consumer_for_delivery(false)?;

            let native = state.native(id, BufferState::can_return)?;
            self.provider.flush_buffer(native)?;
            state.hand_over(id, BufferState::Returned);
            self.record_occupancy(&state);
        }

        self.listeners.notify_consumer();
        Ok(())
    }

    fn acquire_buffer(&self) -> Result<Buffer> {
        let _span = self.span.enter();
        let mut state = self.state.lock();
        let native = self.provider.acquire_buffer()?;
        let buffer = native.buffer.clone();
        let mut element = SurfaceElement {
            native,
            state: BufferState::Returned,
        };
        element.set_state(BufferState::Acquired);
        state.held.insert(buffer.id(), element);
        self.metrics.record_acquired();
        self.record_occupancy(&state);
        Ok(buffer)
    }

    fn release_buffer(&self, id: u64) -> Result<()> {
        let _span = self.span.enter();
        {
            let mut state = self.state.lock();
            let native = state.native(id, BufferState::can_release)?;
            self.provider.release_buffer(native)?;
            state.hand_over(id, BufferState::Released);
            self.metrics.record_released();
            self.record_occupancy(&state);
        }
        self.listeners.notify_producer();
        Ok(())
    }

    fn attach_buffer(&self, buffer: Buffer, is_filled: bool) -> Result<()> {
        let _span = self.span.enter();
        let id = buffer.id();
        {
            let mut state = self.state.lock();
            if let Some(existing) = state.held.get(&id) {
                return Err(Error::InvalidBufferState {
                    id,
                    state: existing.state,
                });
            }
            self.check_surface(buffer.memory_type())?;
            if is_filled {
                check_filled(&buffer, false)?;
                self.check_consumer_for_delivery(self.listeners.top_broker().is_some())?;
            }
            let native = NativeBuffer::new(id, buffer);
            self.provider.attach_buffer(native.clone())?;
            state.held.insert(
                id,
                SurfaceElement {
                    native,
                    state: BufferState::Attached,
                },
            );
            self.record_occupancy(&state);
        }
        tracing::debug!(id, is_filled, "surface buffer attached");

        if is_filled {
            self.push_buffer(id, true)
        } else {
            self.release_buffer(id)
        }
    }

    fn detach_buffer(&self, id: u64, force: bool) -> Result<Buffer> {
        let _span = self.span.enter();
        let mut state = self.state.lock();
        if !force {
            state.native(id, BufferState::can_detach)?;
        }
        let element = state.held.remove(&id).ok_or(Error::InvalidBufferId(id))?;
        self.record_occupancy(&state);
        tracing::debug!(id, force, "surface buffer detached");
        Ok(element.native.buffer)
    }

    fn clear(&self) -> Result<()> {
        let _span = self.span.enter();
        let mut state = self.state.lock();
        let pushed: Vec<u64> = state
            .held
            .iter()
            .filter(|(_, e)| e.state == BufferState::Pushed)
            .map(|(id, _)| *id)
            .collect();
        for id in &pushed {
            let native = state.native(*id, BufferState::can_return)?;
            self.provider.cancel_buffer(native)?;
            state.hand_over(*id, BufferState::Released);
        }
        self.record_occupancy(&state);
        tracing::debug!(cleared = pushed.len(), "surface queue cleared");
        Ok(())
    }

    fn clear_buffer_if(&self, _predicate: &dyn Fn(&Buffer) -> bool) -> Result<usize> {
        Err(Error::Unsupported("clear_buffer_if on surface queue"))
    }

    fn cached_buffer_count(&self) -> usize {
        self.state.lock().held.len()
    }

    fn free_buffer_count(&self) -> usize {
        0
    }

    fn filled_buffer_count(&self) -> usize {
        0
    }

    fn buffer_state(&self, id: u64) -> Option<BufferState> {
        self.state.lock().held.get(&id).map(|e| e.state)
    }

    fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock();
        QueueSnapshot {
            queue_size: state.queue_size,
            memory_type: Some(MemoryType::Surface),
            elements: state
                .held
                .iter()
                .map(|(id, e)| ElementSnapshot {
                    id: *id,
                    state: e.state,
                    capacity: i64::try_from(e.native.buffer.capacity()).unwrap_or(i64::MAX),
                    pending_delete: false,
                })
                .collect(),
            free_list: Vec::new(),
            dirty_list: Vec::new(),
        }
    }

    fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    fn close(&self) {
        self.state.lock().closed = true;
        tracing::debug!(parent: &self.span, "surface queue closed");
    }
}

impl std::fmt::Debug for SurfaceBufferQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SurfaceBufferQueue")
            .field("name", &self.name)
            .field("queue_size", &state.queue_size)
            .field("held", &state.held.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HeapAllocator, MemoryAllocator};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Fixed pool of surface buffers, never blocks.
    struct FakeSurface {
        slots: Vec<NativeBuffer>,
        free: Mutex<VecDeque<usize>>,
        queued: Mutex<VecDeque<usize>>,
        /// Refuse every buffer handed back while set.
        refuse: AtomicBool,
    }

    impl FakeSurface {
        fn new(count: usize) -> Arc<Self> {
            let slots: Vec<NativeBuffer> = (0..count)
                .map(|i| {
                    let memory = crate::memory::Memory::zeroed(64, MemoryType::Surface);
                    NativeBuffer::new(i as u64, Buffer::new(memory))
                })
                .collect();
            Arc::new(Self {
                free: Mutex::new((0..count).collect()),
                queued: Mutex::new(VecDeque::new()),
                refuse: AtomicBool::new(false),
                slots,
            })
        }

        fn slot(&self, native: &NativeBuffer) -> Result<usize> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(Error::Transport("surface disconnected".into()));
            }
            Ok(native.sequence as usize)
        }
    }

    impl SurfaceProvider for FakeSurface {
        fn request_buffer(
            &self,
            _config: &BufferConfig,
            _timeout: Option<Duration>,
        ) -> Result<NativeBuffer> {
            let slot = self.free.lock().pop_front().ok_or(Error::NoFreeBuffer)?;
            Ok(self.slots[slot].clone())
        }

        fn flush_buffer(&self, native: NativeBuffer) -> Result<()> {
            self.queued.lock().push_back(self.slot(&native)?);
            Ok(())
        }

        fn cancel_buffer(&self, native: NativeBuffer) -> Result<()> {
            self.free.lock().push_back(self.slot(&native)?);
            Ok(())
        }

        fn acquire_buffer(&self) -> Result<NativeBuffer> {
            let slot = self.queued.lock().pop_front().ok_or(Error::NoDirtyBuffer)?;
            Ok(self.slots[slot].clone())
        }

        fn release_buffer(&self, native: NativeBuffer) -> Result<()> {
            self.free.lock().push_back(self.slot(&native)?);
            Ok(())
        }
    }

    fn surface_queue(slots: usize) -> (Arc<FakeSurface>, Arc<SurfaceBufferQueue>) {
        let provider = FakeSurface::new(slots);
        let queue = SurfaceBufferQueue::new(
            QueueConfig::new("surface").with_metrics(false),
            provider.clone(),
        )
        .unwrap();
        (provider, queue)
    }

    fn surface_config() -> BufferConfig {
        BufferConfig::new(64, MemoryType::Surface)
    }

    #[test]
    fn test_surface_roundtrip() {
        let (provider, queue) = surface_queue(2);
        let buffer = queue.request_buffer(&surface_config(), Some(Duration::ZERO)).unwrap();
        buffer.write(b"pixels");
        queue.push_buffer(buffer.id(), true).unwrap();
        assert_eq!(provider.queued.lock().len(), 1);
        assert_eq!(queue.cached_buffer_count(), 0);

        let filled = queue.acquire_buffer().unwrap();
        assert_eq!(filled.id(), buffer.id());
        filled.with_data(|data| assert_eq!(data, b"pixels"));
        queue.release_buffer(filled.id()).unwrap();
        assert_eq!(provider.free.lock().len(), 2);
        queue.snapshot().check_invariants().unwrap();
    }

    #[test]
    fn test_surface_ids_stable_per_slot() {
        let (_provider, queue) = surface_queue(1);
        let first = queue.request_buffer(&surface_config(), Some(Duration::ZERO)).unwrap();
        queue.push_buffer(first.id(), false).unwrap();
        let second = queue.request_buffer(&surface_config(), Some(Duration::ZERO)).unwrap();
        assert_eq!(first.id(), second.id());
    }

    #[test]
    fn test_surface_rejects_other_memory() {
        let (_provider, queue) = surface_queue(1);
        let err = queue
            .request_buffer(&BufferConfig::virtual_memory(64), Some(Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedMemoryType { .. }));
    }

    #[test]
    fn test_surface_provider_errors_pass_through() {
        let (_provider, queue) = surface_queue(1);
        let _held = queue.request_buffer(&surface_config(), Some(Duration::ZERO)).unwrap();
        assert_eq!(
            queue.request_buffer(&surface_config(), Some(Duration::ZERO)).unwrap_err(),
            Error::NoFreeBuffer
        );
        assert_eq!(queue.acquire_buffer().unwrap_err(), Error::NoDirtyBuffer);
    }

    #[test]
    fn test_surface_push_requires_data() {
        let (_provider, queue) = surface_queue(1);
        let buffer = queue.request_buffer(&surface_config(), Some(Duration::ZERO)).unwrap();
        assert_eq!(
            queue.push_buffer(buffer.id(), true).unwrap_err(),
            Error::InvalidBufferSize(0)
        );
        assert_eq!(queue.buffer_state(buffer.id()), Some(BufferState::Requested));
    }

    #[test]
    fn test_surface_attach_unsupported() {
        let (_provider, queue) = surface_queue(1);
        let memory = HeapAllocator::new().allocate(16, MemoryType::Virtual).unwrap();
        assert!(matches!(
            queue.attach_buffer(Buffer::new(memory), false),
            Err(Error::UnexpectedMemoryType { .. })
        ));

        let surface = Buffer::new(crate::memory::Memory::zeroed(16, MemoryType::Surface));
        assert!(matches!(
            queue.attach_buffer(surface, false),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_surface_broker_sees_buffer() {
        let (provider, queue) = surface_queue(1);
        let weak = Arc::downgrade(&queue);
        queue.listeners().push_broker(Arc::new(move |buffer: Buffer| {
            buffer.write(b"brokered");
            if let Some(queue) = weak.upgrade() {
                queue.return_buffer(buffer.id(), true).unwrap();
            }
        }));

        let buffer = queue.request_buffer(&surface_config(), Some(Duration::ZERO)).unwrap();
        buffer.write(b"raw");
        queue.push_buffer(buffer.id(), true).unwrap();
        assert_eq!(provider.queued.lock().len(), 1);
        let filled = queue.acquire_buffer().unwrap();
        filled.with_data(|data| assert_eq!(data, b"brokered"));
    }

    #[test]
    fn test_surface_refused_handback_keeps_buffer() {
        let (provider, queue) = surface_queue(2);
        let buffer = queue.request_buffer(&surface_config(), Some(Duration::ZERO)).unwrap();
        buffer.write(b"frame");

        provider.refuse.store(true, Ordering::SeqCst);
        assert!(matches!(
            queue.push_buffer(buffer.id(), true),
            Err(Error::Transport(_))
        ));
        assert_eq!(queue.buffer_state(buffer.id()), Some(BufferState::Requested));
        assert!(queue.push_buffer(buffer.id(), false).is_err());
        assert_eq!(queue.cached_buffer_count(), 1);

        provider.refuse.store(false, Ordering::SeqCst);
        queue.push_buffer(buffer.id(), true).unwrap();
        let filled = queue.acquire_buffer().unwrap();

        provider.refuse.store(true, Ordering::SeqCst);
        assert!(queue.release_buffer(filled.id()).is_err());
        assert_eq!(queue.buffer_state(filled.id()), Some(BufferState::Acquired));

        provider.refuse.store(false, Ordering::SeqCst);
        queue.release_buffer(filled.id()).unwrap();
        assert_eq!(queue.cached_buffer_count(), 0);
        assert_eq!(provider.free.lock().len(), 2);
    }

    #[test]
    fn test_surface_clear_keeps_refused_buffer() {
        let (provider, queue) = surface_queue(1);
        queue.listeners().push_broker(Arc::new(|_: Buffer| {}));
        let buffer = queue.request_buffer(&surface_config(), Some(Duration::ZERO)).unwrap();
        buffer.write(b"held");
        queue.push_buffer(buffer.id(), true).unwrap();

        provider.refuse.store(true, Ordering::SeqCst);
        assert!(queue.clear().is_err());
        assert_eq!(queue.buffer_state(buffer.id()), Some(BufferState::Pushed));

        provider.refuse.store(false, Ordering::SeqCst);
        queue.clear().unwrap();
        assert_eq!(queue.buffer_state(buffer.id()), None);
        assert_eq!(
            queue.return_buffer(buffer.id(), true).unwrap_err(),
            Error::InvalidBufferId(buffer.id())
        );
    }
}
