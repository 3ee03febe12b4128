//! Heap-backed buffer queue with free-list reuse.

use super::config::check_queue_size;
use super::element::BufferElement;
use super::{
    BufferConfig, BufferQueue, BufferState, ElementSnapshot, ListenerRegistry, QueueConfig,
    QueueSnapshot, check_filled,
};
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::memory::{HeapAllocator, MemoryAllocator, MemoryType};
use crate::observability::{
    QueueMetrics, init_metrics, span_queue, trace_dropped, trace_resize,
};
use parking_lot::{Condvar, Mutex};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Span;

/// A bounded pool of reusable buffers shared by one producer and one consumer.
///
/// The queue owns every buffer it allocates. Buffers move between a free
/// list (ordered by capacity, for best-fit reuse) and a dirty list (FIFO, in
/// push order), and are only allocated when no free buffer exists and the
/// queue is below its size bound.
///
/// # Locking
///
/// One mutex guards the element map and both lists. It is never held while
/// a listener runs or while allocating outside the queue's own allocator,
/// and [`request_buffer`](BufferQueue::request_buffer) is the only operation
/// that blocks.
///
/// # Example
///
/// ```rust
/// use bufferqueue::queue::{BufferConfig, BufferQueue, BufferQueueCore, QueueConfig};
/// use std::time::Duration;
///
/// let queue = BufferQueueCore::new(QueueConfig::new("audio").with_queue_size(2)).unwrap();
///
/// let buffer = queue
///     .request_buffer(&BufferConfig::virtual_memory(256), Some(Duration::ZERO))
///     .unwrap();
/// buffer.write(&[0u8; 128]);
/// queue.push_buffer(buffer.id(), true).unwrap();
///
/// let filled = queue.acquire_buffer().unwrap();
/// queue.release_buffer(filled.id()).unwrap();
/// assert_eq!(queue.free_buffer_count(), 1);
/// ```
pub struct BufferQueueCore {
    name: String,
    allocator: Arc<dyn MemoryAllocator>,
    state: Mutex<CoreState>,
    /// Signalled when a buffer is freed or the size bound grows.
    free_available: Condvar,
    listeners: ListenerRegistry,
    require_consumer_listener: bool,
    metrics: QueueMetrics,
    span: Span,
}

struct CoreState {
    queue_size: u32,
    memory_type: Option<MemoryType>,
    elements: BTreeMap<u64, BufferElement>,
    /// Ascending by capacity.
    free_list: VecDeque<u64>,
    /// Push order.
    dirty_list: VecDeque<u64>,
    closed: bool,
}

/// What happened to a buffer that came back to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relist {
    Freed,
    Dropped,
}

enum Wait {
    Never,
    Until(Instant),
    Forever,
}

impl CoreState {
    fn element(&self, id: u64) -> Result<&BufferElement> {
        self.elements.get(&id).ok_or(Error::InvalidBufferId(id))
    }

    fn element_mut(&mut self, id: u64) -> Result<&mut BufferElement> {
        self.elements.get_mut(&id).ok_or(Error::InvalidBufferId(id))
    }

    fn check_memory_type(&self, actual: MemoryType) -> Result<()> {
        match self.memory_type {
            Some(expected) if expected != actual => {
                Err(Error::UnexpectedMemoryType { expected, actual })
            }
            _ => Ok(()),
        }
    }

    fn fix_memory_type(&mut self, memory_type: MemoryType) {
        if self.memory_type.is_none() {
            tracing::debug!(memory_type = %memory_type, "queue memory type fixed");
            self.memory_type = Some(memory_type);
        }
    }

    fn capacity_of(&self, id: u64) -> i64 {
        self.elements.get(&id).map_or(0, |e| e.config.capacity)
    }

    /// Insert into the free list after every buffer of equal or smaller capacity.
    fn insert_free(&mut self, id: u64) {
        let capacity = self.capacity_of(id);
        let pos = self
            .free_list
            .iter()
            .position(|other| self.capacity_of(*other) > capacity)
            .unwrap_or(self.free_list.len());
        self.free_list.insert(pos, id);
    }

    /// Delete a buffer and forget it in both lists.
    fn remove(&mut self, id: u64) -> Option<BufferElement> {
        self.free_list.retain(|other| *other != id);
        self.dirty_list.retain(|other| *other != id);
        self.elements.remove(&id)
    }

    /// Put a buffer back into the free list, or delete it if it was marked.
    fn relist_free(&mut self, id: u64) -> Relist {
        let pending = match self.elements.get_mut(&id) {
            Some(element) if element.pending_delete => true,
            Some(element) => {
                element.set_state(BufferState::Released);
                false
            }
            None => return Relist::Dropped,
        };
        if pending {
            self.remove(id);
            trace_dropped(id, "pending delete");
            Relist::Dropped
        } else {
            self.insert_free(id);
            Relist::Freed
        }
    }

    /// Delete up to `count` listed buffers, free ones first (smallest
    /// first), then filled ones (oldest first).
    fn evict(&mut self, count: usize) -> usize {
        let mut evicted = 0;
        while evicted < count {
            let Some(id) = self
                .free_list
                .pop_front()
                .or_else(|| self.dirty_list.pop_front())
            else {
                break;
            };
            self.elements.remove(&id);
            trace_dropped(id, "evicted");
            evicted += 1;
        }
        evicted
    }

    fn evictable(&self) -> usize {
        self.free_list.len() + self.dirty_list.len()
    }

    /// Mark or unmark held buffers so that, once every marked buffer is
    /// gone, the queue is back at its size bound. Returns the number of
    /// buffers marked.
    fn rebalance_pending(&mut self) -> usize {
        let target = self.elements.len().saturating_sub(self.queue_size as usize);
        let mut pending = self.elements.values().filter(|e| e.pending_delete).count();

        if pending < target {
            for element in self.elements.values_mut() {
                if pending == target {
                    break;
                }
                if !element.pending_delete && !element.state.is_listed() {
                    element.pending_delete = true;
                    pending += 1;
                }
            }
        } else if pending > target {
            for element in self.elements.values_mut() {
                if pending == target {
                    break;
                }
                if element.pending_delete {
                    element.pending_delete = false;
                    pending -= 1;
                }
            }
        }
        pending
    }
}

impl BufferQueueCore {
    /// Create a queue allocating from the process heap.
    pub fn new(config: QueueConfig) -> Result<Arc<Self>> {
        Self::with_allocator(config, Arc::new(HeapAllocator::new()))
    }

    /// Create a queue with a custom allocator.
    pub fn with_allocator(
        config: QueueConfig,
        allocator: Arc<dyn MemoryAllocator>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let metrics = if config.metrics {
            init_metrics();
            QueueMetrics::new(&config.name)
        } else {
            QueueMetrics::disabled()
        };
        let span = span_queue(&config.name, "heap");
        tracing::debug!(
            parent: &span,
            queue_size = config.queue_size,
            "buffer queue created"
        );

        Ok(Arc::new(Self {
            name: config.name,
            allocator,
            state: Mutex::new(CoreState {
                queue_size: config.queue_size,
                memory_type: config.memory_type,
                elements: BTreeMap::new(),
                free_list: VecDeque::new(),
                dirty_list: VecDeque::new(),
                closed: false,
            }),
            free_available: Condvar::new(),
            listeners: ListenerRegistry::new(),
            require_consumer_listener: config.require_consumer_listener,
            metrics,
            span,
        }))
    }

    fn record_occupancy(&self, state: &CoreState) {
        self.metrics.record_occupancy(
            state.free_list.len(),
            state.dirty_list.len(),
            state.elements.len(),
        );
    }

    fn record_relist(&self, relist: Relist) {
        match relist {
            Relist::Freed => self.metrics.record_released(),
            Relist::Dropped => self.metrics.record_dropped(1),
        }
    }

    /// Fail early when a filled buffer would reach a consumer nobody listens for.
    fn check_consumer_for_delivery(&self, via_broker: bool) -> Result<()> {
        if self.require_consumer_listener && !via_broker && !self.listeners.has_consumer() {
            return Err(Error::NoConsumerListener);
        }
        Ok(())
    }

    /// Wake blocked requests and tell the producer there is room again.
    fn signal_free(&self) {
        self.free_available.notify_all();
        self.listeners.notify_producer();
    }

    /// Hand out a free buffer (best fit, else the smallest one, regrown) or
    /// allocate a new one below the size bound.
    fn try_request(&self, state: &mut CoreState, config: &BufferConfig) -> Result<Option<Buffer>> {
        let best_fit = state.free_list.iter().position(|id| {
            state
                .elements
                .get(id)
                .is_some_and(|e| config.fits_within(&e.config))
        });
        let reuse = match best_fit {
            Some(pos) => Some(pos),
            None if !state.free_list.is_empty() => Some(0),
            None => None,
        };

        if let Some(pos) = reuse {
            let id = state.free_list[pos];
            let element = state.element_mut(id)?;
            if element.config.capacity < config.capacity {
                // Allocate before unlisting so a failure leaves the buffer free.
                let memory = self
                    .allocator
                    .allocate(config.capacity_bytes(), config.memory_type)?;
                element.buffer.replace_memory(memory);
                element.config.capacity = config.capacity;
                self.metrics.record_allocated();
                tracing::debug!(id, capacity = config.capacity, "reallocated free buffer");
            } else {
                element.buffer.reset();
            }
            element.config.size = -1;
            element.config.memory_type = config.memory_type;
            element.set_state(BufferState::Requested);
            let buffer = element.buffer.clone();
            state.free_list.remove(pos);
            state.fix_memory_type(config.memory_type);
            return Ok(Some(buffer));
        }

        if state.elements.len() < state.queue_size as usize {
            let memory = self
                .allocator
                .allocate(config.capacity_bytes(), config.memory_type)?;
            let buffer = Buffer::new(memory);
            let cached = BufferConfig {
                size: -1,
                ..*config
            };
            match state.elements.entry(buffer.id()) {
                Entry::Vacant(slot) => {
                    slot.insert(BufferElement::new(
                        buffer.clone(),
                        cached,
                        BufferState::Requested,
                    ));
                }
                Entry::Occupied(_) => {
                    return Err(Error::CreateBuffer(format!(
                        "buffer id {} already in queue {}",
                        buffer.id(),
                        self.name
                    )));
                }
            }
            state.fix_memory_type(config.memory_type);
            self.metrics.record_allocated();
            tracing::debug!(id = buffer.id(), capacity = config.capacity, "allocated buffer");
            return Ok(Some(buffer));
        }

        Ok(None)
    }

    /// Give a buffer back to the free list from one of the `allowed` states.
    fn cancel(&self, id: u64, allowed: fn(&BufferState) -> bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            let element = state.element(id)?;
            if !allowed(&element.state) {
                return Err(Error::InvalidBufferState {
                    id,
                    state: element.state,
                });
            }
            let relist = state.relist_free(id);
            self.record_relist(relist);
            self.record_occupancy(&state);
        }
        tracing::trace!(id, "buffer cancelled");
        self.signal_free();
        Ok(())
    }

    /// Drop a marked buffer at a relist point. Returns true if it was dropped.
    fn drop_if_pending(&self, state: &mut CoreState, id: u64) -> bool {
        if !state.elements.get(&id).is_some_and(|e| e.pending_delete) {
            return false;
        }
        state.remove(id);
        trace_dropped(id, "pending delete");
        self.metrics.record_dropped(1);
        self.record_occupancy(state);
        true
    }

    fn resize_locked(&self, state: &mut CoreState, size: u32) -> bool {
        let old = state.queue_size;
        state.queue_size = size;
        let excess = state.elements.len().saturating_sub(size as usize);
        let evicted = state.evict(excess);
        let deferred = state.rebalance_pending();
        if evicted > 0 {
            self.metrics.record_dropped(evicted);
        }
        self.record_occupancy(state);
        trace_resize(old, size, evicted, deferred);
        size > old
    }

    /// Everything attach checks, against a queue bounded by `size`.
    ///
    /// Runs before any mutation so a rejected attach leaves the queue as it was.
    fn check_attach(
        &self,
        state: &CoreState,
        buffer: &Buffer,
        is_filled: bool,
        size: u32,
    ) -> Result<usize> {
        let id = buffer.id();
        if let Some(existing) = state.elements.get(&id) {
            return Err(Error::InvalidBufferState {
                id,
                state: existing.state,
            });
        }
        state.check_memory_type(buffer.memory_type())?;
        if is_filled {
            // No end-of-stream exemption here: an attached filled buffer must carry data.
            check_filled(buffer, false)?;
            self.check_consumer_for_delivery(self.listeners.top_broker().is_some())?;
        }

        let needed = (state.elements.len() + 1).saturating_sub(size as usize);
        if needed > state.evictable() {
            return Err(Error::OutOfRange(format!(
                "queue {} is full: {} buffers, need to evict {}, only {} evictable",
                self.name,
                state.elements.len(),
                needed,
                state.evictable()
            )));
        }
        Ok(needed)
    }

    fn attach_locked(&self, state: &mut CoreState, buffer: Buffer, is_filled: bool) -> Result<()> {
        let size = state.queue_size;
        let needed = self.check_attach(state, &buffer, is_filled, size)?;
        let evicted = state.evict(needed);
        if evicted > 0 {
            self.metrics.record_dropped(evicted);
        }

        let id = buffer.id();
        let memory_type = buffer.memory_type();
        state.fix_memory_type(memory_type);
        let config = BufferConfig {
            size: i64::try_from(buffer.size()).unwrap_or(i64::MAX),
            capacity: i64::try_from(buffer.capacity()).unwrap_or(i64::MAX),
            memory_type,
        };
        state
            .elements
            .insert(id, BufferElement::new(buffer, config, BufferState::Attached));
        state.rebalance_pending();
        self.record_occupancy(state);
        tracing::debug!(id, is_filled, evicted, "buffer attached");
        Ok(())
    }

    /// Route a freshly attached buffer on to the consumer or the free list.
    fn settle_attached(&self, id: u64, is_filled: bool) -> Result<()> {
        if is_filled {
            self.push_buffer(id, true)
        } else {
            self.release_buffer(id)
        }
    }
}

impl BufferQueue for BufferQueueCore {
    fn name(&self) -> &str {
        &self.name
    }

    fn memory_type(&self) -> Option<MemoryType> {
        self.state.lock().memory_type
    }

    fn queue_size(&self) -> u32 {
        self.state.lock().queue_size
    }

    fn set_queue_size(&self, size: u32) -> Result<()> {
        let _span = self.span.enter();
        check_queue_size(size)?;
        let grew = {
            let mut state = self.state.lock();
            self.resize_locked(&mut state, size)
        };
        if grew {
            self.signal_free();
        }
        Ok(())
    }

    fn request_buffer(&self, config: &BufferConfig, timeout: Option<Duration>) -> Result<Buffer> {
        let _span = self.span.enter();
        config.validate()?;

        let started = Instant::now();
        let wait = match timeout {
            None => Wait::Forever,
            Some(t) if t.is_zero() => Wait::Never,
            Some(t) => started.checked_add(t).map_or(Wait::Forever, Wait::Until),
        };

        let mut state = self.state.lock();
        let mut waited = false;
        loop {
            if state.closed {
                return Err(Error::QueueReleased);
            }
            state.check_memory_type(config.memory_type)?;

            if let Some(buffer) = self.try_request(&mut state, config)? {
                if waited {
                    self.metrics.record_wait(started.elapsed());
                }
                self.metrics.record_requested();
                self.record_occupancy(&state);
                return Ok(buffer);
            }

            match wait {
                Wait::Never => return Err(Error::NoFreeBuffer),
                Wait::Forever => self.free_available.wait(&mut state),
                Wait::Until(deadline) => {
                    if self
                        .free_available
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        self.metrics.record_timeout();
                        tracing::debug!(
                            capacity = config.capacity,
                            waited_ms = started.elapsed().as_millis() as u64,
                            "request timed out"
                        );
                        return Err(Error::WaitTimeout);
                    }
                }
            }
            waited = true;
        }
    }

    fn push_buffer(&self, id: u64, available: bool) -> Result<()> {
        let _span = self.span.enter();
        if !available {
            return self.cancel(id, BufferState::can_push);
        }

        let broker = self.listeners.top_broker();
        let buffer = {
            let mut state = self.state.lock();
            let element = state.element(id)?;
            if !element.state.can_push() {
                return Err(Error::InvalidBufferState {
                    id,
                    state: element.state,
                });
            }
            let size = check_filled(&element.buffer, true)?;
            self.check_consumer_for_delivery(broker.is_some())?;

            if self.drop_if_pending(&mut state, id) {
                drop(state);
                self.free_available.notify_all();
                return Ok(());
            }

            let element = state.element_mut(id)?;
            element.config.size = size;
            element.set_state(BufferState::Pushed);
            element.buffer.clone()
        };
        self.metrics.record_pushed();

        match broker {
            Some(broker) => {
                broker.on_buffer_filled(buffer);
                Ok(())
            }
            None => self.return_buffer(id, true),
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
            let size = check_filled(&element.buffer, true)?;
            self.check_consumer_for_delivery(false)?;

            if self.drop_if_pending(&mut state, id) {
                drop(state);
                self.free_available.notify_all();
                return Ok(());
            }

            let element = state.element_mut(id)?;
            element.config.size = size;
            element.set_state(BufferState::Returned);
            state.dirty_list.push_back(id);
            self.record_occupancy(&state);
        }

        self.listeners.notify_consumer();
        Ok(())
    }

    fn acquire_buffer(&self) -> Result<Buffer> {
        let _span = self.span.enter();
        let mut state = self.state.lock();
        let id = state.dirty_list.pop_front().ok_or(Error::NoDirtyBuffer)?;
        let element = state.element_mut(id)?;
        element.set_state(BufferState::Acquired);
        let buffer = element.buffer.clone();
        self.record_occupancy(&state);
        self.metrics.record_acquired();
        Ok(buffer)
    }

    fn release_buffer(&self, id: u64) -> Result<()> {
        let _span = self.span.enter();
        {
            let mut state = self.state.lock();
            let element = state.element(id)?;
            if !element.state.can_release() {
                return Err(Error::InvalidBufferState {
                    id,
                    state: element.state,
                });
            }
            let relist = state.relist_free(id);
            self.record_relist(relist);
            self.record_occupancy(&state);
        }
        self.signal_free();
        Ok(())
    }

    fn attach_buffer(&self, buffer: Buffer, is_filled: bool) -> Result<()> {
        let _span = self.span.enter();
        let id = buffer.id();
        {
            let mut state = self.state.lock();
            self.attach_locked(&mut state, buffer, is_filled)?;
        }
        self.settle_attached(id, is_filled)
    }

    fn detach_buffer(&self, id: u64, force: bool) -> Result<Buffer> {
        let _span = self.span.enter();
        let buffer = {
            let mut state = self.state.lock();
            let element = state.element(id)?;
            if !force && !element.state.can_detach() {
                return Err(Error::InvalidBufferState {
                    id,
                    state: element.state,
                });
            }
            let element = state.remove(id).ok_or(Error::InvalidBufferId(id))?;
            state.rebalance_pending();
            self.record_occupancy(&state);
            element.buffer
        };
        tracing::debug!(id, force, "buffer detached");
        self.signal_free();
        Ok(buffer)
    }

    fn set_queue_size_and_attach_buffer(
        &self,
        size: u32,
        buffer: Buffer,
        is_filled: bool,
    ) -> Result<()> {
        let _span = self.span.enter();
        check_queue_size(size)?;
        let id = buffer.id();
        let grew = {
            let mut state = self.state.lock();
            // Shrinking evicts listed buffers before the attach makes room, and
            // together they remove exactly what attaching at `size` needs.
            self.check_attach(&state, &buffer, is_filled, size)?;
            let grew = self.resize_locked(&mut state, size);
            self.attach_locked(&mut state, buffer, is_filled)?;
            grew
        };
        if grew {
            self.free_available.notify_all();
        }
        self.settle_attached(id, is_filled)
    }

    fn clear(&self) -> Result<()> {
        let _span = self.span.enter();
        let cleared = {
            let mut state = self.state.lock();
            let mut ids: Vec<u64> = state.dirty_list.drain(..).collect();
            ids.extend(
                state
                    .elements
                    .values()
                    .filter(|e| e.state == BufferState::Pushed)
                    .map(BufferElement::id),
            );
            for id in &ids {
                let relist = state.relist_free(*id);
                self.record_relist(relist);
            }
            self.record_occupancy(&state);
            ids.len()
        };
        tracing::debug!(cleared, "queue cleared");
        if cleared > 0 {
            self.signal_free();
        }
        Ok(())
    }

    fn clear_buffer_if(&self, predicate: &dyn Fn(&Buffer) -> bool) -> Result<usize> {
        let _span = self.span.enter();
        let (cleared, remaining) = {
            let mut state = self.state.lock();
            let dirty = std::mem::take(&mut state.dirty_list);
            let mut matching = Vec::new();
            for id in dirty {
                let hit = state
                    .elements
                    .get(&id)
                    .is_some_and(|e| predicate(&e.buffer));
                if hit {
                    matching.push(id);
                } else {
                    state.dirty_list.push_back(id);
                }
            }
            for id in &matching {
                let relist = state.relist_free(*id);
                self.record_relist(relist);
            }
            self.record_occupancy(&state);
            (matching.len(), state.dirty_list.len())
        };
        tracing::debug!(cleared, remaining, "filled buffers cleared");
        if cleared > 0 {
            self.signal_free();
        }
        Ok(remaining)
    }

    fn cached_buffer_count(&self) -> usize {
        self.state.lock().elements.len()
    }

    fn free_buffer_count(&self) -> usize {
        self.state.lock().free_list.len()
    }

    fn filled_buffer_count(&self) -> usize {
        self.state.lock().dirty_list.len()
    }

    fn buffer_state(&self, id: u64) -> Option<BufferState> {
        self.state.lock().elements.get(&id).map(|e| e.state)
    }

    fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock();
        QueueSnapshot {
            queue_size: state.queue_size,
            memory_type: state.memory_type,
            elements: state
                .elements
                .values()
                .map(|e| ElementSnapshot {
                    id: e.id(),
                    state: e.state,
                    capacity: e.config.capacity,
                    pending_delete: e.pending_delete,
                })
                .collect(),
            free_list: state.free_list.iter().copied().collect(),
            dirty_list: state.dirty_list.iter().copied().collect(),
        }
    }

    fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.free_available.notify_all();
        tracing::debug!(parent: &self.span, "buffer queue closed");
    }
}

impl Drop for BufferQueueCore {
    fn drop(&mut self) {
        self.free_available.notify_all();
    }
}

impl std::fmt::Debug for BufferQueueCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BufferQueueCore")
            .field("name", &self.name)
            .field("queue_size", &state.queue_size)
            .field("memory_type", &state.memory_type)
            .field("cached", &state.elements.len())
            .field("free", &state.free_list.len())
            .field("dirty", &state.dirty_list.len())
            .finish()
    }
}
