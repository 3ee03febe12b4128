//! Integration tests for surface-provider backed queues.
//!
//! A small in-memory provider stands in for a graphics buffer allocator:
//! it owns a fixed set of slots and blocks requesters until one is free.

use bufferqueue::memory::Memory;
use bufferqueue::prelude::*;
use bufferqueue::queue::{NativeBuffer, SurfaceProvider};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

struct SlotProvider {
    slots: Vec<Buffer>,
    state: Mutex<Slots>,
    freed: Condvar,
    flushed: AtomicUsize,
    /// Refuse flushes while set, like a disconnected display.
    refuse_flush: AtomicBool,
}

#[derive(Default)]
struct Slots {
    free: VecDeque<usize>,
    queued: VecDeque<usize>,
}

impl SlotProvider {
    fn new(count: usize, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: (0..count)
                .map(|_| Buffer::new(Memory::zeroed(capacity, MemoryType::Surface)))
                .collect(),
            state: Mutex::new(Slots {
                free: (0..count).collect(),
                queued: VecDeque::new(),
            }),
            freed: Condvar::new(),
            flushed: AtomicUsize::new(0),
            refuse_flush: AtomicBool::new(false),
        })
    }

    fn native(&self, slot: usize) -> NativeBuffer {
        NativeBuffer::new(slot as u64, self.slots[slot].clone())
    }

    fn give_back(&self, native: NativeBuffer) {
        self.state.lock().free.push_back(native.sequence as usize);
        self.freed.notify_one();
    }
}

impl SurfaceProvider for SlotProvider {
    fn request_buffer(
        &self,
        config: &BufferConfig,
        timeout: Option<Duration>,
    ) -> Result<NativeBuffer> {
        if config.capacity as usize > self.slots[0].capacity() {
            return Err(Error::CreateBuffer("surface too small".into()));
        }
        let mut state = self.state.lock();
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(slot) = state.free.pop_front() {
                return Ok(self.native(slot));
            }
            match deadline {
                None => self.freed.wait(&mut state),
                Some(deadline) => {
                    if self.freed.wait_until(&mut state, deadline).timed_out() {
                        return Err(Error::WaitTimeout);
                    }
                }
            }
        }
    }

    fn flush_buffer(&self, native: NativeBuffer) -> Result<()> {
        if self.refuse_flush.load(Ordering::SeqCst) {
            return Err(Error::Transport("display disconnected".into()));
        }
        self.state.lock().queued.push_back(native.sequence as usize);
        self.flushed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cancel_buffer(&self, native: NativeBuffer) -> Result<()> {
        self.give_back(native);
        Ok(())
    }

    fn acquire_buffer(&self) -> Result<NativeBuffer> {
        let slot = self
            .state
            .lock()
            .queued
            .pop_front()
            .ok_or(Error::NoDirtyBuffer)?;
        Ok(self.native(slot))
    }

    fn release_buffer(&self, native: NativeBuffer) -> Result<()> {
        self.give_back(native);
        Ok(())
    }
}

fn surface(name: &str, slots: usize) -> (QueueRegistry, Arc<SlotProvider>, Consumer) {
    let registry = QueueRegistry::new();
    let provider = SlotProvider::new(slots, 256);
    let consumer = registry
        .create_surface(QueueConfig::new(name).with_metrics(false), provider.clone())
        .unwrap();
    (registry, provider, consumer)
}

fn surface_config(capacity: i64) -> BufferConfig {
    BufferConfig::new(capacity, MemoryType::Surface)
}

#[test]
fn test_surface_queue_roundtrip() {
    let (_registry, provider, consumer) = surface("roundtrip", 2);
    let producer = consumer.producer();
    assert_eq!(consumer.memory_type().unwrap(), Some(MemoryType::Surface));

    let buffer = producer
        .request_buffer(&surface_config(128), Some(Duration::ZERO))
        .unwrap();
    buffer.write(b"rgba");
    producer.push_buffer(&buffer, true).unwrap();
    assert_eq!(provider.flushed.load(Ordering::SeqCst), 1);

    let filled = consumer.acquire_buffer().unwrap();
    assert_eq!(filled.id(), buffer.id());
    consumer.release_buffer(&filled).unwrap();
    assert_eq!(consumer.cached_buffer_count().unwrap(), 0);
}

#[test]
fn test_surface_consumer_notified() {
    let (_registry, _provider, consumer) = surface("notify", 2);
    let producer = consumer.producer();
    let ready = Arc::new(AtomicUsize::new(0));
    let counter = ready.clone();
    consumer
        .set_buffer_available_listener(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    let buffer = producer
        .request_buffer(&surface_config(16), Some(Duration::ZERO))
        .unwrap();
    buffer.write(b"x");
    producer.push_buffer(&buffer, true).unwrap();
    assert_eq!(ready.load(Ordering::SeqCst), 1);
}

#[test]
fn test_surface_state_errors() {
    let (_registry, _provider, consumer) = surface("errors", 1);
    let producer = consumer.producer();
    let buffer = producer
        .request_buffer(&surface_config(16), Some(Duration::ZERO))
        .unwrap();

    assert!(matches!(
        consumer.release_buffer(&buffer),
        Err(Error::InvalidBufferState { .. })
    ));
    assert_eq!(
        producer.push_buffer(&buffer, true).unwrap_err(),
        Error::InvalidBufferSize(0)
    );
    assert!(matches!(
        producer.request_buffer(&BufferConfig::virtual_memory(16), Some(Duration::ZERO)),
        Err(Error::UnexpectedMemoryType { .. })
    ));
    assert!(matches!(
        producer.request_buffer(&surface_config(4096), Some(Duration::ZERO)),
        Err(Error::CreateBuffer(_))
    ));
}

#[test]
fn test_surface_request_blocks_in_provider() {
    let (_registry, _provider, consumer) = surface("blocking", 1);
    let producer = consumer.producer();
    let first = producer
        .request_buffer(&surface_config(16), Some(Duration::ZERO))
        .unwrap();

    assert_eq!(
        producer
            .request_buffer(&surface_config(16), Some(Duration::from_millis(20)))
            .unwrap_err(),
        Error::WaitTimeout
    );

    let waiter = {
        let producer = producer.clone();
        thread::spawn(move || producer.request_buffer(&surface_config(16), None))
    };
    thread::sleep(Duration::from_millis(30));
    producer.push_buffer(&first, false).unwrap();

    let second = waiter.join().unwrap().unwrap();
    assert_eq!(second.id(), first.id());
}

#[test]
fn test_surface_attach_unsupported() {
    let (_registry, _provider, consumer) = surface("attach", 1);
    let buffer = Buffer::new(Memory::zeroed(16, MemoryType::Surface));
    assert!(matches!(
        consumer.attach_buffer(buffer, false),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn test_surface_clear_buffer_if_unsupported() {
    let (_registry, _provider, consumer) = surface("clear", 1);
    assert!(matches!(
        consumer.producer().clear_buffer_if(&|_: &Buffer| true),
        Err(Error::Unsupported(_))
    ));
}

/// A refused flush leaves the buffer with the producer, who can retry.
#[test]
fn test_surface_refused_flush_keeps_buffer() {
    let (_registry, provider, consumer) = surface("refused", 1);
    let producer = consumer.producer();
    let buffer = producer
        .request_buffer(&surface_config(64), Some(Duration::ZERO))
        .unwrap();
    buffer.write(b"frame");

    provider.refuse_flush.store(true, Ordering::SeqCst);
    assert!(matches!(
        producer.push_buffer(&buffer, true),
        Err(Error::Transport(_))
    ));
    assert_eq!(
        consumer.buffer_state(&buffer).unwrap(),
        Some(BufferState::Requested)
    );
    assert_eq!(provider.flushed.load(Ordering::SeqCst), 0);

    provider.refuse_flush.store(false, Ordering::SeqCst);
    producer.push_buffer(&buffer, true).unwrap();
    let filled = consumer.acquire_buffer().unwrap();
    filled.with_data(|data| assert_eq!(data, b"frame"));
    consumer.release_buffer(&filled).unwrap();
    assert_eq!(consumer.cached_buffer_count().unwrap(), 0);
}
