//! Integration tests for driving a queue through the producer protocol.
//!
//! All traffic goes through framed messages on a loopback transport, the
//! same path a socket transport would take.

use bufferqueue::prelude::*;
use bufferqueue::queue::{BrokerRemoval, BufferFilledListener};
use bufferqueue::transport::{
    LoopbackTransport, QueueOpcode, QueueReply, QueueRequest, RemoteProducer, Transport,
    WireMessage, frame_message, unframe_message,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn remote(size: u32) -> (QueueRegistry, Consumer, Arc<LoopbackTransport>, RemoteProducer) {
    let registry = QueueRegistry::new();
    let consumer = registry
        .create(QueueConfig::new("remote").with_queue_size(size).with_metrics(false))
        .unwrap();
    let transport = Arc::new(LoopbackTransport::new(consumer.producer()));
    let producer = RemoteProducer::new(transport.clone());
    (registry, consumer, transport, producer)
}

#[test]
fn test_remote_push_reaches_consumer() {
    let (_registry, consumer, _transport, producer) = remote(2);

    let buffer = producer
        .request_buffer(&BufferConfig::virtual_memory(64), Some(Duration::ZERO))
        .unwrap();
    buffer.write(b"remote frame");
    buffer.set_metadata(Metadata::with_sequence(11).with_pts(Duration::from_millis(33)));
    producer.push_buffer(&buffer, true).unwrap();

    let filled = consumer.acquire_buffer().unwrap();
    assert_eq!(filled.id(), buffer.id());
    filled.with_data(|data| assert_eq!(data, b"remote frame"));
    assert_eq!(filled.metadata().sequence, 11);
    assert_eq!(filled.metadata().pts, Some(Duration::from_millis(33)));
}

#[test]
fn test_remote_errors_keep_their_kind() {
    let (_registry, _consumer, _transport, producer) = remote(1);
    let _held = producer
        .request_buffer(&BufferConfig::virtual_memory(8), Some(Duration::ZERO))
        .unwrap();
    assert_eq!(
        producer
            .request_buffer(&BufferConfig::virtual_memory(8), Some(Duration::ZERO))
            .unwrap_err(),
        Error::NoFreeBuffer
    );
    assert_eq!(
        producer
            .request_buffer(&BufferConfig::virtual_memory(8), Some(Duration::from_millis(10)))
            .unwrap_err(),
        Error::WaitTimeout
    );
    assert!(matches!(
        producer.set_queue_size(1000),
        Err(Error::OutOfRange(_))
    ));
}

#[test]
fn test_remote_broker_rewrites_buffer() {
    let (_registry, consumer, transport, producer) = remote(2);
    let producer = Arc::new(producer);

    let returner = Arc::downgrade(&producer);
    let broker: Arc<dyn BufferFilledListener> = Arc::new(move |buffer: Buffer| {
        buffer.write(b"rewritten remotely");
        if let Some(producer) = returner.upgrade() {
            producer.return_buffer(&buffer, true).unwrap();
        }
    });
    producer.set_buffer_filled_listener(broker.clone()).unwrap();

    let buffer = producer
        .request_buffer(&BufferConfig::virtual_memory(64), Some(Duration::ZERO))
        .unwrap();
    buffer.write(b"original");
    producer.push_buffer(&buffer, true).unwrap();

    // Held by the broker until its event is dispatched.
    assert_eq!(consumer.filled_buffer_count().unwrap(), 0);
    assert_eq!(
        consumer.buffer_state(&buffer).unwrap(),
        Some(BufferState::Pushed)
    );

    assert_eq!(producer.dispatch_events().unwrap(), 1);
    let filled = consumer.acquire_buffer().unwrap();
    filled.with_data(|data| assert_eq!(data, b"rewritten remotely"));

    assert_eq!(
        producer.remove_buffer_filled_listener(&broker).unwrap(),
        BrokerRemoval::Removed
    );
    assert!(transport.poll_event().unwrap().is_none());
}

#[test]
fn test_remote_available_listener() {
    let (_registry, consumer, _transport, producer) = remote(1);
    let freed = Arc::new(AtomicUsize::new(0));
    let counter = freed.clone();
    producer
        .set_buffer_available_listener(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    let buffer = producer
        .request_buffer(&BufferConfig::virtual_memory(8), Some(Duration::ZERO))
        .unwrap();
    buffer.write(b"1");
    producer.push_buffer(&buffer, true).unwrap();
    let filled = consumer.acquire_buffer().unwrap();
    consumer.release_buffer(&filled).unwrap();

    // Nothing runs until events are dispatched.
    assert_eq!(freed.load(Ordering::SeqCst), 0);
    producer.dispatch_events().unwrap();
    assert_eq!(freed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_remote_attach() {
    let (_registry, consumer, _transport, producer) = remote(2);
    let local = Buffer::new(HeapAllocator::new().allocate(32, MemoryType::Virtual).unwrap());
    local.write(b"made remotely");
    let id = producer.attach_buffer(&local, true).unwrap();

    let filled = consumer.acquire_buffer().unwrap();
    assert_eq!(filled.id(), id);
    assert_ne!(filled.id(), local.id());
    filled.with_data(|data| assert_eq!(data, b"made remotely"));
}

#[test]
fn test_remote_attach_never_reuses_a_queue_id() {
    let (_registry, consumer, _transport, producer) = remote(3);
    let queued = producer
        .request_buffer(&BufferConfig::virtual_memory(16), Some(Duration::ZERO))
        .unwrap();
    producer.push_buffer(&queued, false).unwrap();

    // The remote side's buffer happens to carry an id the queue already uses.
    let clash = queued.clone();
    let id = producer.attach_buffer(&clash, false).unwrap();
    assert_ne!(id, queued.id());
    assert_eq!(consumer.cached_buffer_count().unwrap(), 2);

    let first = producer
        .request_buffer(&BufferConfig::virtual_memory(16), Some(Duration::ZERO))
        .unwrap();
    let second = producer
        .request_buffer(&BufferConfig::virtual_memory(16), Some(Duration::ZERO))
        .unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(consumer.cached_buffer_count().unwrap(), 2);
    consumer.snapshot().unwrap().check_invariants().unwrap();
}

#[test]
fn test_remote_broker_removal_is_lifo() {
    let (_registry, consumer, _transport, producer) = remote(2);
    let first: Arc<dyn BufferFilledListener> = Arc::new(|_: Buffer| {});
    let second: Arc<dyn BufferFilledListener> = Arc::new(|_: Buffer| {});
    producer.set_buffer_filled_listener(first.clone()).unwrap();
    producer.set_buffer_filled_listener(second.clone()).unwrap();

    assert_eq!(
        producer.remove_buffer_filled_listener(&first).unwrap(),
        BrokerRemoval::NotTop
    );
    assert_eq!(
        producer.remove_buffer_filled_listener(&second).unwrap(),
        BrokerRemoval::Removed
    );
    assert_eq!(
        producer.remove_buffer_filled_listener(&first).unwrap(),
        BrokerRemoval::Removed
    );

    let buffer = producer
        .request_buffer(&BufferConfig::virtual_memory(8), Some(Duration::ZERO))
        .unwrap();
    buffer.write(b"direct");
    producer.push_buffer(&buffer, true).unwrap();
    assert_eq!(consumer.filled_buffer_count().unwrap(), 1);
    assert_eq!(producer.dispatch_events().unwrap(), 0);
}

#[test]
fn test_remote_regrown_buffer_is_redescribed() {
    let (_registry, _consumer, _transport, producer) = remote(1);
    let small = producer
        .request_buffer(&BufferConfig::virtual_memory(16), Some(Duration::ZERO))
        .unwrap();
    producer.push_buffer(&small, false).unwrap();

    let large = producer
        .request_buffer(&BufferConfig::virtual_memory(4096), Some(Duration::ZERO))
        .unwrap();
    assert_eq!(large.id(), small.id());
    assert_eq!(large.capacity(), 4096);
    large.write(&[1u8; 4096]);
    producer.push_buffer(&large, true).unwrap();
}

#[test]
fn test_raw_frames_through_transport() {
    let (_registry, _consumer, transport, _producer) = remote(3);
    let request = WireMessage::Request(QueueRequest::GetQueueSize);
    let reply = transport.call(frame_message(&request).unwrap()).unwrap();

    let (decoded, consumed) = unframe_message(&reply).unwrap().unwrap();
    assert_eq!(consumed, reply.len());
    match decoded {
        WireMessage::Reply(QueueReply::QueueSize { size }) => assert_eq!(size, 3),
        other => panic!("Wrong reply: {:?}", other),
    }
    assert_eq!(QueueRequest::GetQueueSize.opcode(), QueueOpcode::GetQueueSize);
}

#[test]
fn test_garbage_frame_gets_transport_error() {
    let (_registry, _consumer, transport, _producer) = remote(1);
    let mut frame = 3u32.to_le_bytes().to_vec();
    frame.extend_from_slice(&[0xFF, 0xFF, 0xFF]);

    let reply = transport.call(frame).unwrap();
    match unframe_message(&reply).unwrap().unwrap().0 {
        WireMessage::Reply(reply) => {
            assert!(matches!(reply.into_status(), Err(Error::Transport(_))))
        }
        other => panic!("Wrong reply: {:?}", other),
    }
}

#[test]
fn test_removed_broker_lets_buffers_through() {
    let (_registry, consumer, _transport, producer) = remote(2);
    let seen = Arc::new(Mutex::new(0usize));
    let counter = seen.clone();
    let broker: Arc<dyn BufferFilledListener> =
        Arc::new(move |_: Buffer| *counter.lock() += 1);
    producer.set_buffer_filled_listener(broker.clone()).unwrap();
    producer.remove_buffer_filled_listener(&broker).unwrap();

    let buffer = producer
        .request_buffer(&BufferConfig::virtual_memory(8), Some(Duration::ZERO))
        .unwrap();
    buffer.write(b"direct");
    producer.push_buffer(&buffer, true).unwrap();

    assert_eq!(producer.dispatch_events().unwrap(), 0);
    assert_eq!(*seen.lock(), 0);
    assert_eq!(consumer.filled_buffer_count().unwrap(), 1);
}
