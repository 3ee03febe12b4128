//! Remote side of the producer protocol.

use super::protocol::{
    BufferDescriptor, BufferPayload, QueueEvent, QueueReply, QueueRequest, WireMessage,
    decode_frame, frame_message, unexpected_reply,
};
use super::stub::ProducerStub;
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::queue::{
    BrokerRemoval, BufferAvailableListener, BufferConfig, BufferFilledListener, Producer,
    timeout_to_millis,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Moves framed messages between a [`RemoteProducer`] and a [`ProducerStub`].
pub trait Transport: Send + Sync {
    /// Send one framed request and wait for the framed reply.
    fn call(&self, frame: Vec<u8>) -> Result<Vec<u8>>;

    /// Next framed event from the queue's side, if one is waiting.
    fn poll_event(&self) -> Result<Option<Vec<u8>>>;
}

/// In-process transport calling a stub directly.
///
/// # Example
///
/// ```rust
/// use bufferqueue::queue::{BufferConfig, QueueConfig, QueueRegistry};
/// use bufferqueue::transport::{LoopbackTransport, RemoteProducer};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let registry = QueueRegistry::new();
/// let consumer = registry.create(QueueConfig::new("remote")).unwrap();
///
/// let transport = LoopbackTransport::new(consumer.producer());
/// let remote = RemoteProducer::new(Arc::new(transport));
///
/// let buffer = remote
///     .request_buffer(&BufferConfig::virtual_memory(64), Some(Duration::ZERO))
///     .unwrap();
/// buffer.write(b"over the wire");
/// remote.push_buffer(&buffer, true).unwrap();
///
/// let filled = consumer.acquire_buffer().unwrap();
/// filled.with_data(|data| assert_eq!(data, b"over the wire"));
/// ```
pub struct LoopbackTransport {
    stub: ProducerStub,
    events: kanal::Receiver<Vec<u8>>,
}

impl LoopbackTransport {
    /// Serve `producer` through a fresh stub.
    pub fn new(producer: Producer) -> Self {
        let (stub, events) = ProducerStub::new(producer);
        Self { stub, events }
    }

    /// The stub behind this transport.
    pub fn stub(&self) -> &ProducerStub {
        &self.stub
    }
}

impl Transport for LoopbackTransport {
    fn call(&self, frame: Vec<u8>) -> Result<Vec<u8>> {
        self.stub.handle_frame(&frame)
    }

    fn poll_event(&self) -> Result<Option<Vec<u8>>> {
        self.events
            .try_recv()
            .map_err(|_| Error::Transport("event channel closed".into()))
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("stub", &self.stub)
            .field("pending_events", &self.events.len())
            .finish()
    }
}

/// A producer driving a queue on the other side of a [`Transport`].
///
/// Buffers handed out are local mirrors carrying the remote buffer's id.
/// Their contents travel with each push and return. Listener callbacks are
/// queued by the other side and run when [`dispatch_events`](Self::dispatch_events)
/// is called.
pub struct RemoteProducer {
    transport: Arc<dyn Transport>,
    mirrors: Mutex<HashMap<u64, Buffer>>,
    next_listener_id: AtomicU64,
    brokers: Mutex<HashMap<u64, Arc<dyn BufferFilledListener>>>,
    available: Mutex<HashMap<u64, Arc<dyn BufferAvailableListener>>>,
}

impl RemoteProducer {
    /// Drive a queue through `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            mirrors: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            brokers: Mutex::new(HashMap::new()),
            available: Mutex::new(HashMap::new()),
        }
    }

    fn call(&self, request: QueueRequest) -> Result<QueueReply> {
        let opcode = request.opcode();
        tracing::trace!(%opcode, "remote call");
        let reply = self
            .transport
            .call(frame_message(&WireMessage::Request(request))?)?;
        match decode_frame(&reply)? {
            WireMessage::Reply(reply) => Ok(reply),
            other => Err(Error::Transport(format!(
                "{} answered with {:?}",
                opcode, other
            ))),
        }
    }

    /// Local mirror for `descriptor`, rebuilt if the buffer changed shape.
    fn mirror(&self, descriptor: &BufferDescriptor) -> Result<Buffer> {
        let mut mirrors = self.mirrors.lock();
        if let Some(mirror) = mirrors.get(&descriptor.id) {
            if mirror.capacity() as u64 == descriptor.capacity
                && mirror.memory_type() == descriptor.memory_type
            {
                return Ok(mirror.clone());
            }
        }
        let mirror = descriptor.to_buffer()?;
        mirrors.insert(descriptor.id, mirror.clone());
        Ok(mirror)
    }

    fn next_listener_id(&self) -> u64 {
        self.next_listener_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Maximum number of buffers in the remote queue.
    pub fn queue_size(&self) -> Result<u32> {
        match self.call(QueueRequest::GetQueueSize)? {
            QueueReply::QueueSize { size } => Ok(size),
            other => Err(status_or_unexpected(other)),
        }
    }

    /// Grow or shrink the remote queue.
    pub fn set_queue_size(&self, size: u32) -> Result<()> {
        self.call(QueueRequest::SetQueueSize { size })?.into_status()
    }

    /// Get an empty buffer from the remote queue.
    pub fn request_buffer(&self, config: &BufferConfig, timeout: Option<Duration>) -> Result<Buffer> {
        let reply = self.call(QueueRequest::RequestBuffer {
            config: *config,
            timeout_ms: timeout_to_millis(timeout),
        })?;
        match reply {
            QueueReply::Buffer {
                descriptor: Some(descriptor),
                ..
            } => {
                let mirror = self.mirror(&descriptor)?;
                mirror.reset();
                Ok(mirror)
            }
            QueueReply::Buffer {
                id,
                descriptor: None,
            } => {
                let mirror = self
                    .mirrors
                    .lock()
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| Error::Transport(format!("no mirror for buffer {}", id)))?;
                mirror.reset();
                Ok(mirror)
            }
            other => Err(status_or_unexpected(other)),
        }
    }

    /// Send a buffer's contents and push it.
    pub fn push_buffer(&self, buffer: &Buffer, available: bool) -> Result<()> {
        self.call(QueueRequest::PushBuffer {
            id: buffer.id(),
            available,
            payload: available.then(|| BufferPayload::capture(buffer)),
        })?
        .into_status()
    }

    /// Send a brokered buffer's contents and finish its delivery.
    pub fn return_buffer(&self, buffer: &Buffer, available: bool) -> Result<()> {
        self.call(QueueRequest::ReturnBuffer {
            id: buffer.id(),
            available,
            payload: available.then(|| BufferPayload::capture(buffer)),
        })?
        .into_status()
    }

    /// Copy a locally created buffer into the remote queue.
    ///
    /// Returns the id the remote queue gave the copy. `buffer` itself stays
    /// with the caller; the copy comes back through
    /// [`request_buffer`](Self::request_buffer) or a broker like any other.
    pub fn attach_buffer(&self, buffer: &Buffer, is_filled: bool) -> Result<u64> {
        match self.call(QueueRequest::AttachBuffer {
            descriptor: BufferDescriptor::from_buffer(buffer),
            payload: BufferPayload::capture(buffer),
            is_filled,
        })? {
            QueueReply::Attached { id } => Ok(id),
            other => Err(status_or_unexpected(other)),
        }
    }

    /// Take a held buffer out of the remote queue.
    pub fn detach_buffer(&self, buffer: &Buffer) -> Result<Buffer> {
        match self.call(QueueRequest::DetachBuffer { id: buffer.id() })? {
            QueueReply::Detached {
                descriptor,
                payload,
            } => {
                let detached = self
                    .mirrors
                    .lock()
                    .remove(&descriptor.id)
                    .map_or_else(|| descriptor.to_buffer(), Ok)?;
                payload.apply(&detached)?;
                Ok(detached)
            }
            other => Err(status_or_unexpected(other)),
        }
    }

    /// Register a broker on the remote queue.
    pub fn set_buffer_filled_listener(&self, listener: Arc<dyn BufferFilledListener>) -> Result<()> {
        let listener_id = self.next_listener_id();
        self.brokers.lock().insert(listener_id, listener);
        let status = self
            .call(QueueRequest::SetFilledListener { listener_id })
            .and_then(QueueReply::into_status);
        if status.is_err() {
            self.brokers.lock().remove(&listener_id);
        }
        status
    }

    /// Unregister a broker from the remote queue.
    ///
    /// Same LIFO rule as [`Producer::remove_buffer_filled_listener`]: a
    /// broker that is not on top stays registered, here and remotely.
    pub fn remove_buffer_filled_listener(
        &self,
        listener: &Arc<dyn BufferFilledListener>,
    ) -> Result<BrokerRemoval> {
        let listener_id = self
            .brokers
            .lock()
            .iter()
            .find(|(_, l)| std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(listener)))
            .map(|(id, _)| *id);
        let Some(listener_id) = listener_id else {
            tracing::warn!("broker was never registered with this remote producer");
            return Ok(BrokerRemoval::NotFound);
        };
        let removal = match self.call(QueueRequest::RemoveFilledListener { listener_id })? {
            QueueReply::BrokerRemoved { removal } => removal,
            other => return Err(status_or_unexpected(other)),
        };
        match removal {
            BrokerRemoval::Removed => {
                self.brokers.lock().remove(&listener_id);
            }
            BrokerRemoval::NotTop => {
                tracing::warn!(listener_id, "remote broker is not on top of the stack, not removed");
            }
            BrokerRemoval::NotFound => {
                tracing::warn!(listener_id, "remote side does not know this broker");
                self.brokers.lock().remove(&listener_id);
            }
        }
        Ok(removal)
    }

    /// Be told whenever a buffer in the remote queue becomes free.
    pub fn set_buffer_available_listener(
        &self,
        listener: Arc<dyn BufferAvailableListener>,
    ) -> Result<()> {
        let listener_id = self.next_listener_id();
        self.call(QueueRequest::SetAvailableListener { listener_id })?
            .into_status()?;
        let mut available = self.available.lock();
        // The remote side keeps one producer listener; mirror that here.
        available.clear();
        available.insert(listener_id, listener);
        Ok(())
    }

    /// Run the listener callbacks for every event queued by the other side.
    ///
    /// Returns the number of events handled.
    pub fn dispatch_events(&self) -> Result<usize> {
        let mut handled = 0;
        while let Some(frame) = self.transport.poll_event()? {
            match decode_frame(&frame)? {
                WireMessage::Event(event) => self.dispatch(event)?,
                other => {
                    return Err(Error::Transport(format!("expected an event, got {:?}", other)));
                }
            }
            handled += 1;
        }
        Ok(handled)
    }

    fn dispatch(&self, event: QueueEvent) -> Result<()> {
        match event {
            QueueEvent::BufferAvailable { listener_id } => {
                let listener = self.available.lock().get(&listener_id).cloned();
                match listener {
                    Some(listener) => listener.on_buffer_available(),
                    None => tracing::debug!(listener_id, "event for replaced listener"),
                }
            }
            QueueEvent::BufferFilled {
                listener_id,
                descriptor,
                payload,
            } => {
                let mirror = self.mirror(&descriptor)?;
                payload.apply(&mirror)?;
                let listener = self.brokers.lock().get(&listener_id).cloned();
                match listener {
                    Some(listener) => listener.on_buffer_filled(mirror),
                    None => {
                        // The broker is gone; let the buffer through unchanged.
                        tracing::warn!(listener_id, "filled event for unknown broker");
                        self.return_buffer(&mirror, true)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for RemoteProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProducer")
            .field("mirrors", &self.mirrors.lock().len())
            .field("brokers", &self.brokers.lock().len())
            .finish()
    }
}

fn status_or_unexpected(reply: QueueReply) -> Error {
    match reply {
        QueueReply::Status { .. } => match reply.into_status() {
            Err(e) => e,
            Ok(()) => Error::Transport("missing reply payload".into()),
        },
        other => unexpected_reply(&other),
    }
}
