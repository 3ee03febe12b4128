//! Queue-side endpoint executing remote producer requests.

use super::protocol::{
    BufferDescriptor, BufferPayload, QueueEvent, QueueReply, QueueRequest, WireMessage,
    decode_frame, frame_message,
};
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::queue::{
    BrokerRemoval, BufferAvailableListener, BufferFilledListener, Producer, timeout_from_millis,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Buffers currently in the hands of the remote side, by id.
type HeldBuffers = Arc<Mutex<HashMap<u64, Buffer>>>;

/// Executes decoded [`QueueRequest`]s against a local [`Producer`].
///
/// Listener callbacks registered by the remote side become
/// [`QueueEvent`]s, framed and queued on an unbounded channel for the
/// transport to deliver. Sending never blocks, so a callback fired from
/// inside a queue operation cannot stall it.
pub struct ProducerStub {
    producer: Producer,
    events: kanal::Sender<Vec<u8>>,
    held: HeldBuffers,
    /// Capacity last described to the remote side, by buffer id.
    described: Mutex<HashMap<u64, u64>>,
    brokers: Mutex<HashMap<u64, Arc<dyn BufferFilledListener>>>,
}

impl ProducerStub {
    /// Create a stub and the receiving end of its event channel.
    pub fn new(producer: Producer) -> (Self, kanal::Receiver<Vec<u8>>) {
        let (events, receiver) = kanal::unbounded();
        let stub = Self {
            producer,
            events,
            held: Arc::new(Mutex::new(HashMap::new())),
            described: Mutex::new(HashMap::new()),
            brokers: Mutex::new(HashMap::new()),
        };
        (stub, receiver)
    }

    /// Decode one framed request, execute it and frame the reply.
    ///
    /// Malformed input is answered with a transport error status rather
    /// than failing the call.
    pub fn handle_frame(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let reply = match decode_frame(frame) {
            Ok(WireMessage::Request(request)) => self.handle(request),
            Ok(other) => QueueReply::error(&Error::Transport(format!(
                "expected a request, got {:?}",
                other
            ))),
            Err(e) => QueueReply::error(&e),
        };
        frame_message(&WireMessage::Reply(reply))
    }

    /// Execute one request.
    pub fn handle(&self, request: QueueRequest) -> QueueReply {
        let opcode = request.opcode();
        tracing::trace!(%opcode, "remote request");
        match self.execute(request) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(%opcode, error = %e, "remote request failed");
                QueueReply::error(&e)
            }
        }
    }

    fn execute(&self, request: QueueRequest) -> Result<QueueReply> {
        match request {
            QueueRequest::GetQueueSize => Ok(QueueReply::QueueSize {
                size: self.producer.queue_size()?,
            }),
            QueueRequest::SetQueueSize { size } => {
                self.producer.set_queue_size(size)?;
                Ok(QueueReply::ok())
            }
            QueueRequest::RequestBuffer { config, timeout_ms } => {
                let buffer = self
                    .producer
                    .request_buffer(&config, timeout_from_millis(timeout_ms))?;
                let id = buffer.id();
                let descriptor = self.describe_if_new(&buffer);
                self.held.lock().insert(id, buffer);
                Ok(QueueReply::Buffer { id, descriptor })
            }
            QueueRequest::PushBuffer {
                id,
                available,
                payload,
            } => {
                self.hand_back(id, |buffer| {
                    if let Some(payload) = &payload {
                        payload.apply(buffer)?;
                    }
                    self.producer.push_buffer(buffer, available)
                })?;
                Ok(QueueReply::ok())
            }
            QueueRequest::ReturnBuffer {
                id,
                available,
                payload,
            } => {
                self.hand_back(id, |buffer| {
                    if let Some(payload) = &payload {
                        payload.apply(buffer)?;
                    }
                    self.producer.return_buffer(buffer, available)
                })?;
                Ok(QueueReply::ok())
            }
            QueueRequest::AttachBuffer {
                descriptor,
                payload,
                is_filled,
            } => {
                let buffer = descriptor.to_local_buffer()?;
                payload.apply(&buffer)?;
                let id = buffer.id();
                self.producer.attach_buffer(buffer, is_filled)?;
                tracing::debug!(remote_id = descriptor.id, id, "remote buffer attached");
                Ok(QueueReply::Attached { id })
            }
            QueueRequest::DetachBuffer { id } => {
                let buffer = self.held_buffer(id)?;
                let detached = self.producer.detach_buffer(&buffer)?;
                self.held.lock().remove(&id);
                self.described.lock().remove(&id);
                Ok(QueueReply::Detached {
                    descriptor: BufferDescriptor::from_buffer(&detached),
                    payload: BufferPayload::capture(&detached),
                })
            }
            QueueRequest::SetFilledListener { listener_id } => {
                let broker: Arc<dyn BufferFilledListener> = Arc::new(RemoteBroker {
                    listener_id,
                    events: self.events.clone(),
                    held: self.held.clone(),
                });
                self.producer.set_buffer_filled_listener(broker.clone())?;
                self.brokers.lock().insert(listener_id, broker);
                Ok(QueueReply::ok())
            }
            QueueRequest::RemoveFilledListener { listener_id } => {
                let broker = self.brokers.lock().get(&listener_id).cloned();
                let removal = match broker {
                    Some(broker) => self.producer.remove_buffer_filled_listener(&broker)?,
                    None => {
                        tracing::warn!(listener_id, "unknown remote broker");
                        BrokerRemoval::NotFound
                    }
                };
                if removal == BrokerRemoval::Removed {
                    self.brokers.lock().remove(&listener_id);
                }
                Ok(QueueReply::BrokerRemoved { removal })
            }
            QueueRequest::SetAvailableListener { listener_id } => {
                self.producer
                    .set_buffer_available_listener(Arc::new(RemoteAvailable {
                        listener_id,
                        events: self.events.clone(),
                    }))?;
                Ok(QueueReply::ok())
            }
        }
    }

    /// Give a held buffer back to the queue through `op`.
    ///
    /// The buffer leaves the held set before `op` runs, since a broker may
    /// take it straight back, and is restored if `op` fails.
    fn hand_back(&self, id: u64, op: impl FnOnce(&Buffer) -> Result<()>) -> Result<()> {
        let buffer = self.held.lock().remove(&id).ok_or(Error::InvalidBufferId(id))?;
        if let Err(e) = op(&buffer) {
            self.held.lock().insert(id, buffer);
            return Err(e);
        }
        Ok(())
    }

    fn held_buffer(&self, id: u64) -> Result<Buffer> {
        self.held
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Error::InvalidBufferId(id))
    }

    fn describe_if_new(&self, buffer: &Buffer) -> Option<BufferDescriptor> {
        let descriptor = BufferDescriptor::from_buffer(buffer);
        let mut described = self.described.lock();
        if described.get(&descriptor.id) == Some(&descriptor.capacity) {
            return None;
        }
        described.insert(descriptor.id, descriptor.capacity);
        Some(descriptor)
    }
}

impl std::fmt::Debug for ProducerStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerStub")
            .field("producer", &self.producer)
            .field("held", &self.held.lock().len())
            .field("brokers", &self.brokers.lock().len())
            .finish()
    }
}

fn send_event(events: &kanal::Sender<Vec<u8>>, event: QueueEvent) {
    let frame = match frame_message(&WireMessage::Event(event)) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode queue event");
            return;
        }
    };
    if events.send(frame).is_err() {
        tracing::warn!("event channel closed, dropping queue event");
    }
}

/// Forwards pushed buffers to a broker on the remote side.
struct RemoteBroker {
    listener_id: u64,
    events: kanal::Sender<Vec<u8>>,
    held: HeldBuffers,
}

impl BufferFilledListener for RemoteBroker {
    fn on_buffer_filled(&self, buffer: Buffer) {
        let event = QueueEvent::BufferFilled {
            listener_id: self.listener_id,
            descriptor: BufferDescriptor::from_buffer(&buffer),
            payload: BufferPayload::capture(&buffer),
        };
        self.held.lock().insert(buffer.id(), buffer);
        send_event(&self.events, event);
    }
}

/// Forwards free-buffer notifications to the remote side.
struct RemoteAvailable {
    listener_id: u64,
    events: kanal::Sender<Vec<u8>>,
}

impl BufferAvailableListener for RemoteAvailable {
    fn on_buffer_available(&self) {
        send_event(
            &self.events,
            QueueEvent::BufferAvailable {
                listener_id: self.listener_id,
            },
        );
    }
}
