//! Wire protocol for driving a producer across a process boundary.
//!
//! Every producer operation is an opcode plus rkyv-serialized arguments.
//! Messages travel with length-prefixed framing:
//!
//! ```text
//! ┌──────────────┬────────────────────────────┐
//! │ len: u32 LE  │ rkyv-archived WireMessage  │
//! └──────────────┴────────────────────────────┘
//! ```

use crate::buffer::Buffer;
use crate::error::{Error, Result, StatusCode};
use crate::memory::{Memory, MemoryType};
use crate::metadata::Metadata;
use crate::queue::{BrokerRemoval, BufferConfig};

/// Size of the length prefix in front of every frame.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest frame accepted by [`unframe_message`].
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Producer operations that can be carried over a transport.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
#[repr(u32)]
pub enum QueueOpcode {
    /// Read the queue size.
    GetQueueSize = 0,
    /// Resize the queue.
    SetQueueSize = 1,
    /// Obtain an empty buffer.
    RequestBuffer = 2,
    /// Push (or cancel) a buffer.
    PushBuffer = 3,
    /// Finish delivery of a brokered buffer.
    ReturnBuffer = 4,
    /// Inject a buffer created on the remote side.
    AttachBuffer = 5,
    /// Take a buffer out of the queue.
    DetachBuffer = 6,
    /// Register a remote broker.
    SetFilledListener = 7,
    /// Unregister a remote broker.
    RemoveFilledListener = 8,
    /// Register a remote free-buffer listener.
    SetAvailableListener = 9,
}

impl QueueOpcode {
    /// Decode a wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        use QueueOpcode::*;
        Some(match value {
            0 => GetQueueSize,
            1 => SetQueueSize,
            2 => RequestBuffer,
            3 => PushBuffer,
            4 => ReturnBuffer,
            5 => AttachBuffer,
            6 => DetachBuffer,
            7 => SetFilledListener,
            8 => RemoveFilledListener,
            9 => SetAvailableListener,
            _ => return None,
        })
    }
}

impl std::fmt::Display for QueueOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GetQueueSize => write!(f, "GET_QUEUE_SIZE"),
            Self::SetQueueSize => write!(f, "SET_QUEUE_SIZE"),
            Self::RequestBuffer => write!(f, "REQUEST_BUFFER"),
            Self::PushBuffer => write!(f, "PUSH_BUFFER"),
            Self::ReturnBuffer => write!(f, "RETURN_BUFFER"),
            Self::AttachBuffer => write!(f, "ATTACH_BUFFER"),
            Self::DetachBuffer => write!(f, "DETACH_BUFFER"),
            Self::SetFilledListener => write!(f, "SET_FILLED_LISTENER"),
            Self::RemoveFilledListener => write!(f, "REMOVE_FILLED_LISTENER"),
            Self::SetAvailableListener => write!(f, "SET_AVAILABLE_LISTENER"),
        }
    }
}

/// Everything needed to mirror a buffer on the other side of a transport.
///
/// Sent the first time a buffer id crosses the boundary, and again whenever
/// the queue regrows the buffer.
#[derive(Clone, Debug, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct BufferDescriptor {
    /// Stable buffer id.
    pub id: u64,
    /// Backing memory type.
    pub memory_type: MemoryType,
    /// Allocation size in bytes.
    pub capacity: u64,
}

impl BufferDescriptor {
    /// Describe `buffer`.
    pub fn from_buffer(buffer: &Buffer) -> Self {
        Self {
            id: buffer.id(),
            memory_type: buffer.memory_type(),
            capacity: buffer.capacity() as u64,
        }
    }

    /// Build a local mirror with the same id and shape.
    pub fn to_buffer(&self) -> Result<Buffer> {
        Ok(Buffer::with_id(self.id, self.memory()?))
    }

    /// Build an empty buffer of this shape under a fresh local id.
    ///
    /// Ids are only unique within one process, so a buffer handed over by
    /// the other side must not keep its id once it joins a local queue.
    pub fn to_local_buffer(&self) -> Result<Buffer> {
        Ok(Buffer::new(self.memory()?))
    }

    fn memory(&self) -> Result<Memory> {
        let capacity = usize::try_from(self.capacity)
            .map_err(|_| Error::Transport(format!("capacity {} too large", self.capacity)))?;
        Ok(Memory::zeroed(capacity, self.memory_type))
    }
}

/// Written contents of a buffer: valid bytes plus metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct BufferPayload {
    /// Valid bytes.
    pub data: Vec<u8>,
    /// Buffer metadata.
    pub metadata: Metadata,
}

impl BufferPayload {
    /// Copy the contents out of `buffer`.
    pub fn capture(buffer: &Buffer) -> Self {
        Self {
            data: buffer.with_data(|data| data.to_vec()),
            metadata: buffer.metadata(),
        }
    }

    /// Copy the contents into `buffer`.
    pub fn apply(&self, buffer: &Buffer) -> Result<()> {
        if self.data.len() > buffer.capacity() {
            return Err(Error::InvalidBufferSize(
                i64::try_from(self.data.len()).unwrap_or(i64::MAX),
            ));
        }
        buffer.write(&self.data);
        buffer.set_metadata(self.metadata.clone());
        Ok(())
    }
}

/// A producer operation sent to the queue's side.
#[derive(Clone, Debug, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum QueueRequest {
    /// See [`QueueOpcode::GetQueueSize`].
    GetQueueSize,
    /// See [`QueueOpcode::SetQueueSize`].
    SetQueueSize {
        /// New size.
        size: u32,
    },
    /// See [`QueueOpcode::RequestBuffer`].
    RequestBuffer {
        /// Requested shape.
        config: BufferConfig,
        /// Milliseconds to wait, negative for forever.
        timeout_ms: i32,
    },
    /// See [`QueueOpcode::PushBuffer`].
    PushBuffer {
        /// Buffer id.
        id: u64,
        /// False to hand the buffer back unused.
        available: bool,
        /// Written contents when `available`.
        payload: Option<BufferPayload>,
    },
    /// See [`QueueOpcode::ReturnBuffer`].
    ReturnBuffer {
        /// Buffer id.
        id: u64,
        /// False to drop the buffer.
        available: bool,
        /// Contents as left by the broker.
        payload: Option<BufferPayload>,
    },
    /// See [`QueueOpcode::AttachBuffer`].
    AttachBuffer {
        /// Shape of the new buffer.
        descriptor: BufferDescriptor,
        /// Contents of the new buffer.
        payload: BufferPayload,
        /// Whether the buffer goes straight to the consumer.
        is_filled: bool,
    },
    /// See [`QueueOpcode::DetachBuffer`].
    DetachBuffer {
        /// Buffer id.
        id: u64,
    },
    /// See [`QueueOpcode::SetFilledListener`].
    SetFilledListener {
        /// Proxy-side listener id.
        listener_id: u64,
    },
    /// See [`QueueOpcode::RemoveFilledListener`].
    RemoveFilledListener {
        /// Proxy-side listener id.
        listener_id: u64,
    },
    /// See [`QueueOpcode::SetAvailableListener`].
    SetAvailableListener {
        /// Proxy-side listener id.
        listener_id: u64,
    },
}

impl QueueRequest {
    /// Opcode this request carries.
    pub fn opcode(&self) -> QueueOpcode {
        match self {
            Self::GetQueueSize => QueueOpcode::GetQueueSize,
            Self::SetQueueSize { .. } => QueueOpcode::SetQueueSize,
            Self::RequestBuffer { .. } => QueueOpcode::RequestBuffer,
            Self::PushBuffer { .. } => QueueOpcode::PushBuffer,
            Self::ReturnBuffer { .. } => QueueOpcode::ReturnBuffer,
            Self::AttachBuffer { .. } => QueueOpcode::AttachBuffer,
            Self::DetachBuffer { .. } => QueueOpcode::DetachBuffer,
            Self::SetFilledListener { .. } => QueueOpcode::SetFilledListener,
            Self::RemoveFilledListener { .. } => QueueOpcode::RemoveFilledListener,
            Self::SetAvailableListener { .. } => QueueOpcode::SetAvailableListener,
        }
    }
}

/// Answer to a [`QueueRequest`].
#[derive(Clone, Debug, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum QueueReply {
    /// Operation finished; `code` is a [`StatusCode`], `message` the error text.
    Status {
        /// Status code, 0 for success.
        code: u32,
        /// Error message, empty on success.
        message: String,
    },
    /// Current queue size.
    QueueSize {
        /// Maximum number of buffers.
        size: u32,
    },
    /// An empty buffer was handed out.
    Buffer {
        /// Buffer id.
        id: u64,
        /// Present when the other side has not seen this buffer in this shape.
        descriptor: Option<BufferDescriptor>,
    },
    /// An attached buffer now belongs to the queue under a queue-side id.
    Attached {
        /// Id the queue knows the buffer by.
        id: u64,
    },
    /// Result of removing a broker; only `Removed` changed the stack.
    BrokerRemoved {
        /// What the queue did.
        removal: BrokerRemoval,
    },
    /// A buffer was detached; ownership moves to the caller.
    Detached {
        /// Shape of the buffer.
        descriptor: BufferDescriptor,
        /// Its contents.
        payload: BufferPayload,
    },
}

impl QueueReply {
    /// Successful status reply.
    pub fn ok() -> Self {
        Self::Status {
            code: StatusCode::Ok as u32,
            message: String::new(),
        }
    }

    /// Status reply carrying `error`.
    pub fn error(error: &Error) -> Self {
        Self::Status {
            code: error.code() as u32,
            message: error.to_string(),
        }
    }

    /// Turn a status reply back into a `Result`.
    pub fn into_status(self) -> Result<()> {
        match self {
            Self::Status { code, message } => status_to_result(code, message),
            other => Err(unexpected_reply(&other)),
        }
    }
}

/// Map a wire status back onto the error taxonomy.
pub fn status_to_result(code: u32, message: String) -> Result<()> {
    match StatusCode::from_u32(code) {
        Some(StatusCode::Ok) => Ok(()),
        Some(status) => Err(Error::from_code(status, message)),
        None => Err(Error::Transport(format!(
            "unknown status code {}: {}",
            code, message
        ))),
    }
}

/// Error for a reply of the wrong kind.
pub fn unexpected_reply(reply: &QueueReply) -> Error {
    Error::Transport(format!("unexpected reply: {:?}", reply))
}

/// Notification sent from the queue's side to a remote listener.
#[derive(Clone, Debug, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum QueueEvent {
    /// A buffer became free.
    BufferAvailable {
        /// Proxy-side listener id.
        listener_id: u64,
    },
    /// A remote broker is given a pushed buffer.
    BufferFilled {
        /// Proxy-side listener id.
        listener_id: u64,
        /// Shape of the buffer.
        descriptor: BufferDescriptor,
        /// Contents as pushed.
        payload: BufferPayload,
    },
}

/// Everything that travels over a transport.
#[derive(Clone, Debug, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum WireMessage {
    /// Proxy to stub.
    Request(QueueRequest),
    /// Stub to proxy, answering a request.
    Reply(QueueReply),
    /// Stub to proxy, unsolicited.
    Event(QueueEvent),
}

/// Frame a message for sending.
///
/// Returns a buffer with length prefix followed by serialized message.
pub fn frame_message(msg: &WireMessage) -> Result<Vec<u8>> {
    let serialized = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|e| Error::Transport(format!("serialization failed: {}", e)))?;
    let len = u32::try_from(serialized.len())
        .map_err(|_| Error::Transport("message too large".into()))?;

    let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + serialized.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(&serialized);
    Ok(framed)
}

/// Unframe a message from a buffer.
///
/// Returns the message and the number of bytes consumed, or `None` if the
/// buffer doesn't contain a complete message yet.
pub fn unframe_message(buf: &[u8]) -> Result<Option<(WireMessage, usize)>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Transport(format!("frame of {} bytes exceeds limit", len)));
    }
    if buf.len() < FRAME_HEADER_LEN + len {
        return Ok(None);
    }

    // Copy to aligned buffer for rkyv
    let mut aligned = rkyv::util::AlignedVec::<16>::new();
    aligned.extend_from_slice(&buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len]);

    let msg = rkyv::from_bytes::<WireMessage, rkyv::rancor::Error>(&aligned)
        .map_err(|e| Error::Transport(format!("deserialization failed: {}", e)))?;

    Ok(Some((msg, FRAME_HEADER_LEN + len)))
}

/// Unframe exactly one complete message.
pub fn decode_frame(buf: &[u8]) -> Result<WireMessage> {
    match unframe_message(buf)? {
        Some((msg, consumed)) if consumed == buf.len() => Ok(msg),
        Some(_) => Err(Error::Transport("trailing bytes after frame".into())),
        None => Err(Error::Transport("incomplete frame".into())),
    }
}
