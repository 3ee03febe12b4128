//! Error types for the buffer queue.

use crate::queue::BufferState;
use thiserror::Error;

/// Result type alias using the queue's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for buffer queue operations.
///
/// Every queue operation either succeeds or reports exactly one of these.
/// Validation errors are always reported before any state is mutated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The buffer carries no valid payload size (and is not end-of-stream).
    #[error("invalid buffer size: {0}")]
    InvalidBufferSize(i64),

    /// The operation is not legal in the buffer's current state.
    #[error("buffer {id} is in state {state}, operation not allowed")]
    InvalidBufferState {
        /// Buffer identifier.
        id: u64,
        /// State the buffer was found in.
        state: BufferState,
    },

    /// The buffer id is not known to this queue.
    #[error("unknown buffer id {0}")]
    InvalidBufferId(u64),

    /// A buffer was expected but none was supplied.
    ///
    /// Buffer handles can't be null, so the queues never return this. It
    /// only appears when decoding a peer's [`StatusCode::NullPointBuffer`]
    /// with [`Error::from_code`].
    #[error("null buffer")]
    NullBuffer,

    /// The buffer's memory type does not match the queue's.
    #[error("unexpected memory type: queue uses {expected:?}, got {actual:?}")]
    UnexpectedMemoryType {
        /// Memory type fixed for the queue.
        expected: crate::memory::MemoryType,
        /// Memory type that was offered.
        actual: crate::memory::MemoryType,
    },

    /// No free buffer is available and waiting was not allowed.
    #[error("no free buffer available")]
    NoFreeBuffer,

    /// No filled buffer is waiting to be consumed.
    #[error("no dirty buffer available")]
    NoDirtyBuffer,

    /// A size or count is outside the permitted range.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Buffer allocation failed.
    #[error("failed to create buffer: {0}")]
    CreateBuffer(String),

    /// A blocking request timed out.
    #[error("timed out waiting for a free buffer")]
    WaitTimeout,

    /// A filled buffer was returned with no consumer listening.
    #[error("no consumer listener registered")]
    NoConsumerListener,

    /// The queue behind a producer or consumer handle no longer exists.
    #[error("buffer queue has been released")]
    QueueReleased,

    /// The backing queue variant cannot perform this operation.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Transport framing or codec failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Numeric status codes used when an error crosses a process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusCode {
    /// Success.
    Ok = 0,
    /// See [`Error::InvalidBufferSize`].
    InvalidBufferSize = 1,
    /// See [`Error::InvalidBufferState`].
    InvalidBufferState = 2,
    /// See [`Error::InvalidBufferId`].
    InvalidBufferId = 3,
    /// See [`Error::NullBuffer`].
    NullPointBuffer = 4,
    /// See [`Error::UnexpectedMemoryType`].
    UnexpectedMemoryType = 5,
    /// See [`Error::NoFreeBuffer`].
    NoFreeBuffer = 6,
    /// See [`Error::NoDirtyBuffer`].
    NoDirtyBuffer = 7,
    /// See [`Error::OutOfRange`].
    OutOfRange = 8,
    /// See [`Error::CreateBuffer`].
    CreateBuffer = 9,
    /// See [`Error::WaitTimeout`].
    WaitTimeout = 10,
    /// See [`Error::NoConsumerListener`].
    NoConsumerListener = 11,
    /// See [`Error::QueueReleased`].
    QueueReleased = 12,
    /// See [`Error::Unsupported`].
    Unsupported = 13,
    /// See [`Error::Transport`].
    Transport = 14,
}

impl StatusCode {
    /// Decode a wire value.
    pub fn from_u32(code: u32) -> Option<Self> {
        use StatusCode::*;
        Some(match code {
            0 => Ok,
            1 => InvalidBufferSize,
            2 => InvalidBufferState,
            3 => InvalidBufferId,
            4 => NullPointBuffer,
            5 => UnexpectedMemoryType,
            6 => NoFreeBuffer,
            7 => NoDirtyBuffer,
            8 => OutOfRange,
            9 => CreateBuffer,
            10 => WaitTimeout,
            11 => NoConsumerListener,
            12 => QueueReleased,
            13 => Unsupported,
            14 => Transport,
            _ => return None,
        })
    }
}

impl Error {
    /// The status code reported for this error.
    pub fn code(&self) -> StatusCode {
        match self {
            Error::InvalidBufferSize(_) => StatusCode::InvalidBufferSize,
            Error::InvalidBufferState { .. } => StatusCode::InvalidBufferState,
            Error::InvalidBufferId(_) => StatusCode::InvalidBufferId,
            Error::NullBuffer => StatusCode::NullPointBuffer,
            Error::UnexpectedMemoryType { .. } => StatusCode::UnexpectedMemoryType,
            Error::NoFreeBuffer => StatusCode::NoFreeBuffer,
            Error::NoDirtyBuffer => StatusCode::NoDirtyBuffer,
            Error::OutOfRange(_) => StatusCode::OutOfRange,
            Error::CreateBuffer(_) => StatusCode::CreateBuffer,
            Error::WaitTimeout => StatusCode::WaitTimeout,
            Error::NoConsumerListener => StatusCode::NoConsumerListener,
            Error::QueueReleased => StatusCode::QueueReleased,
            Error::Unsupported(_) => StatusCode::Unsupported,
            Error::Transport(_) => StatusCode::Transport,
        }
    }

    /// Rebuild an error from a status code and the message that travelled with it.
    ///
    /// Variants with structured payloads lose their detail on the way
    /// across; the message is kept where the variant can hold it.
    pub fn from_code(code: StatusCode, message: String) -> Self {
        match code {
            StatusCode::Ok | StatusCode::Transport => Error::Transport(message),
            StatusCode::InvalidBufferSize => Error::InvalidBufferSize(-1),
            StatusCode::InvalidBufferState => Error::InvalidBufferState {
                id: 0,
                state: BufferState::Released,
            },
            StatusCode::InvalidBufferId => Error::InvalidBufferId(0),
            StatusCode::NullPointBuffer => Error::NullBuffer,
            StatusCode::UnexpectedMemoryType => Error::UnexpectedMemoryType {
                expected: crate::memory::MemoryType::Virtual,
                actual: crate::memory::MemoryType::Virtual,
            },
            StatusCode::NoFreeBuffer => Error::NoFreeBuffer,
            StatusCode::NoDirtyBuffer => Error::NoDirtyBuffer,
            StatusCode::OutOfRange => Error::OutOfRange(message),
            StatusCode::CreateBuffer => Error::CreateBuffer(message),
            StatusCode::WaitTimeout => Error::WaitTimeout,
            StatusCode::NoConsumerListener => Error::NoConsumerListener,
            StatusCode::QueueReleased => Error::QueueReleased,
            StatusCode::Unsupported => Error::Unsupported("remote operation"),
        }
    }
}
