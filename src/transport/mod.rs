//! Driving a producer across a process boundary.
//!
//! The queue itself never leaves its process. A remote producer talks to it
//! through a [`Transport`] carrying framed [`WireMessage`]s:
//!
//! ```text
//!  RemoteProducer ── QueueRequest ──► Transport ──► ProducerStub ──► Producer ──► queue
//!                 ◄── QueueReply ────
//!                 ◄── QueueEvent ──── (kanal channel, drained by dispatch_events)
//! ```
//!
//! A buffer is identified on the wire by its id. Its [`BufferDescriptor`]
//! is sent the first time the id crosses, and its contents travel with every
//! push and return. Listeners registered remotely are identified by a
//! listener id and invoked asynchronously on the proxy side.
//!
//! # Architecture
//!
//! - [`protocol`]: Opcodes, messages and length-prefixed rkyv framing
//! - [`ProducerStub`]: Executes requests against a local producer
//! - [`RemoteProducer`]: The proxy implementing producer operations remotely
//! - [`LoopbackTransport`]: In-process transport for tests and embedding

pub mod protocol;
mod proxy;
mod stub;

pub use protocol::{
    BufferDescriptor, BufferPayload, QueueEvent, QueueOpcode, QueueReply, QueueRequest,
    WireMessage, frame_message, unframe_message,
};
pub use proxy::{LoopbackTransport, RemoteProducer, Transport};
pub use stub::ProducerStub;
