//! # Bufferqueue
//!
//! A bounded pool of reusable media buffers shared between one producer and
//! one consumer.
//!
//! Producers request empty buffers, fill them and push them; consumers
//! acquire filled buffers in push order and release them for reuse. Buffers
//! are recycled through a capacity-ordered free list, so steady-state
//! streaming allocates nothing.
//!
//! ## Features
//!
//! - **Explicit buffer lifecycle**: every buffer follows a checked state machine
//! - **Best-fit reuse**: the smallest free buffer that fits is handed out first
//! - **Brokers**: filters can intercept pushed buffers before the consumer sees them
//! - **Live resizing**: shrinking defers deletion of buffers still in flight
//! - **Surface providers**: the same contract on top of external graphics buffers
//! - **Remote producers**: rkyv-framed protocol for driving a queue across processes
//!
//! ## Quick Start
//!
//! ```rust
//! use bufferqueue::prelude::*;
//! use std::time::Duration;
//!
//! let registry = QueueRegistry::new();
//! let consumer = registry.create(QueueConfig::new("video").with_queue_size(3))?;
//! let producer = consumer.producer();
//!
//! let buffer = producer.request_buffer(&BufferConfig::virtual_memory(4096), None)?;
//! buffer.write(b"frame data");
//! producer.push_buffer(&buffer, true)?;
//!
//! let filled = consumer.acquire_buffer()?;
//! filled.with_data(|data| assert_eq!(data, b"frame data"));
//! consumer.release_buffer(&filled)?;
//! # Ok::<(), bufferqueue::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod error;
pub mod memory;
pub mod metadata;
pub mod observability;
pub mod queue;
pub mod transport;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::Buffer;
    pub use crate::error::{Error, Result};
    pub use crate::memory::{HeapAllocator, MemoryAllocator, MemoryType};
    pub use crate::metadata::Metadata;
    pub use crate::queue::{
        BufferConfig, BufferQueue, BufferState, Consumer, Producer, QueueConfig, QueueRegistry,
    };
}

pub use error::{Error, Result};
