//! Memory management for buffer payloads.
//!
//! # Architecture
//!
//! - [`MemoryType`]: What kind of memory backs a buffer
//! - [`Memory`]: A single block with a fixed capacity and a written size
//! - [`MemoryAllocator`]: Where the queue gets new blocks from
//!
//! # Example
//!
//! ```rust
//! use bufferqueue::memory::{HeapAllocator, MemoryAllocator, MemoryType};
//!
//! let allocator = HeapAllocator::new();
//! let mut memory = allocator.allocate(64, MemoryType::Virtual).unwrap();
//! memory.write(b"hello");
//! assert_eq!(memory.size(), 5);
//! ```

mod heap;
mod segment;

pub use heap::{HeapAllocator, MemoryAllocator};
pub use segment::{Memory, MemoryType};
