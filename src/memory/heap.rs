//! Heap-backed allocation.

use super::{Memory, MemoryType};
use crate::error::{Error, Result};

/// Source of memory blocks for a buffer queue.
///
/// The queue calls the allocator when it has no reusable free buffer or
/// when a reused buffer is too small for a request. Implementations must not
/// retry internally; a failure is reported straight to the requester.
pub trait MemoryAllocator: Send + Sync {
    /// Allocate a zero-initialized block of `capacity` bytes of `memory_type`.
    fn allocate(&self, capacity: usize, memory_type: MemoryType) -> Result<Memory>;
}

/// An allocator backed by the process heap.
///
/// # Example
///
/// ```rust
/// use bufferqueue::memory::{HeapAllocator, MemoryAllocator, MemoryType};
///
/// let allocator = HeapAllocator::new();
/// let memory = allocator.allocate(1024, MemoryType::Virtual).unwrap();
/// assert_eq!(memory.capacity(), 1024);
/// ```
///
/// Shared and hardware memory are emulated with heap storage; surface
/// memory can only come from a surface provider and is refused.
#[derive(Debug, Clone, Default)]
pub struct HeapAllocator {
    max_capacity: Option<usize>,
}

impl HeapAllocator {
    /// Create an allocator without a size limit.
    pub fn new() -> Self {
        Self { max_capacity: None }
    }

    /// Refuse allocations larger than `max` bytes.
    pub fn with_max_capacity(mut self, max: usize) -> Self {
        self.max_capacity = Some(max);
        self
    }
}

impl MemoryAllocator for HeapAllocator {
    fn allocate(&self, capacity: usize, memory_type: MemoryType) -> Result<Memory> {
        if memory_type == MemoryType::Surface {
            return Err(Error::CreateBuffer(
                "surface memory must come from a surface provider".into(),
            ));
        }
        if capacity == 0 {
            return Err(Error::CreateBuffer("capacity must be greater than 0".into()));
        }
        if let Some(max) = self.max_capacity {
            if capacity > max {
                return Err(Error::CreateBuffer(format!(
                    "capacity {} exceeds allocator limit {}",
                    capacity, max
                )));
            }
        }
        Ok(Memory::zeroed(capacity, memory_type))
    }
}
