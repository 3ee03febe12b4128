//! Memory types and the memory block that backs a buffer.

use bytes::BytesMut;

/// Type of memory backing a buffer.
///
/// A queue accepts exactly one memory type over its lifetime: the first
/// buffer configuration it accepts fixes it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, rkyv::Archive, rkyv::Serialize,
    rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
#[repr(u8)]
pub enum MemoryType {
    /// Process-local heap memory.
    Virtual = 0,
    /// Shared memory that can be mapped by a peer process.
    Shared = 1,
    /// Graphics surface memory owned by an external provider.
    Surface = 2,
    /// Hardware (DMA-capable) memory.
    Hardware = 3,
}

impl MemoryType {
    /// Can this memory type be shared across processes on the same machine?
    #[inline]
    pub fn supports_ipc(&self) -> bool {
        match self {
            MemoryType::Virtual => false,
            MemoryType::Shared => true,
            MemoryType::Surface => true,
            MemoryType::Hardware => true,
        }
    }

    /// Is this a CPU-accessible memory type?
    #[inline]
    pub fn is_cpu_accessible(&self) -> bool {
        !matches!(self, MemoryType::Hardware)
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Virtual => write!(f, "virtual"),
            Self::Shared => write!(f, "shared"),
            Self::Surface => write!(f, "surface"),
            Self::Hardware => write!(f, "hardware"),
        }
    }
}

/// A block of memory owned by one buffer.
///
/// The block has a fixed `capacity` and a written `size`. The size starts at
/// zero; a producer sets it after writing so the queue can validate that a
/// pushed buffer actually carries data.
pub struct Memory {
    data: BytesMut,
    size: usize,
    memory_type: MemoryType,
}

impl Memory {
    /// Wrap zero-initialized storage of `capacity` bytes.
    ///
    /// Allocators and surface providers build their blocks with this.
    pub fn zeroed(capacity: usize, memory_type: MemoryType) -> Self {
        Self {
            data: BytesMut::zeroed(capacity),
            size: 0,
            memory_type,
        }
    }

    /// Total bytes available in this block.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of valid bytes written.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Memory type of this block.
    #[inline]
    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    /// Set the number of valid bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size > capacity()`.
    #[inline]
    pub fn set_size(&mut self, size: usize) {
        assert!(size <= self.capacity(), "size exceeds memory capacity");
        self.size = size;
    }

    /// Valid bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// The whole block, for writing.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Copy `bytes` to the start of the block and set the size accordingly.
    ///
    /// # Panics
    ///
    /// Panics if `bytes.len() > capacity()`.
    pub fn write(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.capacity(),
            "data ({} bytes) exceeds memory capacity ({} bytes)",
            bytes.len(),
            self.capacity()
        );
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.size = bytes.len();
    }

    /// Forget the written contents without touching the allocation.
    #[inline]
    pub(crate) fn reset(&mut self) {
        self.size = 0;
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("memory_type", &self.memory_type)
            .field("capacity", &self.capacity())
            .field("size", &self.size)
            .finish()
    }
}
