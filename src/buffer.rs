//! Buffer handles exchanged through a buffer queue.

use crate::memory::{Memory, MemoryType};
use crate::metadata::Metadata;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of process-wide unique buffer ids.
static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

fn next_buffer_id() -> u64 {
    NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)
}

/// A pooled media buffer.
///
/// `Buffer` is a handle: cloning it is cheap (just an Arc increment) and all
/// clones refer to the same memory and metadata. Which side may touch the
/// contents is decided by the owning queue's state machine, not by the type
/// system. A producer writes between `request` and `push`, a consumer reads
/// between `acquire` and `release`.
///
/// The id is assigned once at creation and never changes, so it can be used
/// to refer to the buffer across thread and process boundaries.
///
/// # Example
///
/// ```rust
/// use bufferqueue::buffer::Buffer;
/// use bufferqueue::memory::{HeapAllocator, MemoryAllocator, MemoryType};
///
/// let memory = HeapAllocator::new().allocate(1024, MemoryType::Virtual).unwrap();
/// let buffer = Buffer::new(memory);
/// buffer.write(b"frame");
/// assert_eq!(buffer.size(), 5);
/// assert_eq!(buffer.capacity(), 1024);
/// ```
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    id: u64,
    data: Mutex<BufferData>,
}

struct BufferData {
    memory: Memory,
    metadata: Metadata,
}

impl Buffer {
    /// Wrap a memory block in a new buffer with a fresh id.
    pub fn new(memory: Memory) -> Self {
        Self::with_id(next_buffer_id(), memory)
    }

    /// Wrap a memory block under an id that was assigned elsewhere.
    ///
    /// Used when mirroring a buffer that crossed a transport boundary.
    pub(crate) fn with_id(id: u64, memory: Memory) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                id,
                data: Mutex::new(BufferData {
                    memory,
                    metadata: Metadata::new(),
                }),
            }),
        }
    }

    /// Stable identifier of this buffer.
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Memory type of the backing block.
    pub fn memory_type(&self) -> MemoryType {
        self.inner.data.lock().memory.memory_type()
    }

    /// Total bytes the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.inner.data.lock().memory.capacity()
    }

    /// Number of valid bytes written.
    pub fn size(&self) -> usize {
        self.inner.data.lock().memory.size()
    }

    /// Set the number of valid bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size > capacity()`.
    pub fn set_size(&self, size: usize) {
        self.inner.data.lock().memory.set_size(size);
    }

    /// Copy `bytes` into the buffer, replacing its contents.
    ///
    /// # Panics
    ///
    /// Panics if `bytes.len() > capacity()`.
    pub fn write(&self, bytes: &[u8]) {
        self.inner.data.lock().memory.write(bytes);
    }

    /// Run `f` over the valid bytes.
    ///
    /// The buffer is locked for the duration of `f`; do not call back into
    /// the owning queue from inside it.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.inner.data.lock().memory.data())
    }

    /// Run `f` over the whole memory block, for in-place writes.
    pub fn with_memory_mut<R>(&self, f: impl FnOnce(&mut Memory) -> R) -> R {
        f(&mut self.inner.data.lock().memory)
    }

    /// Copy of the buffer's metadata.
    pub fn metadata(&self) -> Metadata {
        self.inner.data.lock().metadata.clone()
    }

    /// Replace the buffer's metadata.
    pub fn set_metadata(&self, metadata: Metadata) {
        self.inner.data.lock().metadata = metadata;
    }

    /// Modify the buffer's metadata in place.
    pub fn update_metadata<R>(&self, f: impl FnOnce(&mut Metadata) -> R) -> R {
        f(&mut self.inner.data.lock().metadata)
    }

    /// Does the buffer mark end of stream?
    pub fn is_eos(&self) -> bool {
        self.inner.data.lock().metadata.is_eos()
    }

    /// Do both handles refer to the same buffer?
    #[inline]
    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Forget written contents and metadata before the buffer is handed out again.
    pub(crate) fn reset(&self) {
        let mut data = self.inner.data.lock();
        data.memory.reset();
        data.metadata = Metadata::new();
    }

    /// Swap in a larger block, keeping the id.
    pub(crate) fn replace_memory(&self, memory: Memory) {
        let mut data = self.inner.data.lock();
        data.memory = memory;
        data.metadata = Metadata::new();
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.inner.data.lock();
        f.debug_struct("Buffer")
            .field("id", &self.inner.id)
            .field("memory", &data.memory)
            .field("eos", &data.metadata.is_eos())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HeapAllocator, MemoryAllocator};
    use std::time::Duration;

    fn heap_buffer(capacity: usize) -> Buffer {
        Buffer::new(HeapAllocator::new().allocate(capacity, MemoryType::Virtual).unwrap())
    }

    #[test]
    fn test_buffer_ids_are_unique() {
        let a = heap_buffer(16);
        let b = heap_buffer(16);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_buffer_clone_shares_contents() {
        let a = heap_buffer(16);
        let b = a.clone();
        a.write(b"abc");
        assert_eq!(b.size(), 3);
        assert!(a.ptr_eq(&b));
        b.with_data(|data| assert_eq!(data, b"abc"));
    }

    #[test]
    fn test_buffer_metadata() {
        let buf = heap_buffer(16);
        buf.update_metadata(|m| m.pts = Some(Duration::from_millis(40)));
        assert_eq!(buf.metadata().pts, Some(Duration::from_millis(40)));
        assert!(!buf.is_eos());

        buf.set_metadata(Metadata::new().with_eos());
        assert!(buf.is_eos());
    }

    #[test]
    fn test_buffer_reset() {
        let buf = heap_buffer(32);
        buf.write(b"payload");
        buf.set_metadata(Metadata::with_sequence(3));
        buf.reset();
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.metadata().sequence, 0);
        assert_eq!(buf.capacity(), 32);
    }

    #[test]
    fn test_buffer_replace_memory_keeps_id() {
        let buf = heap_buffer(8);
        let id = buf.id();
        buf.replace_memory(HeapAllocator::new().allocate(64, MemoryType::Virtual).unwrap());
        assert_eq!(buf.id(), id);
        assert_eq!(buf.capacity(), 64);
    }

    #[test]
    fn test_buffer_in_place_write() {
        let buf = heap_buffer(8);
        buf.with_memory_mut(|mem| {
            mem.data_mut()[..2].copy_from_slice(&[1, 2]);
            mem.set_size(2);
        });
        buf.with_data(|data| assert_eq!(data, &[1, 2]));
    }
}
