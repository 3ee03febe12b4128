//! Buffer and queue configuration.

use crate::error::{Error, Result};
use crate::memory::MemoryType;

/// Number of buffers a queue holds unless configured otherwise.
pub const DEFAULT_QUEUE_SIZE: u32 = 4;

/// Upper bound accepted by `set_queue_size`.
pub const MAX_QUEUE_SIZE: u32 = 64;

/// Declares what a buffer is for.
///
/// `size` is the number of valid bytes and may be `-1` while unknown (for
/// instance before a producer has written anything). `capacity` is the
/// allocation size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct BufferConfig {
    /// Valid bytes, `-1` when unknown.
    pub size: i64,
    /// Allocation size in bytes.
    pub capacity: i64,
    /// Memory type the buffer must be backed by.
    pub memory_type: MemoryType,
}

impl BufferConfig {
    /// A config asking for `capacity` bytes of `memory_type` memory.
    pub fn new(capacity: i64, memory_type: MemoryType) -> Self {
        Self {
            size: -1,
            capacity,
            memory_type,
        }
    }

    /// A config for process-local heap memory.
    pub fn virtual_memory(capacity: i64) -> Self {
        Self::new(capacity, MemoryType::Virtual)
    }

    /// Can a cached buffer described by `cached` satisfy this request as is?
    ///
    /// True when the memory types match and `cached` is at least as large.
    pub fn fits_within(&self, cached: &BufferConfig) -> bool {
        self.memory_type == cached.memory_type && cached.capacity >= self.capacity
    }

    /// Reject configs no allocator could satisfy.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.capacity <= 0 {
            return Err(Error::InvalidBufferSize(self.capacity));
        }
        Ok(())
    }

    /// Capacity as an allocation length.
    pub(crate) fn capacity_bytes(&self) -> usize {
        usize::try_from(self.capacity).unwrap_or(0)
    }
}

/// Configuration for a buffer queue.
///
/// # Example
///
/// ```rust
/// use bufferqueue::memory::MemoryType;
/// use bufferqueue::queue::QueueConfig;
///
/// let config = QueueConfig::new("decoder-output")
///     .with_queue_size(8)
///     .with_memory_type(MemoryType::Virtual);
/// assert_eq!(config.queue_size, 8);
/// ```
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Name used in logs and metrics.
    pub name: String,
    /// Maximum number of buffers the queue holds.
    pub queue_size: u32,
    /// Memory type fixed up front. When `None`, the first accepted buffer
    /// config decides.
    pub memory_type: Option<MemoryType>,
    /// Fail `return_buffer(.., true)` with `NoConsumerListener` when no
    /// consumer is listening, instead of queueing silently.
    pub require_consumer_listener: bool,
    /// Emit metrics for this queue.
    pub metrics: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "buffer-queue".to_string(),
            queue_size: DEFAULT_QUEUE_SIZE,
            memory_type: None,
            require_consumer_listener: false,
            metrics: true,
        }
    }
}

impl QueueConfig {
    /// Create a config with the given name and default limits.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the queue size.
    pub fn with_queue_size(mut self, size: u32) -> Self {
        self.queue_size = size;
        self
    }

    /// Fix the memory type up front.
    pub fn with_memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = Some(memory_type);
        self
    }

    /// Require a consumer listener for filled buffers.
    pub fn require_consumer_listener(mut self, required: bool) -> Self {
        self.require_consumer_listener = required;
        self
    }

    /// Enable or disable metrics.
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics = enabled;
        self
    }

    /// Check limits before a queue is built from this config.
    pub fn validate(&self) -> Result<()> {
        check_queue_size(self.queue_size)
    }
}

pub(crate) fn check_queue_size(size: u32) -> Result<()> {
    if size > MAX_QUEUE_SIZE {
        return Err(Error::OutOfRange(format!(
            "queue size {} exceeds maximum {}",
            size, MAX_QUEUE_SIZE
        )));
    }
    Ok(())
}
