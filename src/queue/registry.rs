//! Named queue ownership.

use super::{
    BufferQueue, BufferQueueCore, Consumer, Producer, QueueConfig, SurfaceBufferQueue,
    SurfaceProvider,
};
use crate::error::{Error, Result};
use crate::memory::MemoryAllocator;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Owner of every queue in a process, keyed by name.
///
/// Producers and consumers only hold weak references, so a queue lives
/// exactly as long as its registry entry. [`destroy`](Self::destroy) wakes
/// any blocked request and turns every outstanding façade call into
/// [`Error::QueueReleased`].
///
/// # Example
///
/// ```rust
/// use bufferqueue::queue::{QueueConfig, QueueRegistry};
///
/// let registry = QueueRegistry::new();
/// let consumer = registry.create(QueueConfig::new("decoder-out")).unwrap();
/// let producer = registry.producer("decoder-out").unwrap();
///
/// registry.destroy("decoder-out").unwrap();
/// assert!(!consumer.is_connected());
/// assert!(!producer.is_connected());
/// ```
#[derive(Default)]
pub struct QueueRegistry {
    queues: Mutex<HashMap<String, Arc<dyn BufferQueue>>>,
}

impl QueueRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a heap-backed queue and return its consumer.
    pub fn create(&self, config: QueueConfig) -> Result<Consumer> {
        let name = config.name.clone();
        let queue = BufferQueueCore::new(config)?;
        self.insert(name, queue)
    }

    /// Create a heap-backed queue drawing memory from `allocator`.
    pub fn create_with_allocator(
        &self,
        config: QueueConfig,
        allocator: Arc<dyn MemoryAllocator>,
    ) -> Result<Consumer> {
        let name = config.name.clone();
        let queue = BufferQueueCore::with_allocator(config, allocator)?;
        self.insert(name, queue)
    }

    /// Create a queue backed by a surface provider and return its consumer.
    pub fn create_surface(
        &self,
        config: QueueConfig,
        provider: Arc<dyn SurfaceProvider>,
    ) -> Result<Consumer> {
        let name = config.name.clone();
        let queue = SurfaceBufferQueue::new(config, provider)?;
        self.insert(name, queue)
    }

    fn insert(&self, name: String, queue: Arc<dyn BufferQueue>) -> Result<Consumer> {
        let mut queues = self.queues.lock();
        if queues.contains_key(&name) {
            return Err(Error::OutOfRange(format!("queue {} already exists", name)));
        }
        let consumer = Consumer::new(&queue);
        tracing::debug!(queue = %name, "queue registered");
        queues.insert(name, queue);
        Ok(consumer)
    }

    fn get(&self, name: &str) -> Result<Arc<dyn BufferQueue>> {
        self.queues
            .lock()
            .get(name)
            .cloned()
            .ok_or(Error::QueueReleased)
    }

    /// A producer for the named queue.
    pub fn producer(&self, name: &str) -> Result<Producer> {
        Ok(Producer::new(&self.get(name)?))
    }

    /// A consumer for the named queue.
    pub fn consumer(&self, name: &str) -> Result<Consumer> {
        Ok(Consumer::new(&self.get(name)?))
    }

    /// Close and drop the named queue.
    pub fn destroy(&self, name: &str) -> Result<()> {
        let queue = self
            .queues
            .lock()
            .remove(name)
            .ok_or(Error::QueueReleased)?;
        queue.close();
        tracing::debug!(queue = %name, "queue destroyed");
        Ok(())
    }

    /// Names of all registered queues.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered queues.
    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    /// Is the registry empty?
    pub fn is_empty(&self) -> bool {
        self.queues.lock().is_empty()
    }
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("queues", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BufferConfig;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_create_and_lookup() {
        let registry = QueueRegistry::new();
        registry.create(QueueConfig::new("a").with_metrics(false)).unwrap();
        registry.create(QueueConfig::new("b").with_metrics(false)).unwrap();
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.producer("a").unwrap().name().unwrap(), "a");
        assert_eq!(registry.consumer("missing").unwrap_err(), Error::QueueReleased);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = QueueRegistry::new();
        registry.create(QueueConfig::new("a").with_metrics(false)).unwrap();
        assert!(matches!(
            registry.create(QueueConfig::new("a").with_metrics(false)),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn test_invalid_config_not_registered() {
        let registry = QueueRegistry::new();
        assert!(registry.create(QueueConfig::new("big").with_queue_size(1000)).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_destroy_wakes_blocked_request() {
        let registry = QueueRegistry::new();
        let consumer = registry
            .create(QueueConfig::new("q").with_queue_size(0).with_metrics(false))
            .unwrap();
        let producer = consumer.producer();

        let queue = registry.get("q").unwrap();
        let waiter = thread::spawn(move || {
            queue.request_buffer(&BufferConfig::virtual_memory(8), Some(Duration::from_secs(5)))
        });
        thread::sleep(Duration::from_millis(30));
        registry.destroy("q").unwrap();

        assert_eq!(waiter.join().unwrap().unwrap_err(), Error::QueueReleased);
        assert!(!producer.is_connected());
        assert_eq!(consumer.acquire_buffer().unwrap_err(), Error::QueueReleased);
        assert_eq!(registry.destroy("q").unwrap_err(), Error::QueueReleased);
    }
}
