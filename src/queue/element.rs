//! Bookkeeping for one pooled buffer.

use super::{BufferConfig, BufferState};
use crate::buffer::Buffer;
use crate::observability::trace_transition;

/// A buffer owned by a queue plus the state the queue tracks for it.
pub(crate) struct BufferElement {
    /// The pooled buffer. Clones of this handle are what callers hold.
    pub buffer: Buffer,
    /// Declared configuration; `capacity` always reflects the real allocation.
    pub config: BufferConfig,
    /// Current lifecycle state.
    pub state: BufferState,
    /// Drop instead of relisting at the next push/return/release.
    pub pending_delete: bool,
}

impl BufferElement {
    pub fn new(buffer: Buffer, config: BufferConfig, state: BufferState) -> Self {
        Self {
            buffer,
            config,
            state,
            pending_delete: false,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.buffer.id()
    }

    pub fn set_state(&mut self, to: BufferState) {
        trace_transition(self.id(), self.state, to);
        self.state = to;
    }
}
