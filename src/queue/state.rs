//! Per-buffer lifecycle state.

/// Where a buffer is in its lifecycle.
///
/// ```text
///            request            push              return
/// Released ──────────► Requested ────► Pushed ───────────► Returned
///    ▲                     │              │                    │
///    │        cancel       │              │ cancel             │ acquire
///    ├─────────────────────┴──────────────┘                    ▼
///    │                        release                      Acquired
///    └─────────────────────────────────────────────────────────┘
/// ```
///
/// `Attached` is an alternate entry point for buffers injected from outside
/// the pool. Removal from the queue is the terminal state; there is no
/// explicit "destroyed" variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferState {
    /// Sitting in the free list.
    #[default]
    Released,
    /// Handed to the producer for writing.
    Requested,
    /// Pushed by the producer, possibly held by a broker.
    Pushed,
    /// Filled and waiting in the dirty list.
    Returned,
    /// Handed to the consumer for reading.
    Acquired,
    /// Injected from outside the pool.
    Attached,
}

impl BufferState {
    /// Can a buffer in this state be pushed?
    #[inline]
    pub fn can_push(&self) -> bool {
        matches!(self, Self::Requested | Self::Attached)
    }

    /// Can a buffer in this state be returned as filled?
    #[inline]
    pub fn can_return(&self) -> bool {
        matches!(self, Self::Pushed)
    }

    /// Can a buffer in this state be released by the consumer?
    #[inline]
    pub fn can_release(&self) -> bool {
        matches!(self, Self::Acquired | Self::Attached)
    }

    /// Can a buffer in this state be detached without forcing?
    #[inline]
    pub fn can_detach(&self) -> bool {
        matches!(self, Self::Requested | Self::Acquired)
    }

    /// Is the buffer sitting in the free or dirty list in this state?
    #[inline]
    pub fn is_listed(&self) -> bool {
        matches!(self, Self::Released | Self::Returned)
    }
}

impl std::fmt::Display for BufferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Released => write!(f, "Released"),
            Self::Requested => write!(f, "Requested"),
            Self::Pushed => write!(f, "Pushed"),
            Self::Returned => write!(f, "Returned"),
            Self::Acquired => write!(f, "Acquired"),
            Self::Attached => write!(f, "Attached"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use BufferState::*;

        assert!(Requested.can_push());
        assert!(Attached.can_push());
        assert!(!Released.can_push());
        assert!(!Pushed.can_push());
        assert!(!Acquired.can_push());

        assert!(Pushed.can_return());
        assert!(!Requested.can_return());
        assert!(!Returned.can_return());

        assert!(Acquired.can_release());
        assert!(Attached.can_release());
        assert!(!Returned.can_release());
        assert!(!Released.can_release());
    }

    #[test]
    fn test_state_detach() {
        use BufferState::*;

        assert!(Requested.can_detach());
        assert!(Acquired.can_detach());
        assert!(!Pushed.can_detach());
        assert!(!Released.can_detach());
        assert!(!Attached.can_detach());
    }

    #[test]
    fn test_state_listed() {
        assert!(BufferState::Released.is_listed());
        assert!(BufferState::Returned.is_listed());
        assert!(!BufferState::Acquired.is_listed());
        assert_eq!(BufferState::default(), BufferState::Released);
    }
}
