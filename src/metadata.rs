//! Buffer metadata types.

use rkyv::{Archive, Deserialize, Serialize};
use std::time::Duration;

/// Flags indicating buffer properties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct BufferFlags {
    /// Buffer marks end of stream. An end-of-stream buffer may carry no data.
    pub eos: bool,
    /// Buffer contains a sync point (keyframe equivalent).
    pub sync_point: bool,
    /// Buffer is corrupted or incomplete.
    pub corrupted: bool,
    /// Buffer should not be displayed/processed (e.g., decode-only).
    pub decode_only: bool,
}

/// Metadata associated with a buffer.
///
/// The queue never interprets metadata beyond the end-of-stream flag; it is
/// carried for the benefit of producers, brokers and consumers (and of
/// predicates handed to `clear_buffer_if`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Metadata {
    /// Presentation timestamp (when this buffer should be processed/displayed).
    pub pts: Option<Duration>,

    /// Decode timestamp (when this buffer should be decoded).
    pub dts: Option<Duration>,

    /// Duration of this buffer's content.
    pub duration: Option<Duration>,

    /// Monotonic sequence number within a stream.
    pub sequence: u64,

    /// Buffer flags.
    pub flags: BufferFlags,
}

impl Metadata {
    /// Create new metadata with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create metadata with a sequence number.
    pub fn with_sequence(sequence: u64) -> Self {
        Self {
            sequence,
            ..Default::default()
        }
    }

    /// Set the presentation timestamp.
    pub fn with_pts(mut self, pts: Duration) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Set the decode timestamp.
    pub fn with_dts(mut self, dts: Duration) -> Self {
        self.dts = Some(dts);
        self
    }

    /// Set the duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Mark as end-of-stream.
    pub fn with_eos(mut self) -> Self {
        self.flags.eos = true;
        self
    }

    /// Is this the last buffer of the stream?
    #[inline]
    pub fn is_eos(&self) -> bool {
        self.flags.eos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_builder() {
        let meta = Metadata::with_sequence(42)
            .with_pts(Duration::from_millis(100))
            .with_dts(Duration::from_millis(90))
            .with_duration(Duration::from_millis(33));

        assert_eq!(meta.sequence, 42);
        assert_eq!(meta.pts, Some(Duration::from_millis(100)));
        assert_eq!(meta.dts, Some(Duration::from_millis(90)));
        assert_eq!(meta.duration, Some(Duration::from_millis(33)));
        assert!(!meta.is_eos());
    }

    #[test]
    fn test_metadata_eos() {
        let meta = Metadata::new().with_eos();
        assert!(meta.is_eos());
        assert!(meta.flags.eos);
    }
}
