use crate::config::{RotationPolicy, SegmentationConfig};
use crate::Result;
use std::time::Duration;

/// Decides which segment an absolute offset belongs to and how many segments
/// a partition keeps.
pub trait SegmentationStrategy: Send + Sync + std::fmt::Debug {
    /// Base offset of the segment that should hold `offset`
    fn segment_base_offset_for(&self, offset: u64) -> u64;

    fn max_messages(&self) -> u64;

    fn max_segments(&self) -> usize;

    fn max_segment_ttl(&self) -> Duration;

    fn rotation_policy(&self) -> RotationPolicy;
}

/// Fixed-size offset buckets: segment `n` covers
/// `[n * max_messages, (n + 1) * max_messages)`.
#[derive(Debug, Clone)]
pub struct FixedSizeSegmentationStrategy {
    config: SegmentationConfig,
}

impl FixedSizeSegmentationStrategy {
    pub fn new(config: SegmentationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SegmentationConfig {
        &self.config
    }
}

impl SegmentationStrategy for FixedSizeSegmentationStrategy {
    fn segment_base_offset_for(&self, offset: u64) -> u64 {
        let bucket = self.max_messages();
        (offset / bucket) * bucket
    }

    fn max_messages(&self) -> u64 {
        u64::from(self.config.max_messages_per_segment)
    }

    fn max_segments(&self) -> usize {
        self.config.max_segments_per_partition as usize
    }

    fn max_segment_ttl(&self) -> Duration {
        self.config.max_segment_ttl
    }

    fn rotation_policy(&self) -> RotationPolicy {
        self.config.rotation_policy
    }
}
