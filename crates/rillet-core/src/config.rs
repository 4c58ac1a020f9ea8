use crate::storage::FlushPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_MAX_MESSAGES_PER_SEGMENT: u32 = 1_000_000;
const DEFAULT_MAX_SEGMENTS_PER_PARTITION: u32 = 10;
const DEFAULT_MAX_SEGMENT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// What happens to segments pushed out by the retention limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RotationPolicy {
    /// Hand evicted segments to the configured archiver
    #[default]
    Archive,
}

/// Segmentation and retention limits for a single partition log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Messages per segment; segment base offsets are multiples of this
    pub max_messages_per_segment: u32,

    /// Resident segments kept per partition before the oldest are trimmed
    pub max_segments_per_partition: u32,

    /// Maximum segment age, used by age-based archive strategies
    #[serde(with = "duration_millis")]
    pub max_segment_ttl: Duration,

    pub rotation_policy: RotationPolicy,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            max_messages_per_segment: DEFAULT_MAX_MESSAGES_PER_SEGMENT,
            max_segments_per_partition: DEFAULT_MAX_SEGMENTS_PER_PARTITION,
            max_segment_ttl: DEFAULT_MAX_SEGMENT_TTL,
            rotation_policy: RotationPolicy::Archive,
        }
    }
}

impl SegmentationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_messages_per_segment(mut self, max: u32) -> Self {
        self.max_messages_per_segment = max;
        self
    }

    pub fn with_max_segments_per_partition(mut self, max: u32) -> Self {
        self.max_segments_per_partition = max;
        self
    }

    pub fn with_max_segment_ttl(mut self, ttl: Duration) -> Self {
        self.max_segment_ttl = ttl;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_messages_per_segment == 0 {
            return Err(Error::InvalidConfig(
                "max_messages_per_segment must be greater than zero".to_string(),
            ));
        }
        if self.max_segments_per_partition == 0 {
            return Err(Error::InvalidConfig(
                "max_segments_per_partition must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Storage configuration shared by the partitions of a broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory; partitions and cursor sets live below it
    pub data_dir: PathBuf,

    pub segmentation: SegmentationConfig,

    /// When segment writes are forced to disk
    pub flush_policy: FlushPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            segmentation: SegmentationConfig::default(),
            flush_policy: FlushPolicy::default(),
        }
    }
}

impl StorageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_segmentation(mut self, segmentation: SegmentationConfig) -> Self {
        self.segmentation = segmentation;
        self
    }

    pub fn with_flush_policy(mut self, flush_policy: FlushPolicy) -> Self {
        self.flush_policy = flush_policy;
        self
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.segmentation.validate()?;
        self.flush_policy.validate()
    }

    /// Directory holding the segments and flags of one partition
    pub fn partition_dir(&self, topic: &str, partition: u32) -> PathBuf {
        self.data_dir
            .join(topic)
            .join(format!("partition-{}", partition))
    }

    /// Directory holding the cursor sets of one topic
    pub fn cursor_dir(&self, topic: &str) -> PathBuf {
        self.data_dir.join(topic).join("cursors")
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
