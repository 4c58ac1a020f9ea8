//! Storage core of the rillet message broker: segmented, disk-backed
//! partition logs with blocking reads, plus durable consumer cursors.

pub mod config;
pub mod cursor;
pub mod error;
pub mod message;
pub mod metrics;
pub mod partition;
pub mod storage;

pub use config::{RotationPolicy, SegmentationConfig, StorageConfig};
pub use cursor::{CursorSet, CursorSetManager, PartitionId};
pub use error::{Error, Result};
pub use message::{Message, MessageBuilder, MessageProperties, MessageSet, PropertyType, PropertyValue};
pub use partition::{LifecycleState, PartitionInfo, PartitionLog};
pub use storage::{
    ArchiveStrategy, CompositeArchiveStrategy, DeletingSegmentArchiver, DiskSegmentFactory,
    FixedSizeSegmentationStrategy, FlushPolicy, MovingSegmentArchiver, Segment,
    SegmentAgeArchiveStrategy, SegmentArchiver, SegmentCountArchiveStrategy, SegmentFactory,
    SegmentationStrategy,
};
