pub mod archive;
pub mod flags;
pub mod log_manager;
pub mod segment;
pub mod strategy;

pub use archive::{
    ArchiveStrategy, CompositeArchiveStrategy, DeletingSegmentArchiver, MovingSegmentArchiver,
    SegmentAgeArchiveStrategy, SegmentArchiver, SegmentCountArchiveStrategy,
};
pub use flags::PartitionFlags;
pub use log_manager::LogManager;
pub use segment::{DiskSegmentFactory, FlushPolicy, Segment, SegmentFactory};
pub use strategy::{FixedSizeSegmentationStrategy, SegmentationStrategy};
