//! Retention: which segments may be evicted ([`ArchiveStrategy`]) and what
//! eviction does to them ([`SegmentArchiver`]).
//!
//! Strategies are pure. They see the full segment map, ordered by base
//! offset, and return the base offsets they consider evictable. When only
//! some segments can go, the smallest base offsets (oldest data) go first.

use super::segment::{segment_dir_name, Segment};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

pub trait ArchiveStrategy: Send + Sync + Debug {
    /// Base offsets of the segments eligible for archival
    fn select(&self, segments: &BTreeMap<u64, Segment>) -> BTreeSet<u64>;
}

/// Keeps at most `max_segments`, selecting the oldest beyond that.
#[derive(Debug, Clone, Copy)]
pub struct SegmentCountArchiveStrategy {
    max_segments: usize,
}

impl SegmentCountArchiveStrategy {
    pub fn new(max_segments: usize) -> Self {
        Self { max_segments }
    }
}

impl ArchiveStrategy for SegmentCountArchiveStrategy {
    fn select(&self, segments: &BTreeMap<u64, Segment>) -> BTreeSet<u64> {
        let excess = segments.len().saturating_sub(self.max_segments);
        segments.keys().take(excess).copied().collect()
    }
}

/// Selects segments whose newest message is older than `max_age`.
/// Empty segments carry no timestamp and are never selected.
#[derive(Debug, Clone, Copy)]
pub struct SegmentAgeArchiveStrategy {
    max_age: Duration,
}

impl SegmentAgeArchiveStrategy {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }

    fn select_at(&self, segments: &BTreeMap<u64, Segment>, now_ms: i64) -> BTreeSet<u64> {
        let max_age_ms = i64::try_from(self.max_age.as_millis()).unwrap_or(i64::MAX);
        segments
            .iter()
            .filter(|(_, segment)| {
                segment
                    .last_timestamp()
                    .is_some_and(|ts| now_ms.saturating_sub(ts) >= max_age_ms)
            })
            .map(|(base, _)| *base)
            .collect()
    }
}

impl ArchiveStrategy for SegmentAgeArchiveStrategy {
    fn select(&self, segments: &BTreeMap<u64, Segment>) -> BTreeSet<u64> {
        self.select_at(segments, chrono::Utc::now().timestamp_millis())
    }
}

/// Union of the selections of several strategies
#[derive(Debug, Default)]
pub struct CompositeArchiveStrategy {
    strategies: Vec<Box<dyn ArchiveStrategy>>,
}

impl CompositeArchiveStrategy {
    pub fn new(strategies: Vec<Box<dyn ArchiveStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn with(mut self, strategy: impl ArchiveStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }
}

impl ArchiveStrategy for CompositeArchiveStrategy {
    fn select(&self, segments: &BTreeMap<u64, Segment>) -> BTreeSet<u64> {
        self.strategies
            .iter()
            .flat_map(|strategy| strategy.select(segments))
            .collect()
    }
}

/// Performs the physical eviction of a segment removed from a partition log
pub trait SegmentArchiver: Send + Sync + Debug {
    fn archive(&self, segment: Segment) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeletingSegmentArchiver;

impl SegmentArchiver for DeletingSegmentArchiver {
    fn archive(&self, segment: Segment) -> Result<()> {
        segment.delete()
    }
}

/// Moves evicted segment directories under `archive_dir` instead of deleting them
#[derive(Debug, Clone)]
pub struct MovingSegmentArchiver {
    archive_dir: PathBuf,
}

impl MovingSegmentArchiver {
    pub fn new(archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
        }
    }

    pub fn archive_dir(&self) -> &std::path::Path {
        &self.archive_dir
    }
}

impl SegmentArchiver for MovingSegmentArchiver {
    fn archive(&self, mut segment: Segment) -> Result<()> {
        fs::create_dir_all(&self.archive_dir)?;
        let target = self.archive_dir.join(segment_dir_name(segment.base_offset()));
        if target.exists() {
            return Err(Error::Other(format!(
                "archive target {} already exists",
                target.display()
            )));
        }

        segment.close()?;
        fs::rename(segment.dir(), &target)?;
        info!(
            "Archived segment {} to {}",
            segment.base_offset(),
            target.display()
        );
        Ok(())
    }
}
