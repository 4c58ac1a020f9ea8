use super::archive::{ArchiveStrategy, SegmentArchiver};
use super::segment::{parse_segment_dir_name, segment_dir_name, Segment, SegmentFactory};
use super::strategy::SegmentationStrategy;
use crate::message::{Message, MessageSet};
use crate::metrics::CoreMetrics;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const SEGMENTS_DIR: &str = "segments";

/// Owns the segments of one partition, keyed by base offset (ascending), and
/// implements the write-point, rollover, trim and scan rules. Not
/// synchronized; the partition log serializes access.
#[derive(Debug)]
pub struct LogManager {
    segments_dir: PathBuf,
    segments: BTreeMap<u64, Segment>,
    current_base: u64,
    factory: Arc<dyn SegmentFactory>,
    segmentation: Box<dyn SegmentationStrategy>,
    archive_strategy: Box<dyn ArchiveStrategy>,
    archiver: Box<dyn SegmentArchiver>,
}

impl LogManager {
    /// Load every segment under `<dir>/segments`, bootstrapping an empty
    /// segment at offset 0 when there are none.
    pub fn open(
        dir: &Path,
        factory: Arc<dyn SegmentFactory>,
        segmentation: Box<dyn SegmentationStrategy>,
        archive_strategy: Box<dyn ArchiveStrategy>,
        archiver: Box<dyn SegmentArchiver>,
    ) -> Result<Self> {
        let segments_dir = dir.join(SEGMENTS_DIR);
        fs::create_dir_all(&segments_dir)?;

        let mut segments = BTreeMap::new();
        for entry in fs::read_dir(&segments_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            let Some(base_offset) = entry.file_name().to_str().and_then(parse_segment_dir_name)
            else {
                warn!("Skipping malformed segment directory {}", path.display());
                continue;
            };
            if segments.contains_key(&base_offset) {
                warn!(
                    "Skipping duplicate segment directory {} for base offset {}",
                    path.display(),
                    base_offset
                );
                continue;
            }
            segments.insert(base_offset, factory.open(&path, base_offset)?);
        }

        if segments.is_empty() {
            let segment = factory.open(&segments_dir.join(segment_dir_name(0)), 0)?;
            segments.insert(0, segment);
        }

        // Writes continue in the newest segment
        let current_base = segments.keys().next_back().copied().unwrap_or(0);

        info!(
            "Loaded {} segment(s) from {} (current base offset {})",
            segments.len(),
            segments_dir.display(),
            current_base
        );

        Ok(Self {
            segments_dir,
            segments,
            current_base,
            factory,
            segmentation,
            archive_strategy,
            archiver,
        })
    }

    /// Smallest resident base offset (oldest retained data)
    pub fn head(&self) -> u64 {
        self.segments.keys().next().copied().unwrap_or(0)
    }

    /// One past the last written offset: newest segment base plus its size
    pub fn tail(&self) -> u64 {
        self.segments
            .iter()
            .next_back()
            .map_or(0, |(base, segment)| base + segment.size())
    }

    pub fn current_base_offset(&self) -> u64 {
        self.current_base
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment_base_offsets(&self) -> Vec<u64> {
        self.segments.keys().copied().collect()
    }

    pub fn segments(&self) -> &BTreeMap<u64, Segment> {
        &self.segments
    }

    fn current_mut(&mut self) -> Result<&mut Segment> {
        let base = self.current_base;
        self.segments.get_mut(&base).ok_or_else(|| {
            Error::CorruptState(format!("current segment {} is not resident", base))
        })
    }

    /// Append a message at the write point, rolling to a new segment when the
    /// segmentation strategy maps the write point to a new bucket. Returns the
    /// offset assigned to the message.
    pub fn append(&mut self, message: &Message) -> Result<u64> {
        let write_point = self.current_base + self.current_mut()?.size();

        let mut target = self.segmentation.segment_base_offset_for(write_point);
        if target < write_point {
            target = self.current_base;
        }

        if target != self.current_base {
            if self.segments.contains_key(&target) {
                self.current_base = target;
            } else {
                self.roll(target)?;
            }
        }

        let current_base = self.current_base;
        let segment = self.current_mut()?;
        let offset = current_base + segment.size();
        segment.append(message)?;
        Ok(offset)
    }

    fn roll(&mut self, base_offset: u64) -> Result<()> {
        let segment = self
            .factory
            .open(&self.segments_dir.join(segment_dir_name(base_offset)), base_offset)?;
        self.segments.insert(base_offset, segment);
        let previous = std::mem::replace(&mut self.current_base, base_offset);

        info!("Rolled segment {} -> {}", previous, base_offset);
        CoreMetrics::increment_segments_rolled();

        self.trim()?;
        Ok(())
    }

    /// Delete the oldest segments until at most `max_segments` remain.
    /// The current write segment is never removed.
    pub fn trim(&mut self) -> Result<usize> {
        let max_segments = self.segmentation.max_segments();
        let mut evicted = 0;
        while self.segments.len() > max_segments {
            let Some((base, segment)) = self.segments.pop_first() else {
                break;
            };
            if base == self.current_base {
                self.segments.insert(base, segment);
                break;
            }
            if let Err(e) = segment.delete() {
                warn!("Failed to trim segment {}: {}", base, e);
                self.reopen_segment(base)?;
                return Err(e);
            }
            evicted += 1;
            info!("Trimmed segment {}", base);
        }
        if evicted > 0 {
            CoreMetrics::add_segments_evicted(evicted as u64);
        }
        Ok(evicted)
    }

    /// Run the pluggable archive strategy and hand each selected segment to
    /// the archiver. Returns the number of segments archived.
    pub fn archive(&mut self) -> Result<usize> {
        let selected = self.archive_strategy.select(&self.segments);
        let mut archived = 0;
        for base in selected {
            if base == self.current_base {
                continue;
            }
            let Some(segment) = self.segments.remove(&base) else {
                continue;
            };
            if let Err(e) = self.archiver.archive(segment) {
                warn!("Failed to archive segment {}: {}", base, e);
                self.reopen_segment(base)?;
                return Err(e);
            }
            archived += 1;
            info!("Archived segment {}", base);
        }
        if archived > 0 {
            CoreMetrics::add_segments_evicted(archived as u64);
        }
        Ok(archived)
    }

    /// Put a segment whose eviction failed back into the map, as long as its
    /// directory is still under `segments/`.
    fn reopen_segment(&mut self, base_offset: u64) -> Result<()> {
        let dir = self.segments_dir.join(segment_dir_name(base_offset));
        if dir.is_dir() {
            let segment = self.factory.open(&dir, base_offset)?;
            self.segments.insert(base_offset, segment);
        }
        Ok(())
    }

    /// Pre-create a segment at `base_offset`. A segment above the current
    /// write segment becomes the write segment. Returns false if it existed.
    pub fn create_segment(&mut self, base_offset: u64) -> Result<bool> {
        if self.segments.contains_key(&base_offset) {
            return Ok(false);
        }
        let segment = self
            .factory
            .open(&self.segments_dir.join(segment_dir_name(base_offset)), base_offset)?;
        self.segments.insert(base_offset, segment);
        if base_offset > self.current_base {
            self.current_base = base_offset;
        }
        info!("Created segment {}", base_offset);
        Ok(true)
    }

    /// Read up to `max_messages` starting at `offset` without blocking.
    ///
    /// Reads past the tail start at the tail. Reads continue across segment
    /// boundaries only while segments are contiguous; at a gap the result
    /// stops short and the caller continues from `next_offset`. A read that
    /// starts in a gap, or below the oldest segment, restarts at the next
    /// resident segment and reports that through `start_offset`.
    pub fn scan(&self, offset: u64, max_messages: u64) -> Result<MessageSet> {
        let start = offset.min(self.tail());
        let mut set = MessageSet::new(start);
        if max_messages == 0 {
            return Ok(set);
        }

        let first_base = match self.segments.range(..=start).next_back() {
            Some((base, _)) => *base,
            None => {
                let head = self.head();
                set.restart_at(head);
                head
            }
        };

        let mut segments = self.segments.range(first_base..);
        if let Some((base, segment)) = segments.next() {
            segment.read_range(set.start_offset() - base, max_messages, &mut set)?;
            if set.is_empty() {
                if let Some((next_base, next)) = segments.next() {
                    set.restart_at(*next_base);
                    next.read_range(0, max_messages, &mut set)?;
                }
            }
        }

        for (base, segment) in segments {
            let remaining = max_messages - set.len() as u64;
            if remaining == 0 || *base != set.next_offset() {
                break;
            }
            segment.read_range(0, remaining, &mut set)?;
        }

        debug!(
            "Scanned {} message(s) at {} (requested {})",
            set.len(),
            set.start_offset(),
            offset
        );
        Ok(set)
    }

    /// First offset whose write timestamp is at or after `timestamp` (epoch millis)
    pub fn find_offset_for_timestamp(&self, timestamp: i64) -> Option<u64> {
        self.segments
            .iter()
            .filter(|(_, segment)| segment.last_timestamp().is_some_and(|ts| ts >= timestamp))
            .find_map(|(base, segment)| {
                segment
                    .find_local_for_timestamp(timestamp)
                    .map(|local| base + local)
            })
    }

    pub fn flush(&mut self) -> Result<()> {
        for segment in self.segments.values_mut() {
            segment.flush()?;
        }
        Ok(())
    }

    /// Close every segment, reporting the first failure after attempting all
    pub fn close(&mut self) -> Result<()> {
        let mut first_error = None;
        for (base, segment) in self.segments.iter_mut() {
            if let Err(e) = segment.close() {
                warn!("Failed to close segment {}: {}", base, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
