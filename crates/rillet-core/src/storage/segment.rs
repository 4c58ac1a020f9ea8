use crate::message::{Message, MessageSet};
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 4 bytes data-file position, 8 bytes write timestamp (epoch millis)
pub const INDEX_ENTRY_SIZE: usize = 12;
const FRAME_HEADER_SIZE: usize = 4;
const SEGMENT_DIR_WIDTH: usize = 19;

pub const INDEX_FILE_NAME: &str = "segment.idx";
pub const DATA_FILE_NAME: &str = "segment.dat";

/// Directory name of the segment starting at `base_offset`
pub fn segment_dir_name(base_offset: u64) -> String {
    format!("{:0width$}", base_offset, width = SEGMENT_DIR_WIDTH)
}

/// Parse a segment directory name back into its base offset
pub fn parse_segment_dir_name(name: &str) -> Option<u64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// When appended data is forced to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Leave flushing to the OS page cache
    Never,
    /// fsync after every append
    Always,
    /// fsync once `writes` appends or `interval` have accumulated, whichever first
    Every {
        writes: u32,
        #[serde(with = "crate::config::duration_millis")]
        interval: Duration,
    },
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::Every {
            writes: 1000,
            interval: Duration::from_secs(1),
        }
    }
}

impl FlushPolicy {
    pub fn validate(&self) -> Result<()> {
        if let Self::Every { writes: 0, .. } = self {
            return Err(Error::InvalidConfig(
                "flush policy must allow at least one write per flush".to_string(),
            ));
        }
        Ok(())
    }

    fn should_flush(&self, unflushed_writes: u32, since_last_flush: Duration) -> bool {
        match *self {
            Self::Never => false,
            Self::Always => true,
            Self::Every { writes, interval } => {
                unflushed_writes >= writes || since_last_flush >= interval
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexEntry {
    position: u32,
    timestamp: i64,
}

/// A bounded run of messages stored as a `segment.idx` / `segment.dat` pair
/// inside its own directory.
///
/// The message at local index `i` has absolute offset `base_offset + i`.
/// Every message gets one index entry, so the message count is always
/// `index file length / INDEX_ENTRY_SIZE`.
#[derive(Debug)]
pub struct Segment {
    base_offset: u64,
    dir: PathBuf,
    data_file: Option<File>,
    index_file: Option<File>,
    index: Vec<IndexEntry>,
    data_len: u64,
    flush_policy: FlushPolicy,
    unflushed_writes: u32,
    last_flush: Instant,
}

impl Segment {
    /// Open the segment stored in `dir`, creating the directory and both files
    /// when absent.
    pub fn open(dir: &Path, base_offset: u64, flush_policy: FlushPolicy) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let data_file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(dir.join(DATA_FILE_NAME))?;
        let index_file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(dir.join(INDEX_FILE_NAME))?;

        let index = Self::load_index(dir, &index_file)?;
        let data_len = data_file.metadata()?.len();

        debug!(
            "Opened segment {} with {} messages ({} data bytes)",
            base_offset,
            index.len(),
            data_len
        );

        Ok(Self {
            base_offset,
            dir: dir.to_path_buf(),
            data_file: Some(data_file),
            index_file: Some(index_file),
            index,
            data_len,
            flush_policy,
            unflushed_writes: 0,
            last_flush: Instant::now(),
        })
    }

    fn load_index(dir: &Path, file: &File) -> Result<Vec<IndexEntry>> {
        let len = file.metadata()?.len();
        let whole = len - len % INDEX_ENTRY_SIZE as u64;
        if whole != len {
            // Torn trailing record from an interrupted append
            warn!(
                "Truncating index {} from {} to {} bytes",
                dir.join(INDEX_FILE_NAME).display(),
                len,
                whole
            );
            file.set_len(whole)?;
        }
        if whole == 0 {
            return Ok(Vec::new());
        }

        // SAFETY: the index file is owned by this segment and only appended to
        // through `&mut self`; the map is dropped before this function returns.
        let mmap = unsafe { Mmap::map(file)? };
        let index = mmap[..whole as usize]
            .chunks_exact(INDEX_ENTRY_SIZE)
            .map(|record| {
                let mut position = [0u8; 4];
                let mut timestamp = [0u8; 8];
                position.copy_from_slice(&record[..4]);
                timestamp.copy_from_slice(&record[4..]);
                IndexEntry {
                    position: u32::from_be_bytes(position),
                    timestamp: i64::from_be_bytes(timestamp),
                }
            })
            .collect();
        Ok(index)
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Number of messages stored
    pub fn size(&self) -> u64 {
        self.index.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Bytes in the data file
    pub fn size_bytes(&self) -> u64 {
        self.data_len
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_closed(&self) -> bool {
        self.data_file.is_none()
    }

    /// Append one message, framed as `[len: u32][message]`, plus its index entry.
    pub fn append(&mut self, message: &Message) -> Result<()> {
        let (Some(data_file), Some(index_file)) = (self.data_file.as_mut(), self.index_file.as_mut())
        else {
            return Err(Error::Closed);
        };

        let position = u32::try_from(self.data_len).map_err(|_| {
            Error::SegmentFull(format!(
                "segment {} data file reached {} bytes",
                self.base_offset, self.data_len
            ))
        })?;

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + message.body().len() + 16);
        frame.put_u32(0);
        message.encode(&mut frame)?;
        let payload_len = u32::try_from(frame.len() - FRAME_HEADER_SIZE)
            .map_err(|_| Error::SegmentFull(format!("message of {} bytes", frame.len())))?;
        frame[..FRAME_HEADER_SIZE].copy_from_slice(&payload_len.to_be_bytes());

        if let Err(e) = data_file.write_all(&frame) {
            // A partial write may have landed; positions must follow the real length
            self.data_len = data_file.metadata().map(|m| m.len()).unwrap_or(self.data_len);
            return Err(e.into());
        }
        self.data_len += frame.len() as u64;

        let timestamp = chrono::Utc::now().timestamp_millis();
        let mut record = [0u8; INDEX_ENTRY_SIZE];
        record[..4].copy_from_slice(&position.to_be_bytes());
        record[4..].copy_from_slice(&timestamp.to_be_bytes());
        write_index_record(index_file, self.index.len(), &record)?;

        self.index.push(IndexEntry {
            position,
            timestamp,
        });

        self.unflushed_writes = self.unflushed_writes.saturating_add(1);
        if self
            .flush_policy
            .should_flush(self.unflushed_writes, self.last_flush.elapsed())
        {
            self.flush()?;
        }
        Ok(())
    }

    /// Force both files to disk regardless of the flush policy
    pub fn flush(&mut self) -> Result<()> {
        if let (Some(data_file), Some(index_file)) = (&self.data_file, &self.index_file) {
            data_file.sync_data()?;
            index_file.sync_data()?;
        }
        self.unflushed_writes = 0;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Read the message at segment-local index `local`.
    pub fn read_at(&self, local: u64) -> Result<Message> {
        let entry = self.entry(local)?;
        let mmap = self.map_data()?;
        decode_frame(&mmap, entry.position, self.base_offset + local)
    }

    /// Append up to `max_count` messages starting at local index `local_start`
    /// to `into`. Reading at or past the end is a no-op.
    pub fn read_range(&self, local_start: u64, max_count: u64, into: &mut MessageSet) -> Result<()> {
        let size = self.size();
        if local_start >= size || max_count == 0 {
            return Ok(());
        }
        debug_assert_eq!(into.next_offset(), self.base_offset + local_start);

        let end = size.min(local_start.saturating_add(max_count));
        let mmap = self.map_data()?;
        for local in local_start..end {
            let entry = self.index[local as usize];
            into.push(decode_frame(&mmap, entry.position, self.base_offset + local)?);
        }
        Ok(())
    }

    /// Write timestamp (epoch millis) of the message at local index `local`
    pub fn timestamp_at(&self, local: u64) -> Result<i64> {
        Ok(self.entry(local)?.timestamp)
    }

    /// Write timestamp of the newest message, if any
    pub fn last_timestamp(&self) -> Option<i64> {
        self.index.last().map(|e| e.timestamp)
    }

    /// Local index of the first message written at or after `timestamp`
    pub fn find_local_for_timestamp(&self, timestamp: i64) -> Option<u64> {
        self.index
            .iter()
            .position(|e| e.timestamp >= timestamp)
            .map(|i| i as u64)
    }

    fn entry(&self, local: u64) -> Result<IndexEntry> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        usize::try_from(local)
            .ok()
            .and_then(|i| self.index.get(i).copied())
            .ok_or(Error::OutOfRange {
                index: local,
                size: self.size(),
            })
    }

    fn map_data(&self) -> Result<Mmap> {
        let file = self.data_file.as_ref().ok_or(Error::Closed)?;
        // SAFETY: the data file is only appended to through `&mut self`, so it
        // cannot change while this shared borrow and the map are alive.
        Ok(unsafe { Mmap::map(file)? })
    }

    /// Flush and release the file handles. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let flushed = self.flush();
        self.data_file = None;
        self.index_file = None;
        flushed
    }

    /// Close the segment and remove its directory
    pub fn delete(mut self) -> Result<()> {
        if let Err(e) = self.close() {
            warn!("Failed to flush segment {} before delete: {}", self.base_offset, e);
        }
        fs::remove_dir_all(&self.dir)?;
        debug!("Deleted segment {} at {}", self.base_offset, self.dir.display());
        Ok(())
    }
}

/// Index file that can be cut back to its last whole record
trait IndexSink: Write {
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl IndexSink for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Append one index record. A failed write is rolled back to `committed`
/// records so later records stay aligned.
fn write_index_record<S: IndexSink>(
    sink: &mut S,
    committed: usize,
    record: &[u8; INDEX_ENTRY_SIZE],
) -> Result<()> {
    if let Err(e) = sink.write_all(record) {
        let len = (committed * INDEX_ENTRY_SIZE) as u64;
        if let Err(truncate) = sink.truncate(len) {
            warn!("Failed to truncate index to {} bytes: {}", len, truncate);
        }
        return Err(e.into());
    }
    Ok(())
}

fn decode_frame(data: &[u8], position: u32, offset: u64) -> Result<Message> {
    let start = position as usize;
    let header_end = start + FRAME_HEADER_SIZE;
    if header_end > data.len() {
        return Err(Error::CorruptState(format!(
            "frame header for offset {} at byte {} lies past end of data ({} bytes)",
            offset,
            start,
            data.len()
        )));
    }

    let mut len = [0u8; FRAME_HEADER_SIZE];
    len.copy_from_slice(&data[start..header_end]);
    let end = header_end + u32::from_be_bytes(len) as usize;
    if end > data.len() {
        return Err(Error::CorruptState(format!(
            "frame for offset {} ends at byte {} past end of data ({} bytes)",
            offset,
            end,
            data.len()
        )));
    }

    Message::from_bytes(&data[header_end..end])
}

/// Creates the segments of a partition log. The log is the only caller, so a
/// segment directory is never opened twice.
pub trait SegmentFactory: Send + Sync + std::fmt::Debug {
    fn open(&self, dir: &Path, base_offset: u64) -> Result<Segment>;
}

#[derive(Debug, Clone, Default)]
pub struct DiskSegmentFactory {
    flush_policy: FlushPolicy,
}

impl DiskSegmentFactory {
    pub fn new(flush_policy: FlushPolicy) -> Self {
        Self { flush_policy }
    }
}

impl SegmentFactory for DiskSegmentFactory {
    fn open(&self, dir: &Path, base_offset: u64) -> Result<Segment> {
        Segment::open(dir, base_offset, self.flush_policy)
    }
}
