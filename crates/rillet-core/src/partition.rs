use crate::config::StorageConfig;
use crate::message::{Message, MessageSet};
use crate::metrics::{CoreMetrics, Timer};
use crate::storage::{
    ArchiveStrategy, CompositeArchiveStrategy, DeletingSegmentArchiver, DiskSegmentFactory,
    FixedSizeSegmentationStrategy, LogManager, PartitionFlags, SegmentAgeArchiveStrategy,
    SegmentArchiver, SegmentCountArchiveStrategy, SegmentFactory, SegmentationStrategy,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, RwLock};
use tracing::{debug, info, warn};

/// Boundaries of a partition log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// Base offset of the oldest resident segment
    pub head: u64,
    /// Offset the next write will receive
    pub tail: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Open,
    Closing,
    Closed,
}

/// A read that found no data and waits for a write, a timeout or close
#[derive(Debug)]
struct PendingRead {
    offset: u64,
    max_messages: u64,
    /// Returned unchanged when the read times out
    on_timeout: MessageSet,
    reply: oneshot::Sender<Result<MessageSet>>,
}

#[derive(Debug)]
struct PartitionState {
    log: LogManager,
    flags: PartitionFlags,
    pending: HashMap<u64, PendingRead>,
    lifecycle: LifecycleState,
}

impl PartitionState {
    fn check_open(&self) -> Result<()> {
        match self.lifecycle {
            LifecycleState::Open => Ok(()),
            LifecycleState::Closing | LifecycleState::Closed => Err(Error::Closed),
        }
    }

    fn check_readable(&self) -> Result<()> {
        self.check_open()?;
        if !self.flags.readable() {
            return Err(Error::NotReadable);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if !self.flags.writable() {
            return Err(Error::NotWritable);
        }
        Ok(())
    }

    /// Re-run every parked read; reads that still find nothing stay parked.
    fn fulfill_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        for (id, read) in std::mem::take(&mut self.pending) {
            if read.reply.is_closed() {
                continue;
            }
            match self.log.scan(read.offset, read.max_messages) {
                Ok(set) if set.is_empty() => {
                    self.pending.insert(id, read);
                }
                Ok(set) => {
                    debug!(
                        "Fulfilled parked read {} with {} message(s) at {}",
                        id,
                        set.len(),
                        set.start_offset()
                    );
                    CoreMetrics::add_messages_read(set.len() as u64);
                    let _ = read.reply.send(Ok(set));
                }
                Err(e) => {
                    let _ = read.reply.send(Err(e));
                }
            }
        }
        CoreMetrics::set_pending_reads(self.pending.len() as u64);
    }

    /// Complete every parked read with whatever is available now
    fn drain_pending(&mut self) {
        for (_, read) in std::mem::take(&mut self.pending) {
            let set = match self.log.scan(read.offset, read.max_messages) {
                Ok(set) => set,
                Err(e) => {
                    warn!("Scan for parked read at {} failed on close: {}", read.offset, e);
                    read.on_timeout
                }
            };
            let _ = read.reply.send(Ok(set));
        }
        CoreMetrics::set_pending_reads(0);
    }
}

/// An append-only, offset-addressed message log for one partition, stored as
/// a run of segments below `<dir>/segments`.
///
/// A single lock guards the segment map and the parked reads. Writers hold it
/// exclusively for the whole append, rollover, trim and wake-up sequence,
/// so offsets are assigned strictly in append order. Readers scan under the
/// shared lock and only take the exclusive lock to park.
#[derive(Debug)]
pub struct PartitionLog {
    dir: PathBuf,
    state: RwLock<PartitionState>,
    next_request_id: AtomicU64,
    closed_tx: watch::Sender<bool>,
}

impl PartitionLog {
    /// Open (or create) the partition log stored in `dir`
    pub fn open(
        dir: impl Into<PathBuf>,
        factory: Arc<dyn SegmentFactory>,
        segmentation: Box<dyn SegmentationStrategy>,
        archive_strategy: Box<dyn ArchiveStrategy>,
        archiver: Box<dyn SegmentArchiver>,
    ) -> Result<Self> {
        let dir = dir.into();
        let log = LogManager::open(&dir, factory, segmentation, archive_strategy, archiver)?;
        let flags = PartitionFlags::load(&dir);

        info!(
            "Opened partition log {} (head {}, tail {}, readable {}, writable {})",
            dir.display(),
            log.head(),
            log.tail(),
            flags.readable(),
            flags.writable()
        );

        let (closed_tx, _) = watch::channel(false);
        Ok(Self {
            dir,
            state: RwLock::new(PartitionState {
                log,
                flags,
                pending: HashMap::new(),
                lifecycle: LifecycleState::Open,
            }),
            next_request_id: AtomicU64::new(0),
            closed_tx,
        })
    }

    /// Open with on-disk segments and fixed-size segmentation. `archive()`
    /// deletes segments beyond the count limit or older than the segment TTL,
    /// both taken from `config`.
    pub fn with_config(dir: impl Into<PathBuf>, config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        let segmentation = FixedSizeSegmentationStrategy::new(config.segmentation.clone())?;
        let archive_strategy = CompositeArchiveStrategy::default()
            .with(SegmentCountArchiveStrategy::new(segmentation.max_segments()))
            .with(SegmentAgeArchiveStrategy::new(
                config.segmentation.max_segment_ttl,
            ));
        Self::open(
            dir,
            Arc::new(DiskSegmentFactory::new(config.flush_policy)),
            Box::new(segmentation),
            Box::new(archive_strategy),
            Box::new(DeletingSegmentArchiver),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append a message and return its offset
    pub async fn write(&self, message: Message) -> Result<u64> {
        let timer = Timer::new();
        let mut state = self.state.write().await;
        state.check_writable()?;

        let offset = state.log.append(&message)?;
        state.fulfill_pending();
        drop(state);

        CoreMetrics::add_messages_appended(1);
        CoreMetrics::record_append_latency_us(timer.elapsed_us());
        debug!("Appended message at offset {} to {}", offset, self.dir.display());

        Ok(offset)
    }

    /// Append several messages under one lock hold, waking parked reads once.
    /// Returns the offset of the first message, or the tail for an empty batch.
    pub async fn write_batch(&self, messages: Vec<Message>) -> Result<u64> {
        let timer = Timer::new();
        let mut state = self.state.write().await;
        state.check_writable()?;

        let count = messages.len();
        let mut first = state.log.tail();
        let mut appended = 0;
        for message in &messages {
            match state.log.append(message) {
                Ok(offset) => {
                    if appended == 0 {
                        first = offset;
                    }
                    appended += 1;
                }
                Err(e) => {
                    state.fulfill_pending();
                    CoreMetrics::add_messages_appended(appended);
                    return Err(e);
                }
            }
        }
        state.fulfill_pending();
        drop(state);

        CoreMetrics::add_messages_appended(appended);
        CoreMetrics::record_append_latency_us(timer.elapsed_us());
        debug!(
            "Appended batch of {} message(s) at offset {} to {}",
            count,
            first,
            self.dir.display()
        );

        Ok(first)
    }

    /// Read up to `max_messages` starting at `offset`.
    ///
    /// Negative offsets read from 0. When nothing is available the read waits
    /// up to `timeout` for a write; a timeout is not an error and yields an
    /// empty set starting at the tail.
    pub async fn read(&self, offset: i64, max_messages: u32, timeout: Duration) -> Result<MessageSet> {
        let timer = Timer::new();
        let offset = u64::try_from(offset).unwrap_or(0);
        let max_messages = u64::from(max_messages);

        {
            let state = self.state.read().await;
            state.check_readable()?;
            let set = state.log.scan(offset, max_messages)?;
            if !set.is_empty() || max_messages == 0 {
                CoreMetrics::add_messages_read(set.len() as u64);
                CoreMetrics::record_read_latency_us(timer.elapsed_us());
                return Ok(set);
            }
        }

        let (id, mut rx) = {
            let mut state = self.state.write().await;
            state.check_readable()?;

            // A write may have landed between the two lock acquisitions.
            // Only reads at the tail wait; below it the caller moves on from
            // `next_offset`.
            let set = state.log.scan(offset, max_messages)?;
            if !set.is_empty() || offset < state.log.tail() {
                CoreMetrics::add_messages_read(set.len() as u64);
                CoreMetrics::record_read_latency_us(timer.elapsed_us());
                return Ok(set);
            }

            // Callers that gave up before their timeout leave closed senders
            state.pending.retain(|_, read| !read.reply.is_closed());

            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            state.pending.insert(
                id,
                PendingRead {
                    offset,
                    max_messages,
                    on_timeout: set,
                    reply: tx,
                },
            );
            CoreMetrics::increment_reads_parked();
            CoreMetrics::set_pending_reads(state.pending.len() as u64);
            debug!("Parked read {} at offset {} for {:?}", id, offset, timeout);
            (id, rx)
        };

        tokio::select! {
            reply = &mut rx => reply.map_err(|_| Error::Closed)?,
            _ = tokio::time::sleep(timeout) => {
                let mut state = self.state.write().await;
                match state.pending.remove(&id) {
                    Some(read) => {
                        CoreMetrics::set_pending_reads(state.pending.len() as u64);
                        drop(state);
                        CoreMetrics::increment_reads_timed_out();
                        debug!("Parked read {} timed out", id);
                        Ok(read.on_timeout)
                    }
                    // Fulfilled while the timer fired; the reply is already sent
                    None => {
                        drop(state);
                        rx.await.map_err(|_| Error::Closed)?
                    }
                }
            }
        }
    }

    pub async fn partition_info(&self) -> Result<PartitionInfo> {
        let state = self.state.read().await;
        state.check_open()?;
        Ok(PartitionInfo {
            head: state.log.head(),
            tail: state.log.tail(),
        })
    }

    pub async fn segment_count(&self) -> Result<usize> {
        let state = self.state.read().await;
        state.check_open()?;
        Ok(state.log.segment_count())
    }

    pub async fn segment_base_offsets(&self) -> Result<Vec<u64>> {
        let state = self.state.read().await;
        state.check_open()?;
        Ok(state.log.segment_base_offsets())
    }

    pub async fn readable(&self) -> Result<bool> {
        let state = self.state.read().await;
        state.check_open()?;
        Ok(state.flags.readable())
    }

    pub async fn writable(&self) -> Result<bool> {
        let state = self.state.read().await;
        state.check_open()?;
        Ok(state.flags.writable())
    }

    pub async fn set_readable(&self, readable: bool) -> Result<()> {
        let mut state = self.state.write().await;
        state.check_open()?;
        state.flags.set_readable(readable)?;
        info!("Partition {} readable: {}", self.dir.display(), readable);
        Ok(())
    }

    pub async fn set_writable(&self, writable: bool) -> Result<()> {
        let mut state = self.state.write().await;
        state.check_open()?;
        state.flags.set_writable(writable)?;
        info!("Partition {} writable: {}", self.dir.display(), writable);
        Ok(())
    }

    /// Pre-create an empty segment at `base_offset`, leaving a gap when it
    /// lies beyond the tail. Returns false if the segment already existed.
    pub async fn create_segment(&self, base_offset: u64) -> Result<bool> {
        let mut state = self.state.write().await;
        state.check_writable()?;
        state.log.create_segment(base_offset)
    }

    /// Evict the segments selected by the configured archive strategy
    pub async fn archive(&self) -> Result<usize> {
        let mut state = self.state.write().await;
        state.check_open()?;
        state.log.archive()
    }

    /// First offset written at or after `timestamp` (epoch millis)
    pub async fn find_offset_for_timestamp(&self, timestamp: i64) -> Result<Option<u64>> {
        let state = self.state.read().await;
        state.check_open()?;
        Ok(state.log.find_offset_for_timestamp(timestamp))
    }

    /// Force every resident segment to disk
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.check_open()?;
        state.log.flush()
    }

    pub async fn lifecycle(&self) -> LifecycleState {
        self.state.read().await.lifecycle
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Close the log. Parked reads complete with the data available now.
    /// Closing an already closed log is a no-op.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.lifecycle != LifecycleState::Open {
            return Ok(());
        }
        state.lifecycle = LifecycleState::Closing;

        state.drain_pending();
        let result = state.log.close();

        state.lifecycle = LifecycleState::Closed;
        drop(state);
        self.closed_tx.send_replace(true);

        info!("Closed partition log {}", self.dir.display());
        result
    }

    /// Resolves once the log has been closed
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        // The sender lives as long as self, so this only returns once closed
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
