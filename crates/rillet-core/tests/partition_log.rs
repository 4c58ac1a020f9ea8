//! Partition log behaviour through the public API: ordering, rollover,
//! trimming, gaps, blocking reads and persistence.
//!
//! Run with: cargo test -p rillet-core --test partition_log -- --nocapture

mod common;

use anyhow::Result;
use common::*;
use rillet_core::storage::log_manager::SEGMENTS_DIR;
use rillet_core::storage::segment::{segment_dir_name, INDEX_ENTRY_SIZE, INDEX_FILE_NAME};
use rillet_core::{
    DiskSegmentFactory, FixedSizeSegmentationStrategy, FlushPolicy, MovingSegmentArchiver,
    PartitionInfo, PartitionLog, SegmentCountArchiveStrategy, SegmentationConfig,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::info;

const SHORT: Duration = Duration::from_millis(100);

#[tokio::test]
async fn test_append_order() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let log = open_partition(dir.path(), 1_000, 10);

    write_messages(&log, 0..250).await;

    let set = log.read(0, 250, SHORT).await?;
    assert_eq!(set.start_offset(), 0);
    assert_eq!(set.next_offset(), 250);
    for (offset, message) in set.iter_with_offsets() {
        assert_eq!(message.body().as_ref(), format!("message-{}", offset).as_bytes());
        assert_eq!(message.properties().get_long("seq"), Some(offset as i64));
    }

    log.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_rollover_boundary() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let log = open_partition(dir.path(), 10, 10);

    write_messages(&log, 0..11).await;

    let segments = log.dir().join(SEGMENTS_DIR);
    assert!(segments.join(segment_dir_name(10)).is_dir());
    assert_eq!(log.segment_base_offsets().await?, vec![0, 10]);

    let index = segments.join(segment_dir_name(0)).join(INDEX_FILE_NAME);
    let index_len = std::fs::metadata(index)?.len();
    assert_eq!(index_len, 10 * INDEX_ENTRY_SIZE as u64);

    log.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_trim_keeps_most_recent_segments() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let log = open_partition(dir.path(), 10, 3);

    // Six segments' worth: 0, 10, 20, 30, 40, 50
    write_messages(&log, 0..55).await;

    assert_eq!(log.segment_count().await?, 3);
    assert_eq!(log.segment_base_offsets().await?, vec![30, 40, 50]);
    assert_eq!(log.partition_info().await?, PartitionInfo { head: 30, tail: 55 });

    let segments = log.dir().join(SEGMENTS_DIR);
    for evicted in [0, 10, 20] {
        assert!(!segments.join(segment_dir_name(evicted)).exists());
    }

    // Trimmed data is skipped; the read restarts at the oldest segment
    let set = log.read(0, 5, SHORT).await?;
    assert_eq!(set.start_offset(), 30);
    assert_eq!(set.len(), 5);

    log.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_gap_handling() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let log = open_partition(dir.path(), 1_000_000, 10);

    write_messages(&log, 0..75).await;
    assert!(log.create_segment(100).await?);
    for i in 100..200 {
        assert_eq!(log.write(message(i)).await?, i);
    }

    let set = log.read(60, 100, SHORT).await?;
    assert_eq!(set.start_offset(), 60);
    assert_eq!(set.len(), 15);
    assert_eq!(set.next_offset(), 75);

    let set = log.read(set.next_offset() as i64, 100, SHORT).await?;
    assert_eq!(set.start_offset(), 100);
    assert_eq!(set.len(), 100);
    assert_eq!(
        set.get(0).map(|m| m.body().clone()),
        Some(bytes::Bytes::from("message-100"))
    );

    log.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_read_below_tail_does_not_wait() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let log = open_partition(dir.path(), 1_000_000, 10);

    write_messages(&log, 0..75).await;
    assert!(log.create_segment(100).await?);
    assert_eq!(log.partition_info().await?.tail, 100);

    // Lands in the gap before an empty pre-created segment
    let started = Instant::now();
    let set = timeout(Duration::from_secs(5), log.read(80, 10, Duration::from_secs(30))).await??;
    info!("Read below tail returned after {:?}", started.elapsed());

    assert!(set.is_empty());
    assert_eq!(set.start_offset(), 100);
    assert_eq!(set.next_offset(), 100);

    log.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_sequential_reader_sees_everything_once() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let log = open_partition(dir.path(), 1_000_000, 10);

    write_messages(&log, 0..75).await;
    log.create_segment(100).await?;
    for i in 100..200 {
        log.write(message(i)).await?;
    }

    let tail = log.partition_info().await?.tail;
    let mut next = 0;
    let mut seen = Vec::new();
    while next < tail {
        let set = log.read(next as i64, 40, SHORT).await?;
        seen.extend(set.iter_with_offsets().map(|(offset, _)| offset));
        next = set.next_offset();
    }

    let expected: Vec<u64> = (0..75).chain(100..200).collect();
    assert_eq!(seen, expected);

    log.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_blocking_read_times_out() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let log = open_partition(dir.path(), 100, 10);
    write_messages(&log, 0..5).await;

    let tail = log.partition_info().await?.tail;
    let started = Instant::now();
    let set = log.read(tail as i64, 10, SHORT).await?;
    let elapsed = started.elapsed();

    info!("Timed-out read returned after {:?}", elapsed);
    assert!(set.is_empty());
    assert_eq!(set.start_offset(), tail);
    assert!(elapsed >= Duration::from_millis(90));

    log.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_blocking_read_woken_by_write() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let log = Arc::new(open_partition(dir.path(), 100, 10));
    write_messages(&log, 0..5).await;

    let reader = {
        let log = log.clone();
        tokio::spawn(async move { log.read(5, 10, Duration::from_secs(30)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    log.write(message(5)).await?;

    let set = timeout(Duration::from_secs(5), reader).await???;
    assert_eq!(set.start_offset(), 5);
    assert_eq!(set.len(), 1);
    assert_eq!(set.get(0).unwrap().body().as_ref(), b"message-5");

    log.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_negative_offset_reads_from_start() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let log = open_partition(dir.path(), 100, 10);
    write_messages(&log, 0..3).await;

    let from_negative = log.read(-1, 10, SHORT).await?;
    let from_zero = log.read(0, 10, SHORT).await?;
    assert_eq!(from_negative, from_zero);
    assert_eq!(from_negative.start_offset(), 0);
    assert_eq!(from_negative.len(), 3);

    log.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_reopen_preserves_data() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    {
        let log = open_partition(dir.path(), 10, 10);
        write_messages(&log, 0..25).await;
        log.close().await?;
    }

    let log = open_partition(dir.path(), 10, 10);
    assert_eq!(log.partition_info().await?, PartitionInfo { head: 0, tail: 25 });
    assert_eq!(log.segment_count().await?, 3);

    let set = log.read(0, 100, SHORT).await?;
    assert_eq!(set.len(), 25);
    assert_eq!(set.get(24).unwrap().properties().get_long("seq"), Some(24));

    assert_eq!(log.write(message(25)).await?, 25);
    log.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_close_is_idempotent() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let log = Arc::new(open_partition(dir.path(), 100, 10));

    let waiter = {
        let log = log.clone();
        tokio::spawn(async move { log.closed().await })
    };

    log.close().await?;
    log.close().await?;
    timeout(Duration::from_secs(5), waiter).await??;

    assert!(log.write(message(0)).await.unwrap_err().is_closed());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_get_distinct_offsets() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let log = Arc::new(open_partition(dir.path(), 64, 100));

    let mut handles = Vec::new();
    for writer in 0..4u64 {
        let log = log.clone();
        handles.push(tokio::spawn(async move {
            let mut offsets = Vec::new();
            for i in 0..50 {
                offsets.push(log.write(message(writer * 1000 + i)).await.unwrap());
            }
            offsets
        }));
    }

    let mut offsets = Vec::new();
    for handle in handles {
        offsets.extend(handle.await?);
    }
    offsets.sort_unstable();
    assert_eq!(offsets, (0..200).collect::<Vec<u64>>());

    let set = log.read(0, 500, SHORT).await?;
    assert_eq!(set.len(), 200);

    log.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_archive_moves_selected_segments() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let archive_dir = dir.path().join("archive");
    let config = SegmentationConfig::new()
        .with_max_messages_per_segment(10)
        .with_max_segments_per_partition(100);

    let log = PartitionLog::open(
        dir.path().join("partition"),
        Arc::new(DiskSegmentFactory::new(FlushPolicy::Never)),
        Box::new(FixedSizeSegmentationStrategy::new(config)?),
        Box::new(SegmentCountArchiveStrategy::new(2)),
        Box::new(MovingSegmentArchiver::new(&archive_dir)),
    )?;

    write_messages(&log, 0..45).await;
    assert_eq!(log.segment_count().await?, 5);

    assert_eq!(log.archive().await?, 3);
    assert_eq!(log.segment_base_offsets().await?, vec![30, 40]);
    for base in [0, 10, 20] {
        assert!(archive_dir.join(segment_dir_name(base)).is_dir());
    }

    let set = log.read(0, 100, SHORT).await?;
    assert_eq!(set.start_offset(), 30);
    assert_eq!(set.len(), 15);

    log.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_quiesced_partition_rejects_io() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let log = open_partition(dir.path(), 100, 10);
    write_messages(&log, 0..2).await;

    log.set_writable(false).await?;
    log.set_readable(false).await?;
    assert!(log.dir().join("nowrite").exists());
    assert!(log.dir().join("noread").exists());

    assert!(log.write(message(2)).await.is_err());
    assert!(log.read(0, 10, SHORT).await.is_err());

    log.set_readable(true).await?;
    assert_eq!(log.read(0, 10, SHORT).await?.len(), 2);

    log.close().await?;
    Ok(())
}
