//! Partition log throughput benchmarks
//!
//! Run with: cargo bench --package rillet-core
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rillet_core::{FlushPolicy, Message, PartitionLog, SegmentationConfig, StorageConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Runtime;

fn open_log(dir: &TempDir) -> Arc<PartitionLog> {
    let config = StorageConfig::new()
        .with_data_dir(dir.path())
        .with_flush_policy(FlushPolicy::Never)
        .with_segmentation(
            SegmentationConfig::new()
                .with_max_messages_per_segment(10_000)
                .with_max_segments_per_partition(4),
        );
    Arc::new(PartitionLog::with_config(config.partition_dir("bench", 0), &config).unwrap())
}

fn create_test_message(size: usize) -> Message {
    Message::builder()
        .body(Bytes::from(vec![b'x'; size]))
        .property("source", "bench")
        .build()
}

fn bench_write(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("write");

    for size in [100, 1024, 16 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let log = open_log(&dir);

            b.to_async(&rt).iter(|| async {
                let _ = black_box(log.write(create_test_message(size)).await);
            });
        });
    }

    group.finish();
}

fn bench_write_batch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("write_batch");

    for batch_size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &size| {
                let dir = TempDir::new().unwrap();
                let log = open_log(&dir);

                b.to_async(&rt).iter(|| async {
                    let messages: Vec<Message> =
                        (0..size).map(|_| create_test_message(100)).collect();
                    let _ = black_box(log.write_batch(messages).await);
                });
            },
        );
    }

    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("read");

    let dir = TempDir::new().unwrap();
    let log = open_log(&dir);
    rt.block_on(async {
        let messages: Vec<Message> = (0..10_000).map(|_| create_test_message(256)).collect();
        log.write_batch(messages).await.unwrap();
    });

    for max in [1u32, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*max as u64));
        group.bench_with_input(BenchmarkId::from_parameter(max), max, |b, &max| {
            b.to_async(&rt).iter(|| async {
                let _ = black_box(log.read(0, max, Duration::ZERO).await);
            });
        });
    }

    group.finish();
}

fn bench_concurrent_writers(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("concurrent_writers");

    for writers in [2, 4, 8].iter() {
        group.throughput(Throughput::Elements(*writers as u64 * 100));
        group.bench_with_input(
            BenchmarkId::from_parameter(writers),
            writers,
            |b, &writers| {
                let dir = TempDir::new().unwrap();
                let log = open_log(&dir);

                b.to_async(&rt).iter(|| {
                    let log = log.clone();
                    async move {
                        let handles: Vec<_> = (0..writers)
                            .map(|_| {
                                let log = log.clone();
                                tokio::spawn(async move {
                                    for _ in 0..100 {
                                        let _ = log.write(create_test_message(100)).await;
                                    }
                                })
                            })
                            .collect();
                        for handle in handles {
                            let _ = handle.await;
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_write,
    bench_write_batch,
    bench_read,
    bench_concurrent_writers
);
criterion_main!(benches);
