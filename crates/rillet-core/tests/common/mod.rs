#![allow(dead_code)]

use rillet_core::{FlushPolicy, Message, PartitionLog, SegmentationConfig, StorageConfig};
use std::path::Path;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rillet_core=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

pub fn storage_config(dir: &Path, max_messages: u32, max_segments: u32) -> StorageConfig {
    StorageConfig::new()
        .with_data_dir(dir)
        .with_flush_policy(FlushPolicy::Never)
        .with_segmentation(
            SegmentationConfig::new()
                .with_max_messages_per_segment(max_messages)
                .with_max_segments_per_partition(max_segments),
        )
}

pub fn open_partition(dir: &Path, max_messages: u32, max_segments: u32) -> PartitionLog {
    let config = storage_config(dir, max_messages, max_segments);
    PartitionLog::with_config(config.partition_dir("orders", 0), &config).unwrap()
}

pub fn message(i: u64) -> Message {
    Message::builder()
        .body(format!("message-{}", i))
        .property("seq", i as i64)
        .build()
}

pub async fn write_messages(log: &PartitionLog, range: std::ops::Range<u64>) {
    for i in range {
        log.write(message(i)).await.unwrap();
    }
}
