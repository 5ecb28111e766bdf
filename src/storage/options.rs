// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

use std::path::PathBuf;

use crate::compress::CompressAlgo;
use crate::storage::block::ChecksumType;

/// Options for [`StorageEngine`](super::StorageEngine).
#[derive(Clone)]
pub struct StorageOptions {
    /// Root directory of the storage instance.
    pub path: PathBuf,

    /// Fixed row capacity of every block, decided at table creation time.
    pub block_max_rows: u32,

    /// Number of blocks one segment may hold before appends roll over to the
    /// next segment.
    pub segment_max_blocks: u32,

    /// Compression codec applied to every column part.
    pub compression: CompressAlgo,

    /// Checksum guarding every block file's part directory.
    pub checksum_type: ChecksumType,

    /// Capacity of each shard command queue; `enqueue` fails fast with
    /// `QueueFull` beyond this.
    pub queue_capacity: usize,

    /// Whether to fsync block files and the metadata log on commit.
    pub enable_fsync: bool,
}

impl StorageOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_max_rows: 16384,
            segment_max_blocks: 16,
            compression: CompressAlgo::Lz4,
            checksum_type: ChecksumType::Crc32,
            queue_capacity: 1000,
            enable_fsync: true,
        }
    }

    pub fn default_for_test(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_max_rows: 10,
            segment_max_blocks: 4,
            compression: CompressAlgo::Lz4,
            checksum_type: ChecksumType::Crc32,
            queue_capacity: 64,
            enable_fsync: false,
        }
    }
}
