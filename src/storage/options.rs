// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Compression codec applied to sealed column data. The per-inode `algo`
/// field is authoritative at read time, so segments written with different
/// settings coexist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionType {
    None,
    Lz4,
}

impl CompressionType {
    pub fn as_u8(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Lz4 => 1,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Lz4),
            _ => None,
        }
    }
}

/// Options for [`ColumnarStorage`](super::ColumnarStorage).
#[derive(Clone, Debug)]
pub struct StorageOptions {
    /// Root directory; segment files and the WAL live below it.
    pub path: PathBuf,
    /// Default rows-per-block cap applied to schemas that do not set one.
    pub block_max_rows: u32,
    /// Default blocks-per-segment cap applied to schemas that do not set one.
    pub segment_max_blocks: u16,
    pub compression: CompressionType,
    /// Capacity of the decoded-column block cache, in entries.
    pub cache_size: u64,
    /// Sync WAL appends on every commit. Turning this off trades durability
    /// of the last few commits for throughput.
    pub enable_fsync: bool,
    /// WAL file rotation threshold in bytes.
    pub wal_rotate_bytes: u64,
    /// Capacity of each segment file's data region, in allocator units.
    pub segment_data_units: u64,
}

impl StorageOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_max_rows: 8192,
            segment_max_blocks: 64,
            compression: CompressionType::Lz4,
            cache_size: 1024,
            enable_fsync: true,
            wal_rotate_bytes: 64 << 20,
            segment_data_units: 16 << 10,
        }
    }

    pub fn default_for_test(path: impl Into<PathBuf>) -> Self {
        Self {
            block_max_rows: 16,
            segment_max_blocks: 4,
            cache_size: 64,
            enable_fsync: false,
            wal_rotate_bytes: 1 << 20,
            segment_data_units: 1 << 10,
            ..Self::new(path)
        }
    }
}
