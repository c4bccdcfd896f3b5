// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

use bytes::{Buf, BufMut};

use crate::storage::{StorageResult, TracedStorageError};

pub const SEGMENT_MAGIC: &[u8; 8] = b"COLSTSEG";
pub const SEGMENT_VERSION: u32 = 1;

/// Encoded size of the superblock, excluding unit padding.
pub const SUPERBLOCK_SIZE: usize = 8 + 4 + 4 + 8 + 8 + 8 + 8 + 4;

/// The fixed header at offset 0 of every segment file.
///
/// All integers are big-endian; the trailing crc32 covers every preceding
/// byte. A corrupt superblock is fatal: the segment cannot be opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuperBlock {
    pub version: u32,
    /// Allocation unit in bytes, power of two.
    pub block_size: u32,
    /// Byte offset of the embedded log region.
    pub log_start: u64,
    /// Length of the embedded log region in bytes.
    pub log_len: u64,
    /// Byte offset of the data region.
    pub data_start: u64,
    /// Capacity of the data region in allocator units.
    pub data_units: u64,
}

impl SuperBlock {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SUPERBLOCK_SIZE);
        buf.put_slice(SEGMENT_MAGIC);
        buf.put_u32(self.version);
        buf.put_u32(self.block_size);
        buf.put_u64(self.log_start);
        buf.put_u64(self.log_len);
        buf.put_u64(self.data_start);
        buf.put_u64(self.data_units);
        let crc = crc32fast::hash(&buf);
        buf.put_u32(crc);
        buf
    }

    pub fn decode(data: &[u8]) -> StorageResult<Self> {
        if data.len() < SUPERBLOCK_SIZE {
            return Err(TracedStorageError::fatal("superblock truncated"));
        }
        let crc_found = (&data[SUPERBLOCK_SIZE - 4..]).get_u32();
        let crc_expected = crc32fast::hash(&data[..SUPERBLOCK_SIZE - 4]);
        if crc_found != crc_expected {
            return Err(TracedStorageError::fatal(format!(
                "superblock checksum mismatch: found {:#x}, expected {:#x}",
                crc_found, crc_expected
            )));
        }
        let mut buf = &data[..SUPERBLOCK_SIZE - 4];
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if &magic != SEGMENT_MAGIC {
            return Err(TracedStorageError::fatal("bad segment magic"));
        }
        let version = buf.get_u32();
        if version != SEGMENT_VERSION {
            return Err(TracedStorageError::fatal(format!(
                "unsupported segment version {}",
                version
            )));
        }
        let block_size = buf.get_u32();
        if !block_size.is_power_of_two() {
            return Err(TracedStorageError::fatal("segment block size not a power of two"));
        }
        Ok(Self {
            version,
            block_size,
            log_start: buf.get_u64(),
            log_len: buf.get_u64(),
            data_start: buf.get_u64(),
            data_units: buf.get_u64(),
        })
    }
}
