// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

//! The embedded inode log of a segment file.
//!
//! Every inode mutation appends a full image of the inode into the log
//! region before the mutation becomes observable. Images are unit-aligned,
//! crc-framed and carry a sequence number; replay scans the whole region,
//! keeps the highest-sequence image per inode and ignores records whose
//! checksum does not match (torn tail).

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;

use bytes::{Buf, BufMut};
use tracing::warn;

use super::{BitmapAllocator, Extent, ExtentKind, Inode, InodeState, SuperBlock};
use crate::storage::options::CompressionType;
use crate::storage::{StorageResult, TracedStorageError};

const LOG_RECORD_MAGIC: u32 = 0x494e_4f44; // "INOD"
const LOG_HEADER_SIZE: usize = 4 + 4 + 4;

/// Allocation state and sequence counter of the log region.
pub struct SegmentLog {
    alloc: BitmapAllocator,
    next_seq: u64,
}

/// One parsed record location, used for compaction at open.
#[derive(Clone, Copy, Debug)]
pub struct LogRecordLoc {
    pub offset: u64,
    pub alloc_len: u64,
    pub seq: u64,
    pub inode_id: u64,
}

/// Result of scanning the log region.
pub struct LogReplay {
    /// Latest image per inode id.
    pub images: HashMap<u64, (Inode, LogRecordLoc)>,
    /// Every well-formed record found, including superseded ones.
    pub records: Vec<LogRecordLoc>,
    pub max_seq: u64,
}

impl SegmentLog {
    pub fn new(sb: &SuperBlock) -> Self {
        Self {
            alloc: BitmapAllocator::new(
                sb.log_start,
                sb.block_size,
                sb.log_len / sb.block_size as u64,
            ),
            next_seq: 1,
        }
    }

    pub fn with_seq(sb: &SuperBlock, next_seq: u64) -> Self {
        let mut log = Self::new(sb);
        log.next_seq = next_seq;
        log
    }

    /// Journal a new image of `inode`.
    ///
    /// Order matters for crash safety: allocate the new record first, write
    /// it, then free the previous image. Allocator exhaustion surfaces as
    /// `OutOfSpace` before any durable state changes.
    pub fn append_image(&mut self, file: &File, inode: &mut Inode) -> StorageResult<()> {
        let seq = self.next_seq;
        let body = encode_image(seq, inode);
        let mut record = Vec::with_capacity(LOG_HEADER_SIZE + body.len());
        record.put_u32(LOG_RECORD_MAGIC);
        record.put_u32(body.len() as u32);
        record.put_u32(crc32fast::hash(&body));
        record.put_slice(&body);

        let (offset, alloc_len) = self.alloc.allocate(record.len() as u64)?;
        file.write_all_at(&record, offset)
            .map_err(TracedStorageError::from)?;
        if let Some((old_off, old_len)) = inode.log_extent.take() {
            self.alloc.free(old_off, old_len)?;
        }
        inode.log_extent = Some((offset, alloc_len));
        self.next_seq = seq + 1;
        Ok(())
    }

    /// Re-mark a record span as allocated during replay.
    pub fn restore(&mut self, loc: &LogRecordLoc) {
        self.alloc.restore(loc.offset, loc.alloc_len);
    }

    /// Scan the whole log region at unit granularity.
    pub fn replay(file: &File, sb: &SuperBlock) -> StorageResult<LogReplay> {
        let unit = sb.block_size as u64;
        let mut images: HashMap<u64, (Inode, LogRecordLoc)> = HashMap::new();
        let mut records = Vec::new();
        let mut max_seq = 0u64;

        let mut offset = sb.log_start;
        let log_end = sb.log_start + sb.log_len;
        let mut header = [0u8; LOG_HEADER_SIZE];
        while offset < log_end {
            if file.read_exact_at(&mut header, offset).is_err() {
                // reading past the physical end of a sparse file
                break;
            }
            let mut buf = &header[..];
            let magic = buf.get_u32();
            if magic != LOG_RECORD_MAGIC {
                offset += unit;
                continue;
            }
            let body_len = buf.get_u32() as u64;
            let crc_expected = buf.get_u32();
            if body_len == 0 || offset + LOG_HEADER_SIZE as u64 + body_len > log_end {
                warn!(offset, body_len, "segment log record with bad length, skipping");
                offset += unit;
                continue;
            }
            let mut body = vec![0u8; body_len as usize];
            if file
                .read_exact_at(&mut body, offset + LOG_HEADER_SIZE as u64)
                .is_err()
            {
                break;
            }
            let crc_found = crc32fast::hash(&body);
            if crc_found != crc_expected {
                warn!(offset, "segment log record checksum mismatch, skipping");
                offset += unit;
                continue;
            }
            let record_len = LOG_HEADER_SIZE as u64 + body_len;
            let alloc_len = super::p2_roundup(record_len, unit);
            match decode_image(&body) {
                Some((seq, inode)) => {
                    let loc = LogRecordLoc {
                        offset,
                        alloc_len,
                        seq,
                        inode_id: inode.id,
                    };
                    records.push(loc);
                    max_seq = max_seq.max(seq);
                    match images.get(&inode.id) {
                        Some((_, prev)) if prev.seq >= seq => {}
                        _ => {
                            images.insert(inode.id, (inode, loc));
                        }
                    }
                }
                None => {
                    warn!(offset, "undecodable segment log record, skipping");
                }
            }
            offset += alloc_len;
        }

        Ok(LogReplay {
            images,
            records,
            max_seq,
        })
    }
}

fn encode_image(seq: u64, inode: &Inode) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_u64(seq);
    buf.put_u64(inode.id);
    buf.put_u8(inode.algo.as_u8());
    buf.put_u8(inode.state.as_u8());
    buf.put_u64(inode.size);
    buf.put_u64(inode.original_size);
    buf.put_u32(inode.extents.len() as u32);
    for extent in &inode.extents {
        buf.put_u8(extent.kind.as_u8());
        buf.put_u64(extent.offset);
        buf.put_u64(extent.length);
        buf.put_u64(extent.alloc_len);
    }
    buf
}

fn decode_image(mut buf: &[u8]) -> Option<(u64, Inode)> {
    let buf = &mut buf;
    if buf.remaining() < 8 + 8 + 1 + 1 + 8 + 8 + 4 {
        return None;
    }
    let seq = buf.get_u64();
    let id = buf.get_u64();
    let algo = CompressionType::from_u8(buf.get_u8())?;
    let state = InodeState::from_u8(buf.get_u8())?;
    let size = buf.get_u64();
    let original_size = buf.get_u64();
    let extent_count = buf.get_u32() as usize;
    let mut extents = super::ExtentList::new();
    for _ in 0..extent_count {
        if buf.remaining() < 1 + 8 + 8 + 8 {
            return None;
        }
        let kind = ExtentKind::from_u8(buf.get_u8())?;
        extents.push(Extent {
            kind,
            offset: buf.get_u64(),
            length: buf.get_u64(),
            alloc_len: buf.get_u64(),
        });
    }
    Some((
        seq,
        Inode {
            id,
            algo,
            state,
            size,
            original_size,
            extents,
            log_extent: None,
        },
    ))
}

/// Overwrite the magic of a stale record so it can never be replayed again.
pub(super) fn invalidate_record(file: &File, loc: &LogRecordLoc) -> StorageResult<()> {
    file.write_all_at(&[0u8; 4], loc.offset)
        .map_err(TracedStorageError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::segment::SEGMENT_BLOCK_SIZE;

    fn sample_superblock() -> SuperBlock {
        SuperBlock {
            version: super::super::SEGMENT_VERSION,
            block_size: SEGMENT_BLOCK_SIZE,
            log_start: SEGMENT_BLOCK_SIZE as u64,
            log_len: SEGMENT_BLOCK_SIZE as u64 * 16,
            data_start: SEGMENT_BLOCK_SIZE as u64 * 17,
            data_units: 16,
        }
    }

    fn sparse_file(len: u64) -> (tempfile::TempDir, File) {
        let dir = tempfile::TempDir::new().unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("seg"))
            .unwrap();
        file.set_len(len).unwrap();
        (dir, file)
    }

    fn sample_inode(id: u64) -> Inode {
        let mut inode = Inode::new(id, CompressionType::Lz4);
        inode.push_extent(
            Extent {
                kind: ExtentKind::Append,
                offset: 1 << 16,
                length: 100,
                alloc_len: 4096,
            },
            240,
        );
        inode
    }

    #[test]
    fn append_then_replay() {
        let sb = sample_superblock();
        let (_dir, file) = sparse_file(sb.data_start + sb.data_units * sb.block_size as u64);
        let mut log = SegmentLog::new(&sb);

        let mut a = sample_inode(1);
        let mut b = sample_inode(2);
        log.append_image(&file, &mut a).unwrap();
        log.append_image(&file, &mut b).unwrap();
        // a mutates again: new image supersedes the first
        a.push_extent(
            Extent {
                kind: ExtentKind::Append,
                offset: 1 << 17,
                length: 50,
                alloc_len: 4096,
            },
            80,
        );
        log.append_image(&file, &mut a).unwrap();

        let replay = SegmentLog::replay(&file, &sb).unwrap();
        assert_eq!(replay.max_seq, 3);
        let (restored_a, _) = &replay.images[&1];
        assert_eq!(restored_a.extents.len(), 2);
        assert_eq!(restored_a.size, 150);
        assert_eq!(restored_a.original_size, 320);
        let (restored_b, _) = &replay.images[&2];
        assert_eq!(restored_b.extents.len(), 1);
    }

    #[test]
    fn removal_image_wins() {
        let sb = sample_superblock();
        let (_dir, file) = sparse_file(sb.data_start + sb.data_units * sb.block_size as u64);
        let mut log = SegmentLog::new(&sb);
        let mut inode = sample_inode(7);
        log.append_image(&file, &mut inode).unwrap();
        inode.state = InodeState::Removed;
        log.append_image(&file, &mut inode).unwrap();

        let replay = SegmentLog::replay(&file, &sb).unwrap();
        assert_eq!(replay.images[&7].0.state, InodeState::Removed);
    }

    #[test]
    fn torn_record_is_skipped() {
        let sb = sample_superblock();
        let (_dir, file) = sparse_file(sb.data_start + sb.data_units * sb.block_size as u64);
        let mut log = SegmentLog::new(&sb);
        let mut a = sample_inode(1);
        let mut b = sample_inode(2);
        log.append_image(&file, &mut a).unwrap();
        log.append_image(&file, &mut b).unwrap();
        // corrupt one byte inside b's record body
        let (b_off, _) = b.log_extent.unwrap();
        file.write_all_at(&[0xff], b_off + LOG_HEADER_SIZE as u64 + 3)
            .unwrap();

        let replay = SegmentLog::replay(&file, &sb).unwrap();
        assert!(replay.images.contains_key(&1));
        assert!(!replay.images.contains_key(&2));
    }
}
