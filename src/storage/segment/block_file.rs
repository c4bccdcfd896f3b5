// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use parking_lot::RwLock;

use super::{Extent, ExtentKind, Inode, InodeState, Segment};
use crate::storage::options::CompressionType;
use crate::storage::{StorageResult, TracedStorageError};

/// Typed writer/reader over one inode-backed stream.
///
/// An append compresses its payload with the inode's `algo`, allocates an
/// `Append` extent and journals the new inode image; an update writes the
/// new bytes verbatim and repairs the extent list. Readers walk the extent
/// list in order, so they see either the pre-update or the post-update
/// layout, never a mixture.
#[derive(Clone)]
pub struct BlockFile {
    segment: Segment,
    inode: Arc<RwLock<Inode>>,
}

impl BlockFile {
    pub(crate) fn new(segment: Segment, inode: Arc<RwLock<Inode>>) -> Self {
        Self { segment, inode }
    }

    pub fn inode_id(&self) -> u64 {
        self.inode.read().id
    }

    pub fn algo(&self) -> CompressionType {
        self.inode.read().algo
    }

    pub fn state(&self) -> InodeState {
        self.inode.read().state
    }

    pub fn is_resident(&self) -> bool {
        self.inode.read().is_resident()
    }

    /// Stored (compressed) size of the stream.
    pub fn size(&self) -> u64 {
        self.inode.read().size
    }

    /// Uncompressed payload size of the stream.
    pub fn original_size(&self) -> u64 {
        self.inode.read().original_size
    }

    /// Extent list and stored size at this instant, for tests and stats.
    pub fn snapshot_extents(&self) -> (Vec<Extent>, u64) {
        let inode = self.inode.read();
        (inode.extents.to_vec(), inode.size)
    }

    /// Append `data` to the stream.
    ///
    /// Compressed streams are sealed after their first append: a second
    /// chunk could not be decompressed independently at read time.
    pub fn append(&self, data: &[u8]) -> StorageResult<()> {
        let algo = {
            let inode = self.inode.read();
            if !inode.is_resident() {
                return Err(TracedStorageError::not_found("inode", inode.id));
            }
            if inode.algo != CompressionType::None && !inode.extents.is_empty() {
                return Err(TracedStorageError::invalid_input(
                    "compressed stream is sealed after one append",
                ));
            }
            inode.algo
        };
        let stored: Vec<u8> = match algo {
            CompressionType::None => data.to_vec(),
            CompressionType::Lz4 => lz4_flex::block::compress(data),
        };
        let (offset, alloc_len) = self.segment.allocate(stored.len() as u64)?;
        self.segment.write_all_at(&stored, offset)?;

        let mut guard = self.inode.write();
        let mut next = guard.clone();
        next.push_extent(
            Extent {
                kind: ExtentKind::Append,
                offset,
                length: stored.len() as u64,
                alloc_len,
            },
            data.len() as u64,
        );
        self.segment.journal(&mut next)?;
        *guard = next;
        Ok(())
    }

    /// Replace logical bytes `[offset, offset + replace_len)` with `data`.
    ///
    /// Only uncompressed streams may be updated in place; logical offsets
    /// into a compressed stream are not byte-addressable.
    pub fn update(&self, offset: u64, replace_len: u64, data: &[u8]) -> StorageResult<()> {
        {
            let inode = self.inode.read();
            if !inode.is_resident() {
                return Err(TracedStorageError::not_found("inode", inode.id));
            }
            if inode.algo != CompressionType::None {
                return Err(TracedStorageError::invalid_input(
                    "cannot update a compressed stream in place",
                ));
            }
        }
        let (phys_offset, alloc_len) = self.segment.allocate(data.len() as u64)?;
        self.segment.write_all_at(data, phys_offset)?;

        let mut guard = self.inode.write();
        let mut next = guard.clone();
        let freed = next.repair_extents(
            offset,
            replace_len,
            Extent {
                kind: ExtentKind::Update,
                offset: phys_offset,
                length: data.len() as u64,
                alloc_len,
            },
        )?;
        next.original_size = next.original_size - replace_len + data.len() as u64;
        self.segment.journal(&mut next)?;
        *guard = next;
        drop(guard);
        self.segment.free_ranges(&freed)?;
        Ok(())
    }

    /// Read the whole decompressed stream.
    pub fn read(&self) -> StorageResult<Vec<u8>> {
        let (algo, extents, size, original_size) = {
            let inode = self.inode.read();
            if !inode.is_resident() {
                return Err(TracedStorageError::not_found("inode", inode.id));
            }
            (
                inode.algo,
                inode.extents.clone(),
                inode.size,
                inode.original_size,
            )
        };
        let mut stored = Vec::with_capacity(size as usize);
        for extent in &extents {
            let start = stored.len();
            stored.resize(start + extent.length as usize, 0);
            self.segment
                .read_exact_at(&mut stored[start..], extent.offset)?;
        }
        match algo {
            CompressionType::None => Ok(stored),
            CompressionType::Lz4 => {
                lz4_flex::block::decompress(&stored, original_size as usize)
                    .map_err(|e| TracedStorageError::decode(format!("lz4: {}", e)))
            }
        }
    }

    /// Read the first `len` stored bytes of an uncompressed stream. Used by
    /// readers that only trust a committed prefix.
    pub fn read_prefix(&self, len: u64) -> StorageResult<Vec<u8>> {
        let (algo, extents) = {
            let inode = self.inode.read();
            if !inode.is_resident() {
                return Err(TracedStorageError::not_found("inode", inode.id));
            }
            (inode.algo, inode.extents.clone())
        };
        if algo != CompressionType::None {
            return Err(TracedStorageError::invalid_input(
                "prefix reads require an uncompressed stream",
            ));
        }
        let mut out = Vec::with_capacity(len as usize);
        let mut remaining = len;
        for extent in &extents {
            if remaining == 0 {
                break;
            }
            let take = extent.length.min(remaining);
            let start = out.len();
            out.resize(start + take as usize, 0);
            self.segment.read_exact_at(&mut out[start..], extent.offset)?;
            remaining -= take;
        }
        if remaining > 0 {
            return Err(TracedStorageError::invalid_input(format!(
                "prefix {} exceeds stream size",
                len
            )));
        }
        Ok(out)
    }

    /// Flip the inode to `Removed`, journal the tombstone, then free every
    /// data extent.
    pub fn remove(&self) -> StorageResult<()> {
        let freed: Vec<Extent> = {
            let mut guard = self.inode.write();
            if !guard.is_resident() {
                return Ok(());
            }
            let mut next = guard.clone();
            next.state = InodeState::Removed;
            self.segment.journal(&mut next)?;
            let extents = next.extents.to_vec();
            *guard = next;
            extents
        };
        for extent in freed {
            self.segment
                .free(extent.offset, extent.alloc_len.max(extent.length))?;
        }
        Ok(())
    }
}
