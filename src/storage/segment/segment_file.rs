// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::{
    invalidate_record, BitmapAllocator, BlockFile, FreedRange, Inode, SegmentLog, SuperBlock,
    SEGMENT_BLOCK_SIZE, SEGMENT_VERSION,
};
use crate::storage::options::CompressionType;
use crate::storage::{StorageResult, TracedStorageError};

/// Identifier of a segment within its table.
pub type SegmentId = u32;

struct SegmentState {
    data_alloc: BitmapAllocator,
    log: SegmentLog,
}

pub(crate) struct SegmentCore {
    id: SegmentId,
    path: PathBuf,
    file: File,
    super_block: SuperBlock,
    /// Set after the first I/O failure; the segment stays read-only until
    /// reopened.
    read_only: AtomicBool,
    state: Mutex<SegmentState>,
    inodes: RwLock<HashMap<u64, Arc<RwLock<Inode>>>>,
}

/// Handle to one segment file. Clones share the same underlying state; the
/// file closes when the last handle drops.
#[derive(Clone)]
pub struct Segment {
    core: Arc<SegmentCore>,
}

impl Segment {
    /// Create a fresh segment file at `path`.
    ///
    /// The file is sized up-front (sparse) and laid out as
    /// `[superblock | log region | data region]`. The log region gets one
    /// sixteenth of the data units, floored at 16.
    pub fn create(id: SegmentId, path: impl AsRef<Path>, data_units: u64) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let unit = SEGMENT_BLOCK_SIZE as u64;
        let log_units = (data_units / 16).max(16);
        let super_block = SuperBlock {
            version: SEGMENT_VERSION,
            block_size: SEGMENT_BLOCK_SIZE,
            log_start: unit,
            log_len: log_units * unit,
            data_start: (1 + log_units) * unit,
            data_units,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(TracedStorageError::from)?;
        file.set_len(super_block.data_start + data_units * unit)
            .map_err(TracedStorageError::from)?;
        file.write_all_at(&super_block.encode(), 0)
            .map_err(TracedStorageError::from)?;
        file.sync_all().map_err(TracedStorageError::from)?;
        info!(segment = id, path = %path.display(), "created segment");

        let state = SegmentState {
            data_alloc: BitmapAllocator::new(
                super_block.data_start,
                super_block.block_size,
                data_units,
            ),
            log: SegmentLog::new(&super_block),
        };
        Ok(Self {
            core: Arc::new(SegmentCore {
                id,
                path,
                file,
                super_block,
                read_only: AtomicBool::new(false),
                state: Mutex::new(state),
                inodes: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Open an existing segment: validate the superblock, replay the
    /// embedded log and rebuild allocator state from the surviving inodes.
    ///
    /// Replay doubles as log compaction: superseded images and removal
    /// tombstones are invalidated on the spot, and only live images keep
    /// their log allocation. Superseded records are invalidated before
    /// tombstones so a crash mid-way can never resurrect a removed inode.
    pub fn open(id: SegmentId, path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(TracedStorageError::from)?;
        let mut header = vec![0u8; super::SUPERBLOCK_SIZE];
        file.read_exact_at(&mut header, 0)
            .map_err(TracedStorageError::from)?;
        let super_block = SuperBlock::decode(&header)?;

        let replay = SegmentLog::replay(&file, &super_block)?;

        // phase 1: drop superseded records
        for record in &replay.records {
            let winner = &replay.images[&record.inode_id].1;
            if winner.offset != record.offset {
                invalidate_record(&file, record)?;
            }
        }
        // phase 2: drop removal tombstones
        let mut log = SegmentLog::with_seq(&super_block, replay.max_seq + 1);
        let mut data_alloc = BitmapAllocator::new(
            super_block.data_start,
            super_block.block_size,
            super_block.data_units,
        );
        let mut inodes = HashMap::new();
        for (id, (mut inode, loc)) in replay.images {
            if !inode.is_resident() {
                invalidate_record(&file, &loc)?;
                continue;
            }
            log.restore(&loc);
            inode.log_extent = Some((loc.offset, loc.alloc_len));
            for extent in &inode.extents {
                data_alloc.restore(extent.offset, extent.alloc_len.max(extent.length));
            }
            inodes.insert(id, Arc::new(RwLock::new(inode)));
        }
        debug!(
            segment = id,
            inodes = inodes.len(),
            "replayed segment log"
        );

        Ok(Self {
            core: Arc::new(SegmentCore {
                id,
                path,
                file,
                super_block,
                read_only: AtomicBool::new(false),
                state: Mutex::new(SegmentState { data_alloc, log }),
                inodes: RwLock::new(inodes),
            }),
        })
    }

    pub fn id(&self) -> SegmentId {
        self.core.id
    }

    pub fn path(&self) -> &Path {
        &self.core.path
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.core.super_block
    }

    pub fn is_read_only(&self) -> bool {
        self.core.read_only.load(Ordering::Acquire)
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.core.state.lock().data_alloc.capacity_bytes()
    }

    pub fn in_use_bytes(&self) -> u64 {
        self.core.state.lock().data_alloc.in_use_bytes()
    }

    pub fn inode_count(&self) -> usize {
        self.core.inodes.read().len()
    }

    /// Open the block file for `inode_id`, creating the inode on first use.
    pub fn block_file(&self, inode_id: u64, algo: CompressionType) -> BlockFile {
        let inode = {
            let mut inodes = self.core.inodes.write();
            inodes
                .entry(inode_id)
                .or_insert_with(|| Arc::new(RwLock::new(Inode::new(inode_id, algo))))
                .clone()
        };
        BlockFile::new(self.clone(), inode)
    }

    /// Open the block file for an inode that must already exist.
    pub fn open_block_file(&self, inode_id: u64) -> Option<BlockFile> {
        let inode = self.core.inodes.read().get(&inode_id)?.clone();
        let file = BlockFile::new(self.clone(), inode);
        file.is_resident().then_some(file)
    }

    /// Ids of every resident inode, for iteration and soft deletion.
    pub fn inode_ids(&self) -> Vec<u64> {
        self.core.inodes.read().keys().copied().collect()
    }

    /// Mark every inode removed and free its space. The file itself is
    /// deleted by the caller once no handles remain.
    pub fn soft_delete(&self) -> StorageResult<()> {
        for inode_id in self.inode_ids() {
            if let Some(file) = self.open_block_file(inode_id) {
                file.remove()?;
            }
        }
        Ok(())
    }

    /// Flush file contents to stable storage.
    pub fn sync(&self) -> StorageResult<()> {
        self.core.file.sync_data().map_err(TracedStorageError::from)
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.core.read_only.load(Ordering::Acquire) {
            return Err(TracedStorageError::from(std::io::Error::other(
                "segment is read-only after an I/O failure",
            )));
        }
        Ok(())
    }

    pub(crate) fn allocate(&self, bytes: u64) -> StorageResult<(u64, u64)> {
        self.check_writable()?;
        self.core.state.lock().data_alloc.allocate(bytes)
    }

    pub(crate) fn free(&self, offset: u64, bytes: u64) -> StorageResult<()> {
        self.core.state.lock().data_alloc.free(offset, bytes)
    }

    pub(crate) fn free_ranges(&self, ranges: &[FreedRange]) -> StorageResult<()> {
        let mut state = self.core.state.lock();
        for range in ranges {
            state.data_alloc.free(range.offset, range.length)?;
        }
        Ok(())
    }

    pub(crate) fn write_all_at(&self, data: &[u8], offset: u64) -> StorageResult<()> {
        self.check_writable()?;
        self.core.file.write_all_at(data, offset).map_err(|e| {
            self.core.read_only.store(true, Ordering::Release);
            TracedStorageError::from(e)
        })
    }

    pub(crate) fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> StorageResult<()> {
        self.core
            .file
            .read_exact_at(buf, offset)
            .map_err(TracedStorageError::from)
    }

    /// Journal a new image of `inode` through the embedded log.
    pub(crate) fn journal(&self, inode: &mut Inode) -> StorageResult<()> {
        self.check_writable()?;
        let mut state = self.core.state.lock();
        state.log.append_image(&self.core.file, inode).map_err(|e| {
            self.core.read_only.store(true, Ordering::Release);
            e
        })
    }
}
