// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

use smallvec::SmallVec;

use crate::storage::options::CompressionType;
use crate::storage::{StorageResult, TracedStorageError};

/// How an extent entered the inode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtentKind {
    Append,
    Update,
}

impl ExtentKind {
    pub fn as_u8(self) -> u8 {
        match self {
            ExtentKind::Append => 0,
            ExtentKind::Update => 1,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ExtentKind::Append),
            1 => Some(ExtentKind::Update),
            _ => None,
        }
    }
}

/// A contiguous run of stored bytes inside the segment file.
///
/// `length` counts the meaningful bytes; the allocator hands out whole
/// units, so the physical span may be longer (`alloc_len`). Extent repair
/// splits extents without touching the underlying allocation records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub kind: ExtentKind,
    /// Byte offset inside the segment file.
    pub offset: u64,
    /// Meaningful stored bytes.
    pub length: u64,
    /// Rounded-up allocation span this extent was written into. Zero for
    /// fragments produced by repair; the allocator's span map stays
    /// authoritative for reclamation.
    pub alloc_len: u64,
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// A byte range returned to the allocator after repair or removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreedRange {
    pub offset: u64,
    pub length: u64,
}

/// Lifecycle state of an inode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeState {
    Resident,
    Removed,
}

impl InodeState {
    pub fn as_u8(self) -> u8 {
        match self {
            InodeState::Resident => 0,
            InodeState::Removed => 1,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(InodeState::Resident),
            1 => Some(InodeState::Removed),
            _ => None,
        }
    }
}

pub(crate) type ExtentList = SmallVec<[Extent; 4]>;

/// Persistent metadata of one logical stream inside a segment.
///
/// Every mutation is journaled through the embedded log before it becomes
/// visible; the caller holds the inode write lock across mutation plus
/// journal append.
#[derive(Clone, Debug)]
pub struct Inode {
    pub id: u64,
    pub algo: CompressionType,
    pub state: InodeState,
    /// Stored (compressed) size: the sum of extent lengths.
    pub size: u64,
    /// Uncompressed payload size.
    pub original_size: u64,
    pub extents: ExtentList,
    /// Location of this inode's latest image in the log region.
    pub log_extent: Option<(u64, u64)>,
}

impl Inode {
    pub fn new(id: u64, algo: CompressionType) -> Self {
        Self {
            id,
            algo,
            state: InodeState::Resident,
            size: 0,
            original_size: 0,
            extents: ExtentList::new(),
            log_extent: None,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.state == InodeState::Resident
    }

    /// Record an appended extent.
    pub fn push_extent(&mut self, extent: Extent, original_len: u64) {
        self.size += extent.length;
        self.original_size += original_len;
        self.extents.push(extent);
    }

    /// Replace logical bytes `[u_start, u_start + replace_len)` with
    /// `new_extent` and return the freed physical ranges.
    ///
    /// The extent list is rebuilt copy-on-write style: a reader that cloned
    /// the list before repair sees the pre-update layout, one that clones
    /// after sees the post-update layout, never a mixture. The caller holds
    /// the write lock, journals the result, then publishes it.
    pub fn repair_extents(
        &mut self,
        u_start: u64,
        replace_len: u64,
        new_extent: Extent,
    ) -> StorageResult<Vec<FreedRange>> {
        let u_end = u_start
            .checked_add(replace_len)
            .filter(|end| *end <= self.size)
            .ok_or_else(|| {
                TracedStorageError::invalid_input(format!(
                    "update range [{}, {}) exceeds logical size {}",
                    u_start,
                    u_start + replace_len,
                    self.size
                ))
            })?;

        let mut rebuilt = ExtentList::new();
        let mut freed = Vec::new();
        let mut cursor = 0u64;
        let mut inserted = false;
        for extent in self.extents.drain(..) {
            let (start, end) = (cursor, cursor + extent.length);
            cursor = end;
            if end <= u_start {
                rebuilt.push(extent);
                continue;
            }
            if start >= u_end {
                if !inserted {
                    rebuilt.push(new_extent);
                    inserted = true;
                }
                rebuilt.push(extent);
                continue;
            }
            // overlap with the updated range
            let keep_front = u_start.saturating_sub(start);
            let keep_back = end.saturating_sub(u_end);
            let overlap = extent.length - keep_front - keep_back;
            if keep_front > 0 {
                rebuilt.push(Extent {
                    kind: extent.kind,
                    offset: extent.offset,
                    length: keep_front,
                    alloc_len: 0,
                });
            }
            if overlap > 0 {
                freed.push(FreedRange {
                    offset: extent.offset + keep_front,
                    length: overlap,
                });
            }
            if !inserted {
                rebuilt.push(new_extent);
                inserted = true;
            }
            if keep_back > 0 {
                rebuilt.push(Extent {
                    kind: extent.kind,
                    offset: extent.offset + extent.length - keep_back,
                    length: keep_back,
                    alloc_len: 0,
                });
            }
        }
        if !inserted {
            // the updated range starts exactly at the logical end
            rebuilt.push(new_extent);
        }
        self.extents = rebuilt;
        self.size = self.size - replace_len + new_extent.length;
        Ok(freed)
    }
}
