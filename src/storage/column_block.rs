// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

//! Wrappers mapping `(block, column, kind)` onto inode-backed streams.
//!
//! Each block owns four kinds of streams: the immutable column payload
//! (`Data`), the column's zone map (`Index`), a delta stream of row updates
//! (`Updates`) and the block-wide delete stream (`Deletes`). Inode ids are
//! derived from the triple, so replaying a segment's embedded log rebuilds
//! the mapping with no extra directory.

use bitvec::order::Lsb0;
use bitvec::vec::BitVec;
use bytes::{Buf, BufMut};

use super::batch::ColumnVec;
use super::index::ZoneMap;
use super::options::CompressionType;
use super::segment::{BlockFile, Segment};
use super::{StorageResult, TracedStorageError};
use crate::types::{ColumnIdx, LogicalType, Value};

/// Identifier of a block within its table.
pub type BlockId = u32;

/// The four stream kinds of a column block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Data,
    Index,
    Updates,
    Deletes,
}

impl StreamKind {
    fn as_u8(self) -> u8 {
        match self {
            StreamKind::Data => 0,
            StreamKind::Index => 1,
            StreamKind::Updates => 2,
            StreamKind::Deletes => 3,
        }
    }
}

/// Derive the inode id of a stream: `block (32b) | column (16b) | kind (8b)`.
pub fn stream_inode_id(block: BlockId, column: ColumnIdx, kind: StreamKind) -> u64 {
    ((block as u64) << 32) | ((column as u64) << 8) | kind.as_u8() as u64
}

/// One column of one block inside a segment.
#[derive(Clone)]
pub struct ColumnBlock {
    segment: Segment,
    block_id: BlockId,
    column: ColumnIdx,
}

impl ColumnBlock {
    pub fn new(segment: Segment, block_id: BlockId, column: ColumnIdx) -> Self {
        Self {
            segment,
            block_id,
            column,
        }
    }

    fn stream(&self, kind: StreamKind, algo: CompressionType) -> BlockFile {
        self.segment
            .block_file(stream_inode_id(self.block_id, self.column, kind), algo)
    }

    fn open_stream(&self, kind: StreamKind) -> Option<BlockFile> {
        self.segment
            .open_block_file(stream_inode_id(self.block_id, self.column, kind))
    }

    /// Write the sealed column payload. Exactly one write per column block.
    pub fn write_data(&self, column: &ColumnVec, algo: CompressionType) -> StorageResult<()> {
        let mut payload = Vec::new();
        column.encode(&mut payload);
        self.stream(StreamKind::Data, algo).append(&payload)
    }

    /// Write the column's zone map.
    pub fn write_index(&self, zone_map: &ZoneMap) -> StorageResult<()> {
        self.stream(StreamKind::Index, CompressionType::None)
            .append(&zone_map.encode())
    }

    /// Decode the sealed column payload.
    pub fn read_data(&self, ty: LogicalType) -> StorageResult<ColumnVec> {
        let file = self.open_stream(StreamKind::Data).ok_or_else(|| {
            TracedStorageError::not_found("column data", format!("{}/{}", self.block_id, self.column))
        })?;
        ColumnVec::decode(ty, &file.read()?)
    }

    pub fn read_index(&self) -> StorageResult<Option<ZoneMap>> {
        match self.open_stream(StreamKind::Index) {
            Some(file) => Ok(Some(ZoneMap::decode(&file.read()?)?)),
            None => Ok(None),
        }
    }

    /// Append one `(row, value)` delta to the update stream. Returns the new
    /// stored length of the stream; the caller journals it as the committed
    /// prefix.
    pub fn append_update(&self, row: u32, value: &Value) -> StorageResult<u64> {
        let mut record = Vec::new();
        record.put_u32(row);
        value.encode(&mut record);
        let file = self.stream(StreamKind::Updates, CompressionType::None);
        file.append(&record)?;
        Ok(file.size())
    }

    /// Read the committed prefix of the update stream and fold it into the
    /// latest value per row.
    pub fn read_updates(
        &self,
        ty: &LogicalType,
        prefix_len: u64,
    ) -> StorageResult<Vec<(u32, Value)>> {
        if prefix_len == 0 {
            return Ok(Vec::new());
        }
        let file = match self.open_stream(StreamKind::Updates) {
            Some(file) => file,
            None => return Ok(Vec::new()),
        };
        let data = file.read_prefix(prefix_len)?;
        let mut buf = &data[..];
        let mut updates: Vec<(u32, Value)> = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < 4 {
                return Err(TracedStorageError::decode("truncated update record"));
            }
            let row = buf.get_u32();
            let value = Value::decode(ty, &mut buf)
                .ok_or_else(|| TracedStorageError::decode("truncated update value"))?;
            // last write per row wins
            match updates.iter_mut().find(|(r, _)| *r == row) {
                Some(slot) => slot.1 = value,
                None => updates.push((row, value)),
            }
        }
        Ok(updates)
    }

    /// Apply the committed update prefix onto a decoded column.
    pub fn overlay_updates(
        &self,
        column: &mut ColumnVec,
        prefix_len: u64,
    ) -> StorageResult<()> {
        let ty = *column.logical_type();
        for (row, value) in self.read_updates(&ty, prefix_len)? {
            if (row as usize) < column.len() {
                column.set(row as usize, value)?;
            }
        }
        Ok(())
    }
}

/// The block-wide delete stream. Deletes are row ranges within the block;
/// the column id slot of the inode id is unused.
#[derive(Clone)]
pub struct DeletesFile {
    segment: Segment,
    block_id: BlockId,
}

impl DeletesFile {
    pub fn new(segment: Segment, block_id: BlockId) -> Self {
        Self { segment, block_id }
    }

    fn stream(&self) -> BlockFile {
        self.segment.block_file(
            stream_inode_id(self.block_id, 0, StreamKind::Deletes),
            CompressionType::None,
        )
    }

    /// Append a half-open deleted row range `[start, end)`. Returns the new
    /// stored length of the stream.
    pub fn append_range(&self, start: u32, end: u32) -> StorageResult<u64> {
        let mut record = Vec::with_capacity(8);
        record.put_u32(start);
        record.put_u32(end);
        let file = self.stream();
        file.append(&record)?;
        Ok(file.size())
    }

    /// Materialize the committed prefix into a deletion mask of `rows` bits.
    pub fn read_mask(&self, rows: u32, prefix_len: u64) -> StorageResult<BitVec<u8, Lsb0>> {
        let mut mask = BitVec::<u8, Lsb0>::repeat(false, rows as usize);
        if prefix_len == 0 {
            return Ok(mask);
        }
        let file = match self
            .segment
            .open_block_file(stream_inode_id(self.block_id, 0, StreamKind::Deletes))
        {
            Some(file) => file,
            None => return Ok(mask),
        };
        let data = file.read_prefix(prefix_len)?;
        let mut buf = &data[..];
        while buf.has_remaining() {
            if buf.remaining() < 8 {
                return Err(TracedStorageError::decode("truncated delete record"));
            }
            let start = buf.get_u32().min(rows) as usize;
            let end = buf.get_u32().min(rows) as usize;
            for row in start..end {
                mask.set(row, true);
            }
        }
        Ok(mask)
    }
}
