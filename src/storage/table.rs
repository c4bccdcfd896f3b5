// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

//! The relation implementation.
//!
//! A table owns an arena of block metadata keyed by block id; blocks refer
//! to their segment by id, never through an owning handle. Row identity for
//! point operations is the hidden physical address
//! `block_id (32b) | row offset (32b)`, assigned at insert and never
//! mutated.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use itertools::Itertools;
use moka::sync::Cache;
use parking_lot::{Mutex, RwLock};
use tracing::info;

use super::batch::{Batch, ColumnVec};
use super::column_block::{stream_inode_id, BlockId, ColumnBlock, DeletesFile, StreamKind};
use super::index::ZoneMap;
use super::options::{CompressionType, StorageOptions};
use super::segment::{Segment, SegmentId};
use super::wal::{GroupId, LogStore};
use super::{StorageError, StorageResult, TracedStorageError};
use crate::catalog::Schema;
use crate::types::Value;

/// Compose the hidden key of a row.
pub fn phy_addr(block: BlockId, row: u32) -> u64 {
    ((block as u64) << 32) | row as u64
}

/// Split a hidden key into `(block, row)`.
pub fn split_phy_addr(key: u64) -> (BlockId, u32) {
    ((key >> 32) as u32, key as u32)
}

/// An equality filter over the sort-key column.
#[derive(Clone, Debug)]
pub struct Filter {
    pub value: Value,
}

impl Filter {
    pub fn eq(value: Value) -> Self {
        Self { value }
    }

    fn key(&self) -> Vec<u8> {
        let mut key = Vec::new();
        self.value.encode_key(&mut key);
        key
    }
}

/// Metadata of one sealed block. Row visibility is derived from the
/// committed prefixes of the update and delete streams; bytes past a prefix
/// exist on disk but belong to transactions that never committed.
#[derive(Clone, Debug)]
pub struct BlockMeta {
    pub id: BlockId,
    pub segment_id: SegmentId,
    pub rows: u32,
    /// Committed stored length of each column's update stream.
    pub update_lens: Vec<u64>,
    /// Committed stored length of the block's delete stream.
    pub delete_len: u64,
}

pub(crate) struct TableState {
    pub segments: HashMap<SegmentId, Segment>,
    /// Block arena in id (= insertion) order.
    pub blocks: BTreeMap<BlockId, BlockMeta>,
    pub next_block_id: BlockId,
    pub next_segment_id: SegmentId,
    /// The appendable segment, if it still has block slots.
    pub current_segment: Option<SegmentId>,
    pub blocks_in_current: u16,
}

impl TableState {
    pub(crate) fn new() -> Self {
        Self {
            segments: HashMap::new(),
            blocks: BTreeMap::new(),
            next_block_id: 0,
            next_segment_id: 0,
            current_segment: None,
            blocks_in_current: 0,
        }
    }
}

pub(crate) struct TableCore {
    pub id: GroupId,
    pub schema: Arc<Schema>,
    pub options: Arc<StorageOptions>,
    pub wal: Arc<LogStore>,
    /// Decoded immutable column payloads, keyed by
    /// `(table, block, column)`.
    pub cache: Cache<(u32, BlockId, u16), Arc<ColumnVec>>,
    pub state: RwLock<TableState>,
    /// Serializes commits: physical stream writes, the WAL append and the
    /// in-memory publish happen under this lock.
    pub commit_lock: Mutex<()>,
}

/// A relation handle. Cheap to clone; all clones share table state.
#[derive(Clone)]
pub struct ColumnarTable {
    pub(crate) core: Arc<TableCore>,
}

impl ColumnarTable {
    pub(crate) fn new(
        id: GroupId,
        schema: Arc<Schema>,
        options: Arc<StorageOptions>,
        wal: Arc<LogStore>,
        cache: Cache<(u32, BlockId, u16), Arc<ColumnVec>>,
        state: TableState,
    ) -> Self {
        Self {
            core: Arc::new(TableCore {
                id,
                schema,
                options,
                wal,
                cache,
                state: RwLock::new(state),
                commit_lock: Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.core.id
    }

    /// Begin a transaction on this relation.
    pub fn begin(&self) -> super::transaction::ColumnarTransaction {
        super::transaction::ColumnarTransaction::begin(self.clone())
    }

    pub fn name(&self) -> String {
        self.core.schema.name.clone()
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.core.schema
    }

    /// Count of visible rows across all blocks.
    pub fn rows(&self) -> StorageResult<u64> {
        let blocks = self.block_metas();
        let mut total = 0u64;
        for meta in blocks {
            total += self.visible_rows(&meta)? as u64;
        }
        Ok(total)
    }

    /// Stored bytes of one column across all blocks.
    pub fn size(&self, column: &str) -> StorageResult<u64> {
        let col = self
            .core
            .schema
            .column_idx(column)
            .ok_or_else(|| TracedStorageError::invalid_input(format!("unknown column \"{}\"", column)))?
            as u16;
        let state = self.core.state.read();
        let mut total = 0u64;
        for meta in state.blocks.values() {
            let segment = state.segments.get(&meta.segment_id).ok_or_else(|| {
                TracedStorageError::fatal(format!("segment {} missing", meta.segment_id))
            })?;
            if let Some(file) =
                segment.open_block_file(stream_inode_id(meta.id, col, StreamKind::Data))
            {
                total += file.size();
            }
        }
        Ok(total)
    }

    /// Snapshot of the block arena in id order.
    pub fn block_metas(&self) -> Vec<BlockMeta> {
        self.core.state.read().blocks.values().cloned().collect()
    }

    pub fn block_meta(&self, block: BlockId) -> StorageResult<BlockMeta> {
        self.core
            .state
            .read()
            .blocks
            .get(&block)
            .cloned()
            .ok_or_else(|| TracedStorageError::not_found("block", block))
    }

    pub fn segment_ids(&self) -> Vec<SegmentId> {
        let state = self.core.state.read();
        state.segments.keys().copied().sorted().collect()
    }

    pub(crate) fn segment(&self, id: SegmentId) -> StorageResult<Segment> {
        self.core
            .state
            .read()
            .segments
            .get(&id)
            .cloned()
            .ok_or_else(|| TracedStorageError::not_found("segment", id))
    }

    /// Decode one column of one block, updates overlaid, without the delete
    /// mask. The immutable payload is cached; the overlay is applied on a
    /// copy.
    pub(crate) fn read_column(&self, meta: &BlockMeta, col: u16) -> StorageResult<ColumnVec> {
        let segment = self.segment(meta.segment_id)?;
        let ty = self.core.schema.column_defs[col as usize].ty;
        let cache_key = (self.core.id, meta.id, col);
        let base = match self.core.cache.get(&cache_key) {
            Some(cached) => cached,
            None => {
                let cb = ColumnBlock::new(segment.clone(), meta.id, col);
                let decoded = Arc::new(cb.read_data(ty)?);
                self.core.cache.insert(cache_key, decoded.clone());
                decoded
            }
        };
        let mut column = (*base).clone();
        let prefix = meta.update_lens.get(col as usize).copied().unwrap_or(0);
        if prefix > 0 {
            let cb = ColumnBlock::new(segment, meta.id, col);
            cb.overlay_updates(&mut column, prefix)?;
        }
        Ok(column)
    }

    /// Deletion mask of one block.
    pub(crate) fn delete_mask(
        &self,
        meta: &BlockMeta,
    ) -> StorageResult<bitvec::vec::BitVec<u8, bitvec::order::Lsb0>> {
        let segment = self.segment(meta.segment_id)?;
        DeletesFile::new(segment, meta.id).read_mask(meta.rows, meta.delete_len)
    }

    pub(crate) fn visible_rows(&self, meta: &BlockMeta) -> StorageResult<u32> {
        if meta.delete_len == 0 {
            return Ok(meta.rows);
        }
        let mask = self.delete_mask(meta)?;
        Ok(meta.rows - mask.count_ones() as u32)
    }

    /// Point read: `GetValue(block, row, col)`.
    pub fn get_value(&self, block: BlockId, row: u32, column: &str) -> StorageResult<Value> {
        let meta = self.block_meta(block)?;
        if row >= meta.rows {
            return Err(TracedStorageError::invalid_input(format!(
                "row {} out of range ({} rows)",
                row, meta.rows
            )));
        }
        if meta.delete_len > 0 && self.delete_mask(&meta)?[row as usize] {
            return Err(TracedStorageError::not_found("row", phy_addr(block, row)));
        }
        let col = self.column_idx(column)?;
        let data = self.read_column(&meta, col)?;
        Ok(data.get(row as usize))
    }

    /// `GetValueByHiddenKey(key, col)`.
    pub fn get_value_by_hidden_key(&self, key: u64, column: &str) -> StorageResult<Value> {
        let (block, row) = split_phy_addr(key);
        self.get_value(block, row, column)
    }

    /// `GetByFilter`: locate the first visible row whose sort key equals the
    /// filter value. Zone maps prune blocks that cannot match.
    pub fn get_by_filter(&self, filter: &Filter) -> StorageResult<(BlockId, u32)> {
        let sort_idx = self.sort_key_idx()? as u16;
        let probe = filter.key();
        for meta in self.block_metas() {
            if !self.block_may_contain(&meta, sort_idx, &probe)? {
                continue;
            }
            let column = self.read_column(&meta, sort_idx)?;
            let mask = if meta.delete_len > 0 {
                Some(self.delete_mask(&meta)?)
            } else {
                None
            };
            for row in 0..meta.rows as usize {
                if let Some(mask) = &mask {
                    if mask[row] {
                        continue;
                    }
                }
                if column.is_valid(row) && column.key_at(row) == probe {
                    return Ok((meta.id, row as u32));
                }
            }
        }
        Err(TracedStorageError::not_found(
            "row",
            format!("{}", filter.value),
        ))
    }

    /// `BatchDedup`: fail with `Duplicate` if any projected key of the
    /// incoming batch already lives in the relation, or repeats within the
    /// batch itself.
    pub fn batch_dedup(&self, cols: &[ColumnVec]) -> StorageResult<()> {
        let key_col = cols.first().ok_or_else(|| {
            TracedStorageError::invalid_input("batch dedup requires a key column")
        })?;
        let sort_idx = self.sort_key_idx()? as u16;

        let mut incoming: HashMap<Vec<u8>, Value> = HashMap::new();
        for row in 0..key_col.len() {
            if !key_col.is_valid(row) {
                continue;
            }
            let key = key_col.key_at(row);
            if incoming.insert(key, key_col.get(row)).is_some() {
                return Err(TracedStorageError::duplicate(key_col.get(row)));
            }
        }
        if incoming.is_empty() {
            return Ok(());
        }

        for meta in self.block_metas() {
            let zone_hit = match self.zone_map(&meta, sort_idx)? {
                Some(map) => incoming.keys().any(|key| map.may_contain(key)),
                None => true,
            };
            if !zone_hit {
                continue;
            }
            let column = self.read_column(&meta, sort_idx)?;
            let mask = if meta.delete_len > 0 {
                Some(self.delete_mask(&meta)?)
            } else {
                None
            };
            for row in 0..meta.rows as usize {
                if let Some(mask) = &mask {
                    if mask[row] {
                        continue;
                    }
                }
                if !column.is_valid(row) {
                    continue;
                }
                if let Some(value) = incoming.get(&column.key_at(row)) {
                    return Err(TracedStorageError::duplicate(value.clone()));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn zone_map(&self, meta: &BlockMeta, col: u16) -> StorageResult<Option<ZoneMap>> {
        let segment = self.segment(meta.segment_id)?;
        ColumnBlock::new(segment, meta.id, col).read_index()
    }

    fn block_may_contain(
        &self,
        meta: &BlockMeta,
        col: u16,
        probe: &[u8],
    ) -> StorageResult<bool> {
        match self.zone_map(meta, col)? {
            Some(map) => Ok(map.may_contain(probe)),
            None => Ok(true),
        }
    }

    pub(crate) fn column_idx(&self, name: &str) -> StorageResult<u16> {
        self.core
            .schema
            .column_idx(name)
            .map(|idx| idx as u16)
            .ok_or_else(|| {
                TracedStorageError::invalid_input(format!("unknown column \"{}\"", name))
            })
    }

    pub(crate) fn sort_key_idx(&self) -> StorageResult<usize> {
        self.core
            .schema
            .sort_key()
            .map(|k| k.idx)
            .ok_or_else(|| {
                TracedStorageError::invalid_input(format!(
                    "relation \"{}\" has no sort key",
                    self.core.schema.name
                ))
            })
    }

    /// Validate an incoming batch against the schema: arity, types,
    /// nullability.
    pub(crate) fn validate_batch(&self, batch: &Batch) -> StorageResult<()> {
        let schema = &self.core.schema;
        let visible = schema.visible_column_count();
        if batch.column_count() != visible {
            return Err(TracedStorageError::invalid_input(format!(
                "batch has {} columns, schema \"{}\" expects {}",
                batch.column_count(),
                schema.name,
                visible
            )));
        }
        for (batch_col, def) in batch
            .columns()
            .iter()
            .zip(schema.column_defs.iter().filter(|d| !d.is_phy_addr()))
        {
            if batch_col.logical_type() != &def.ty {
                return Err(TracedStorageError::invalid_input(format!(
                    "column \"{}\" expects {}, batch carries {}",
                    def.name,
                    def.ty,
                    batch_col.logical_type()
                )));
            }
            if !def.nullable && batch_col.has_nulls() {
                return Err(TracedStorageError::constraint(format!(
                    "null value in non-nullable column \"{}\"",
                    def.name
                )));
            }
        }
        Ok(())
    }

    /// Pick (or create) the segment that receives the next block. Called
    /// under the commit lock.
    pub(crate) fn segment_for_next_block(&self) -> StorageResult<(Segment, SegmentId)> {
        let max_blocks = effective_segment_max_blocks(&self.core.schema, &self.core.options);
        {
            let state = self.core.state.read();
            if let Some(current) = state.current_segment {
                if state.blocks_in_current < max_blocks {
                    if let Some(segment) = state.segments.get(&current) {
                        return Ok((segment.clone(), current));
                    }
                }
            }
        }
        let mut state = self.core.state.write();
        let id = state.next_segment_id;
        let path = segment_path(&self.core.options, self.core.id, id);
        let segment = Segment::create(id, path, self.core.options.segment_data_units)?;
        info!(table = self.core.id, segment = id, "sealed new segment for appends");
        state.segments.insert(id, segment.clone());
        state.next_segment_id += 1;
        state.current_segment = Some(id);
        state.blocks_in_current = 0;
        Ok((segment, id))
    }

    /// Visible-state scan used by iterators and filter operations.
    pub(crate) fn materialize_block(
        &self,
        meta: &BlockMeta,
        deadline: Option<Instant>,
    ) -> StorageResult<(Vec<ColumnVec>, bitvec::vec::BitVec<u8, bitvec::order::Lsb0>)> {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(StorageError::Timeout("table scan").into());
            }
        }
        let mut columns = Vec::with_capacity(self.core.schema.column_count());
        for col in 0..self.core.schema.column_count() as u16 {
            columns.push(self.read_column(meta, col)?);
        }
        let mask = self.delete_mask(meta)?;
        Ok((columns, mask))
    }

    pub(crate) fn alloc_block_id(&self) -> BlockId {
        let mut state = self.core.state.write();
        let id = state.next_block_id;
        state.next_block_id += 1;
        id
    }

    /// Account a freshly sealed block against its segment's block cap.
    pub(crate) fn note_block_sealed(&self, segment_id: SegmentId) {
        let mut state = self.core.state.write();
        if state.current_segment == Some(segment_id) {
            state.blocks_in_current += 1;
        }
    }

    /// Publish committed mutations to readers. The WAL entry is already
    /// durable; this is the visibility flip.
    pub(crate) fn publish_ops(
        &self,
        ops: &[super::transaction::TableOp],
        staged: Vec<BlockMeta>,
    ) -> StorageResult<()> {
        use super::transaction::TableOp;

        let mut staged: HashMap<BlockId, BlockMeta> =
            staged.into_iter().map(|meta| (meta.id, meta)).collect();
        let mut dropped_segments: Vec<Segment> = Vec::new();
        {
            let mut state = self.core.state.write();
            for op in ops {
                match op {
                    TableOp::AppendBlock { block, .. } => {
                        if let Some(meta) = staged.remove(block) {
                            state.blocks.insert(*block, meta);
                        }
                    }
                    TableOp::Update {
                        block,
                        col,
                        new_len,
                    } => {
                        if let Some(meta) = state.blocks.get_mut(block) {
                            if let Some(len) = meta.update_lens.get_mut(*col as usize) {
                                *len = (*len).max(*new_len);
                            }
                        }
                    }
                    TableOp::Delete { block, new_len } => {
                        if let Some(meta) = state.blocks.get_mut(block) {
                            meta.delete_len = meta.delete_len.max(*new_len);
                        }
                    }
                    TableOp::DropSegment { segment } => {
                        if let Some(seg) = state.segments.remove(segment) {
                            let doomed: Vec<BlockId> = state
                                .blocks
                                .values()
                                .filter(|m| m.segment_id == *segment)
                                .map(|m| m.id)
                                .collect();
                            for block in doomed {
                                state.blocks.remove(&block);
                                for col in 0..self.core.schema.column_count() as u16 {
                                    self.core.cache.invalidate(&(self.core.id, block, col));
                                }
                            }
                            if state.current_segment == Some(*segment) {
                                state.current_segment = None;
                                state.blocks_in_current = 0;
                            }
                            dropped_segments.push(seg);
                        }
                    }
                }
            }
        }
        // free space and unlink outside the state lock
        for segment in dropped_segments {
            if let Err(e) = segment.soft_delete() {
                tracing::warn!(segment = segment.id(), error = %e, "soft delete failed");
            }
            let path = segment.path().to_path_buf();
            drop(segment);
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "could not unlink segment");
            }
        }
        Ok(())
    }
}

pub(crate) fn segment_path(
    options: &StorageOptions,
    table_id: u32,
    segment_id: SegmentId,
) -> std::path::PathBuf {
    options
        .path
        .join(format!("{}_{:04}.seg", table_id, segment_id))
}

/// Segment ids of one table present on disk, committed or not. A crash
/// between segment creation and the commit's log entry leaves a file no
/// block references; its id must still never be reissued.
pub(crate) fn list_segment_ids(
    options: &StorageOptions,
    table_id: u32,
) -> StorageResult<Vec<SegmentId>> {
    let mut ids = Vec::new();
    let prefix = format!("{}_", table_id);
    for entry in std::fs::read_dir(&options.path).map_err(TracedStorageError::from)? {
        let entry = entry.map_err(TracedStorageError::from)?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("seg") {
            continue;
        }
        if let Some(rest) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix(&prefix))
        {
            if let Ok(id) = rest.parse::<SegmentId>() {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

pub(crate) fn effective_block_max_rows(schema: &Schema, options: &StorageOptions) -> u32 {
    if schema.block_max_rows > 0 {
        schema.block_max_rows
    } else {
        options.block_max_rows
    }
}

pub(crate) fn effective_segment_max_blocks(schema: &Schema, options: &StorageOptions) -> u16 {
    if schema.segment_max_blocks > 0 {
        schema.segment_max_blocks
    } else {
        options.segment_max_blocks
    }
}

/// Build the hidden physical-address column for a freshly sealed block.
pub(crate) fn build_phy_addr_column(block: BlockId, rows: u32) -> ColumnVec {
    let mut column = ColumnVec::new(crate::types::LogicalType::UInt64);
    for row in 0..rows {
        column
            .push(Value::UInt64(phy_addr(block, row)))
            .expect("uint64 column accepts uint64");
    }
    column
}

/// Seal one chunk of a batch into a block: per-column data streams, zone
/// maps, nothing published yet. Returns the block metadata to journal.
pub(crate) fn seal_block(
    table: &ColumnarTable,
    segment: &Segment,
    block_id: BlockId,
    chunk: &Batch,
) -> StorageResult<BlockMeta> {
    let schema = &table.core.schema;
    let rows = chunk.cardinality() as u32;
    let compression = table.core.options.compression;

    let mut batch_cols = chunk.columns().iter();
    for def in schema.column_defs.iter() {
        let column;
        let stored: &ColumnVec = if def.is_phy_addr() {
            column = build_phy_addr_column(block_id, rows);
            &column
        } else {
            batch_cols.next().expect("validated arity")
        };
        let cb = ColumnBlock::new(segment.clone(), block_id, def.idx as u16);
        cb.write_data(stored, data_compression(compression, stored))?;
        cb.write_index(&ZoneMap::build(stored))?;
    }

    Ok(BlockMeta {
        id: block_id,
        segment_id: segment.id(),
        rows,
        update_lens: vec![0; schema.column_count()],
        delete_len: 0,
    })
}

/// Tiny payloads gain nothing from compression; columns below one allocator
/// unit are stored raw.
fn data_compression(configured: CompressionType, column: &ColumnVec) -> CompressionType {
    if column.len() < 64 {
        CompressionType::None
    } else {
        configured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phy_addr_roundtrip() {
        let key = phy_addr(7, 42);
        assert_eq!(split_phy_addr(key), (7, 42));
        let key = phy_addr(u32::MAX, u32::MAX);
        assert_eq!(split_phy_addr(key), (u32::MAX, u32::MAX));
    }
}
