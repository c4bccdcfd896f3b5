// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

//! Transaction framing for relation mutations.
//!
//! A transaction buffers logical mutations; `commit` performs the physical
//! stream writes, appends one `Txn` entry to the write-ahead log and only
//! then publishes the changes to readers. `abort` (or drop) discards the
//! buffer without touching durable state, so a crashed or abandoned
//! transaction leaves at most unreferenced bytes behind.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut};
use tracing::warn;

use super::batch::Batch;
use super::column_block::{BlockId, ColumnBlock, DeletesFile};
use super::segment::{Segment, SegmentId};
use super::table::{
    effective_block_max_rows, seal_block, split_phy_addr, BlockMeta, ColumnarTable, Filter,
};
use super::wal::EntryKind;
use super::{StorageResult, TracedStorageError};
use crate::types::Value;

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Committed form of one table mutation, as journaled in the WAL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TableOp {
    AppendBlock {
        segment: SegmentId,
        block: BlockId,
        rows: u32,
    },
    /// The committed prefix of one column's update stream grew.
    Update {
        block: BlockId,
        col: u16,
        new_len: u64,
    },
    /// The committed prefix of a block's delete stream grew.
    Delete {
        block: BlockId,
        new_len: u64,
    },
    DropSegment {
        segment: SegmentId,
    },
}

pub(crate) fn encode_table_ops(ops: &[TableOp]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_u32(ops.len() as u32);
    for op in ops {
        match op {
            TableOp::AppendBlock {
                segment,
                block,
                rows,
            } => {
                buf.put_u8(1);
                buf.put_u32(*segment);
                buf.put_u32(*block);
                buf.put_u32(*rows);
            }
            TableOp::Update {
                block,
                col,
                new_len,
            } => {
                buf.put_u8(2);
                buf.put_u32(*block);
                buf.put_u16(*col);
                buf.put_u64(*new_len);
            }
            TableOp::Delete { block, new_len } => {
                buf.put_u8(3);
                buf.put_u32(*block);
                buf.put_u64(*new_len);
            }
            TableOp::DropSegment { segment } => {
                buf.put_u8(4);
                buf.put_u32(*segment);
            }
        }
    }
    buf
}

pub(crate) fn decode_table_ops(mut data: &[u8]) -> StorageResult<Vec<TableOp>> {
    let buf = &mut data;
    if buf.remaining() < 4 {
        return Err(TracedStorageError::decode("truncated table op list"));
    }
    let count = buf.get_u32();
    let mut ops = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if buf.remaining() < 1 {
            return Err(TracedStorageError::decode("truncated table op"));
        }
        let op = match buf.get_u8() {
            1 => {
                if buf.remaining() < 12 {
                    return Err(TracedStorageError::decode("truncated append op"));
                }
                TableOp::AppendBlock {
                    segment: buf.get_u32(),
                    block: buf.get_u32(),
                    rows: buf.get_u32(),
                }
            }
            2 => {
                if buf.remaining() < 14 {
                    return Err(TracedStorageError::decode("truncated update op"));
                }
                TableOp::Update {
                    block: buf.get_u32(),
                    col: buf.get_u16(),
                    new_len: buf.get_u64(),
                }
            }
            3 => {
                if buf.remaining() < 12 {
                    return Err(TracedStorageError::decode("truncated delete op"));
                }
                TableOp::Delete {
                    block: buf.get_u32(),
                    new_len: buf.get_u64(),
                }
            }
            4 => {
                if buf.remaining() < 4 {
                    return Err(TracedStorageError::decode("truncated drop op"));
                }
                TableOp::DropSegment {
                    segment: buf.get_u32(),
                }
            }
            tag => {
                return Err(TracedStorageError::decode(format!(
                    "unknown table op tag {}",
                    tag
                )))
            }
        };
        ops.push(op);
    }
    Ok(ops)
}

/// Buffered form of one mutation.
enum PendingOp {
    Append(Batch),
    Update {
        block: BlockId,
        row: u32,
        col: u16,
        value: Value,
    },
    RangeDelete {
        block: BlockId,
        start: u32,
        end: u32,
    },
    DropSegment {
        segment: SegmentId,
    },
}

/// A transaction over one relation.
///
/// Dropping an unfinished transaction aborts it with a warning; call
/// [`ColumnarTransaction::commit`] or [`ColumnarTransaction::abort`]
/// explicitly.
pub struct ColumnarTransaction {
    table: ColumnarTable,
    txn_id: u64,
    ops: Vec<PendingOp>,
    finished: bool,
}

impl ColumnarTransaction {
    pub(crate) fn begin(table: ColumnarTable) -> Self {
        Self {
            table,
            txn_id: NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed),
            ops: Vec::new(),
            finished: false,
        }
    }

    pub fn txn_id(&self) -> u64 {
        self.txn_id
    }

    /// Frame an append of a schema-shaped batch.
    pub fn append(&mut self, batch: Batch) -> StorageResult<()> {
        self.table.validate_batch(&batch)?;
        self.ops.push(PendingOp::Append(batch));
        Ok(())
    }

    /// Frame a point update of `(block, row, column)`.
    pub fn update(
        &mut self,
        block: BlockId,
        row: u32,
        column: &str,
        value: Value,
    ) -> StorageResult<()> {
        let col = self.table.column_idx(column)?;
        let def = &self.table.schema().column_defs[col as usize];
        if def.is_phy_addr() {
            return Err(TracedStorageError::invalid_input(
                "the physical address column is never mutated",
            ));
        }
        if def.is_sort_key() {
            return Err(TracedStorageError::invalid_input(format!(
                "cannot update sort key column \"{}\"",
                def.name
            )));
        }
        if !value.fits(&def.ty) {
            return Err(TracedStorageError::invalid_input(format!(
                "value {:?} does not fit column \"{}\"",
                value, def.name
            )));
        }
        if value.is_null() && !def.nullable {
            return Err(TracedStorageError::constraint(format!(
                "null value in non-nullable column \"{}\"",
                def.name
            )));
        }
        let meta = self.table.block_meta(block)?;
        if row >= meta.rows {
            return Err(TracedStorageError::invalid_input(format!(
                "row {} out of range ({} rows)",
                row, meta.rows
            )));
        }
        self.ops.push(PendingOp::Update {
            block,
            row,
            col,
            value,
        });
        Ok(())
    }

    /// Frame the deletion of the half-open row range `[start, end)`.
    pub fn range_delete(&mut self, block: BlockId, start: u32, end: u32) -> StorageResult<()> {
        let meta = self.table.block_meta(block)?;
        if start >= end || end > meta.rows {
            return Err(TracedStorageError::invalid_input(format!(
                "bad delete range [{}, {}) for {} rows",
                start, end, meta.rows
            )));
        }
        self.ops.push(PendingOp::RangeDelete { block, start, end });
        Ok(())
    }

    pub fn delete_by_hidden_key(&mut self, key: u64) -> StorageResult<()> {
        let (block, row) = split_phy_addr(key);
        self.range_delete(block, row, row + 1)
    }

    pub fn delete_by_hidden_keys(&mut self, keys: &[u64]) -> StorageResult<()> {
        for key in keys {
            self.delete_by_hidden_key(*key)?;
        }
        Ok(())
    }

    pub fn update_by_hidden_key(
        &mut self,
        key: u64,
        column: &str,
        value: Value,
    ) -> StorageResult<()> {
        let (block, row) = split_phy_addr(key);
        self.update(block, row, column, value)
    }

    /// Scan for the filter match, then update by hidden key.
    pub fn update_by_filter(
        &mut self,
        filter: &Filter,
        column: &str,
        value: Value,
    ) -> StorageResult<()> {
        let (block, row) = self.table.get_by_filter(filter)?;
        self.update(block, row, column, value)
    }

    /// Scan for the filter match, then delete by hidden key.
    pub fn delete_by_filter(&mut self, filter: &Filter) -> StorageResult<()> {
        let (block, row) = self.table.get_by_filter(filter)?;
        self.range_delete(block, row, row + 1)
    }

    /// Frame the soft deletion of a sealed segment.
    pub fn drop_segment(&mut self, segment: SegmentId) -> StorageResult<()> {
        self.table.segment(segment)?;
        self.ops.push(PendingOp::DropSegment { segment });
        Ok(())
    }

    /// Discard every framed mutation.
    pub fn abort(mut self) {
        self.finished = true;
        self.ops.clear();
    }

    /// Persist every framed mutation, or none.
    ///
    /// Order: physical stream writes, segment sync, one `Txn` WAL entry,
    /// then the in-memory publish. A failure before the WAL append leaves
    /// only unreferenced bytes; readers never observe a partial commit.
    pub fn commit(mut self) -> StorageResult<()> {
        self.finished = true;
        if self.ops.is_empty() {
            return Ok(());
        }
        let table = self.table.clone();
        let _guard = table.core.commit_lock.lock();

        let mut committed: Vec<TableOp> = Vec::new();
        let mut staged_blocks: Vec<BlockMeta> = Vec::new();
        let mut touched: Vec<Segment> = Vec::new();
        let mut staged_keys: HashSet<Vec<u8>> = HashSet::new();

        for op in std::mem::take(&mut self.ops) {
            match op {
                PendingOp::Append(batch) => self.commit_append(
                    &batch,
                    &mut committed,
                    &mut staged_blocks,
                    &mut touched,
                    &mut staged_keys,
                )?,
                PendingOp::Update {
                    block,
                    row,
                    col,
                    value,
                } => {
                    let meta = table.block_meta(block)?;
                    let segment = table.segment(meta.segment_id)?;
                    let cb = ColumnBlock::new(segment.clone(), block, col);
                    let new_len = cb.append_update(row, &value)?;
                    committed.push(TableOp::Update {
                        block,
                        col,
                        new_len,
                    });
                    touched.push(segment);
                }
                PendingOp::RangeDelete { block, start, end } => {
                    let meta = table.block_meta(block)?;
                    let segment = table.segment(meta.segment_id)?;
                    let new_len = DeletesFile::new(segment.clone(), block).append_range(start, end)?;
                    committed.push(TableOp::Delete { block, new_len });
                    touched.push(segment);
                }
                PendingOp::DropSegment { segment } => {
                    committed.push(TableOp::DropSegment { segment });
                }
            }
        }

        if table.core.options.enable_fsync {
            for segment in &touched {
                segment.sync()?;
            }
        }

        let payload = encode_table_ops(&committed);
        table.core.wal.append(
            EntryKind::Txn,
            table.core.id,
            self.txn_id,
            payload,
            vec![],
            vec![],
        )?;

        table.publish_ops(&committed, staged_blocks)?;
        Ok(())
    }

    fn commit_append(
        &self,
        batch: &Batch,
        committed: &mut Vec<TableOp>,
        staged_blocks: &mut Vec<BlockMeta>,
        touched: &mut Vec<Segment>,
        staged_keys: &mut HashSet<Vec<u8>>,
    ) -> StorageResult<()> {
        let table = &self.table;
        let schema = table.schema();
        table.validate_batch(batch)?;

        // the engine, not the caller, guarantees key uniqueness on append
        if let Some(sort_key) = schema.sort_key() {
            // the batch carries visible columns only; recompute the index
            let visible_idx = schema
                .column_defs
                .iter()
                .filter(|d| !d.is_phy_addr())
                .position(|d| d.idx == sort_key.idx)
                .expect("sort key is never hidden");
            let key_col = batch.column(visible_idx);
            table.batch_dedup(std::slice::from_ref(key_col))?;
            for row in 0..key_col.len() {
                if key_col.is_valid(row) {
                    let key = key_col.key_at(row);
                    if !staged_keys.insert(key) {
                        return Err(TracedStorageError::duplicate(key_col.get(row)));
                    }
                }
            }
        }

        let max_rows = effective_block_max_rows(schema, &table.core.options) as usize;
        let total = batch.cardinality();
        let mut start = 0;
        while start < total {
            let end = (start + max_rows).min(total);
            let chunk = batch.slice(start, end);
            let (segment, segment_id) = table.segment_for_next_block()?;
            let block_id = table.alloc_block_id();
            let meta = seal_block(table, &segment, block_id, &chunk)?;
            table.note_block_sealed(segment_id);
            committed.push(TableOp::AppendBlock {
                segment: segment_id,
                block: block_id,
                rows: meta.rows,
            });
            staged_blocks.push(meta);
            touched.push(segment);
            start = end;
        }
        Ok(())
    }
}

impl Drop for ColumnarTransaction {
    fn drop(&mut self) {
        if !self.finished && !self.ops.is_empty() {
            warn!(txn = self.txn_id, "transaction dropped without commit, aborting");
        }
    }
}
