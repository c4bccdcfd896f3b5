// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::column_block::BlockId;
use super::segment::SegmentId;
use super::table::{phy_addr, BlockMeta, ColumnarTable};
use super::StorageResult;
use crate::types::Value;

/// Snapshot view of one segment, yielded by [`SegmentIter`].
#[derive(Clone, Debug)]
pub struct SegmentEntry {
    pub id: SegmentId,
    pub block_count: usize,
    pub in_use_bytes: u64,
    pub read_only: bool,
}

/// Iterator over the live segments of a relation, in id order. Operates on
/// a snapshot: segments created or dropped afterwards are not reflected.
pub struct SegmentIter {
    entries: VecDeque<SegmentEntry>,
}

impl SegmentIter {
    pub(crate) fn new(table: &ColumnarTable) -> Self {
        let metas = table.block_metas();
        let mut entries = VecDeque::new();
        for id in table.segment_ids() {
            if let Ok(segment) = table.segment(id) {
                entries.push_back(SegmentEntry {
                    id,
                    block_count: metas.iter().filter(|m| m.segment_id == id).count(),
                    in_use_bytes: segment.in_use_bytes(),
                    read_only: segment.is_read_only(),
                });
            }
        }
        Self { entries }
    }
}

impl Iterator for SegmentIter {
    type Item = SegmentEntry;

    fn next(&mut self) -> Option<SegmentEntry> {
        self.entries.pop_front()
    }
}

/// Snapshot view of one block, yielded by [`BlockIter`].
#[derive(Clone, Debug)]
pub struct BlockEntry {
    pub id: BlockId,
    pub segment_id: SegmentId,
    pub rows: u32,
    pub visible_rows: u32,
}

/// Iterator over the blocks of a relation in id (= insertion) order.
pub struct BlockIter {
    table: ColumnarTable,
    metas: VecDeque<BlockMeta>,
}

impl BlockIter {
    pub(crate) fn new(table: &ColumnarTable) -> Self {
        Self {
            table: table.clone(),
            metas: table.block_metas().into(),
        }
    }
}

impl Iterator for BlockIter {
    type Item = StorageResult<BlockEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let meta = self.metas.pop_front()?;
        Some(self.table.visible_rows(&meta).map(|visible| BlockEntry {
            id: meta.id,
            segment_id: meta.segment_id,
            rows: meta.rows,
            visible_rows: visible,
        }))
    }
}

/// One visible row produced by a scan.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanRow {
    /// Hidden key of the row.
    pub key: u64,
    /// User-visible column values in schema order.
    pub values: Vec<Value>,
}

/// Full scan over the visible rows of a relation, block by block in
/// insertion order. Rows covered by a delete stream are skipped; updates
/// are overlaid. An optional deadline bounds the scan; exceeding it yields
/// `Timeout`.
pub struct TableScan {
    table: ColumnarTable,
    metas: VecDeque<BlockMeta>,
    deadline: Option<Instant>,
    /// Schema positions of the user-visible columns.
    visible: Vec<usize>,
    current: Option<MaterializedBlock>,
}

struct MaterializedBlock {
    meta: BlockMeta,
    columns: Vec<crate::storage::batch::ColumnVec>,
    mask: bitvec::vec::BitVec<u8, bitvec::order::Lsb0>,
    next_row: u32,
}

impl TableScan {
    pub(crate) fn new(table: &ColumnarTable, timeout: Option<Duration>) -> Self {
        let visible = table
            .schema()
            .column_defs
            .iter()
            .filter(|d| !d.hidden)
            .map(|d| d.idx)
            .collect();
        Self {
            table: table.clone(),
            metas: table.block_metas().into(),
            deadline: timeout.map(|t| Instant::now() + t),
            visible,
            current: None,
        }
    }
}

impl Iterator for TableScan {
    type Item = StorageResult<ScanRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let meta = self.metas.pop_front()?;
                match self.table.materialize_block(&meta, self.deadline) {
                    Ok((columns, mask)) => {
                        self.current = Some(MaterializedBlock {
                            meta,
                            columns,
                            mask,
                            next_row: 0,
                        });
                    }
                    Err(e) => return Some(Err(e)),
                }
            }
            let block = self.current.as_mut().expect("set above");
            while block.next_row < block.meta.rows {
                let row = block.next_row as usize;
                block.next_row += 1;
                if block.mask[row] {
                    continue;
                }
                let values = self
                    .visible
                    .iter()
                    .map(|&idx| block.columns[idx].get(row))
                    .collect();
                return Some(Ok(ScanRow {
                    key: phy_addr(block.meta.id, row as u32),
                    values,
                }));
            }
            self.current = None;
        }
    }
}

impl ColumnarTable {
    /// `MakeSegmentIterator()`.
    pub fn segment_iter(&self) -> SegmentIter {
        SegmentIter::new(self)
    }

    /// `MakeBlockIterator()`.
    pub fn block_iter(&self) -> BlockIter {
        BlockIter::new(self)
    }

    /// Scan every visible row, optionally bounded by a deadline.
    pub fn scan(&self, timeout: Option<Duration>) -> TableScan {
        TableScan::new(self, timeout)
    }
}
