// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

//! The columnar table storage engine.
//!
//! [`ColumnarStorage`] owns a root directory: segment files per table plus
//! a `wal/` subdirectory of versioned log files. Opening the engine replays
//! the write-ahead log (checkpoint-suppressed) to rebuild every relation's
//! block arena; the column bytes themselves are recovered by each segment's
//! embedded inode log.

mod batch;
mod column_block;
mod error;
mod index;
mod iterator;
mod options;
pub mod segment;
mod table;
mod transaction;
pub mod wal;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::{Buf, BufMut};
use moka::sync::Cache;
use parking_lot::RwLock;
use tracing::{info, warn};

pub use batch::{Batch, ColumnVec};
pub use column_block::{stream_inode_id, BlockId, ColumnBlock, DeletesFile, StreamKind};
pub use error::{StorageError, StorageResult, TracedStorageError};
pub use index::ZoneMap;
pub use iterator::{BlockEntry, BlockIter, ScanRow, SegmentEntry, SegmentIter, TableScan};
pub use options::{CompressionType, StorageOptions};
pub use table::{phy_addr, split_phy_addr, BlockMeta, ColumnarTable, Filter};
pub use transaction::ColumnarTransaction;

use segment::{Segment, SegmentId};
use table::{list_segment_ids, segment_path, TableState};
use transaction::{decode_table_ops, TableOp};
use wal::{CheckpointDecl, ClosedInterval, ClosedIntervals, EntryKind, GroupId, LogStore, Replayer};

/// Group of catalog entries (create/drop table) in the WAL.
pub const GROUP_CATALOG: GroupId = 1;
/// First group id handed to user tables.
pub const GROUP_USER_BASE: GroupId = 10;

const CATALOG_OP_CREATE: u8 = 1;
const CATALOG_OP_DROP: u8 = 2;

/// Staged (not yet wired) state of one table during replay.
struct StagedTable {
    schema: crate::catalog::Schema,
    blocks: BTreeMap<BlockId, BlockMeta>,
    dropped_segments: Vec<SegmentId>,
}

#[derive(Default)]
struct ReplayStaging {
    tables: HashMap<GroupId, StagedTable>,
    next_table_id: GroupId,
}

struct EngineInner {
    tables: HashMap<String, ColumnarTable>,
    next_table_id: GroupId,
}

/// The storage engine.
pub struct ColumnarStorage {
    options: Arc<StorageOptions>,
    wal: Arc<LogStore>,
    cache: Cache<(u32, BlockId, u16), Arc<ColumnVec>>,
    inner: RwLock<EngineInner>,
}

impl ColumnarStorage {
    /// Open the engine rooted at `options.path`, replaying the write-ahead
    /// log. Replay failures are fatal and abort startup.
    pub fn open(options: StorageOptions) -> StorageResult<Self> {
        std::fs::create_dir_all(&options.path).map_err(TracedStorageError::from)?;
        let wal_dir = options.path.join("wal");

        let mut staging = ReplayStaging {
            next_table_id: GROUP_USER_BASE,
            ..Default::default()
        };
        let replayer = Replayer::new(|group, _lsn, payload, kind, _info| {
            apply_replay_entry(&mut staging, group, payload, kind)
        });
        let summary = replayer.replay(&wal_dir)?;
        info!(
            applied = summary.applied,
            suppressed = summary.suppressed,
            tables = staging.tables.len(),
            "replayed wal"
        );

        let wal = Arc::new(LogStore::open(
            &wal_dir,
            options.enable_fsync,
            options.wal_rotate_bytes,
            summary.group_lsns,
        )?);
        let options = Arc::new(options);
        let cache = Cache::new(options.cache_size);

        let mut tables = HashMap::new();
        let next_table_id = staging.next_table_id;
        for (table_id, staged) in staging.tables {
            let table = wire_table(&options, &wal, &cache, table_id, staged)?;
            tables.insert(table.name(), table);
        }

        Ok(Self {
            options,
            wal,
            cache,
            inner: RwLock::new(EngineInner {
                tables,
                next_table_id,
            }),
        })
    }

    /// Create a relation from a finalized schema.
    pub fn create_table(&self, schema: crate::catalog::Schema) -> StorageResult<ColumnarTable> {
        if !schema.is_finalized() {
            return Err(TracedStorageError::constraint(format!(
                "schema \"{}\" is not finalized",
                schema.name
            )));
        }
        if schema.phy_addr_def().is_none() {
            return Err(TracedStorageError::constraint(format!(
                "schema \"{}\" lacks the physical address column",
                schema.name
            )));
        }
        let mut inner = self.inner.write();
        if inner.tables.contains_key(&schema.name) {
            return Err(TracedStorageError::duplicate(&schema.name));
        }
        let table_id = inner.next_table_id;

        let mut payload = Vec::new();
        payload.put_u8(CATALOG_OP_CREATE);
        payload.put_u32(table_id);
        payload.extend_from_slice(&schema.serialize());
        self.wal
            .append(EntryKind::Commit, GROUP_CATALOG, 0, payload, vec![], vec![])?;

        let table = ColumnarTable::new(
            table_id,
            Arc::new(schema),
            self.options.clone(),
            self.wal.clone(),
            self.cache.clone(),
            TableState::new(),
        );
        inner.next_table_id += 1;
        inner.tables.insert(table.name(), table.clone());
        info!(table = table_id, name = %table.name(), "created table");
        Ok(table)
    }

    pub fn get_table(&self, name: &str) -> StorageResult<ColumnarTable> {
        self.inner
            .read()
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| TracedStorageError::not_found("table", name))
    }

    /// Drop a relation: journal the catalog entry, then release every
    /// segment. The drop is durable before the table leaves the live
    /// catalog, so a failed log append is a no-op.
    pub fn drop_table(&self, name: &str) -> StorageResult<()> {
        let table = {
            let mut inner = self.inner.write();
            let table = inner
                .tables
                .get(name)
                .cloned()
                .ok_or_else(|| TracedStorageError::not_found("table", name))?;

            let mut payload = Vec::new();
            payload.put_u8(CATALOG_OP_DROP);
            payload.put_u32(table.id());
            self.wal
                .append(EntryKind::Commit, GROUP_CATALOG, 0, payload, vec![], vec![])?;
            inner.tables.remove(name);
            table
        };
        for id in table.segment_ids() {
            if let Ok(seg) = table.segment(id) {
                if let Err(e) = seg.soft_delete() {
                    warn!(segment = id, error = %e, "soft delete failed");
                }
                let path = seg.path().to_path_buf();
                drop(seg);
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "could not unlink segment");
                }
            }
        }
        info!(name, "dropped table");
        Ok(())
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Write a checkpoint: a snapshot of every relation's block arena plus
    /// declarations that all previously applied lsn ranges are durable and
    /// may be skipped at the next replay.
    pub fn checkpoint(&self) -> StorageResult<()> {
        let inner = self.inner.read();
        let mut payload = Vec::new();
        payload.put_u32(inner.tables.len() as u32);
        let mut decls = Vec::new();

        let catalog_lsn = self.wal.group_lsn(GROUP_CATALOG);
        if catalog_lsn > 0 {
            decls.push(CheckpointDecl {
                group: GROUP_CATALOG,
                ranges: ClosedIntervals::from_interval(ClosedInterval::new(1, catalog_lsn)),
            });
        }
        payload.put_u32(inner.next_table_id);
        for table in inner.tables.values() {
            // read the lsn before snapshotting the arena: a commit that
            // lands in between replays on top of the snapshot, which is
            // idempotent, whereas the reverse order would lose it
            let table_lsn = self.wal.group_lsn(table.id());
            payload.put_u32(table.id());
            let schema_bytes = table.schema().serialize();
            payload.put_u64(schema_bytes.len() as u64);
            payload.put_slice(&schema_bytes);
            let metas = table.block_metas();
            payload.put_u32(metas.len() as u32);
            for meta in &metas {
                payload.put_u32(meta.id);
                payload.put_u32(meta.segment_id);
                payload.put_u32(meta.rows);
                payload.put_u16(meta.update_lens.len() as u16);
                for len in &meta.update_lens {
                    payload.put_u64(*len);
                }
                payload.put_u64(meta.delete_len);
            }
            if table_lsn > 0 {
                decls.push(CheckpointDecl {
                    group: table.id(),
                    ranges: ClosedIntervals::from_interval(ClosedInterval::new(1, table_lsn)),
                });
            }
        }
        drop(inner);

        self.wal.append(
            EntryKind::Checkpoint,
            GROUP_CATALOG,
            0,
            payload,
            decls,
            vec![],
        )?;
        info!("wrote engine checkpoint");
        Ok(())
    }

    /// Flush the log and every open segment to stable storage. A `Flush`
    /// marker records the sync position for the next replay.
    pub fn shutdown(&self) -> StorageResult<()> {
        self.wal
            .append(EntryKind::Flush, GROUP_CATALOG, 0, Vec::new(), vec![], vec![])?;
        self.wal.sync()?;
        let inner = self.inner.read();
        for table in inner.tables.values() {
            for id in table.segment_ids() {
                if let Ok(seg) = table.segment(id) {
                    seg.sync()?;
                }
            }
        }
        info!("storage engine shut down");
        Ok(())
    }
}

/// The replay apply callback: rebuilds staged table state from log entries.
fn apply_replay_entry(
    staging: &mut ReplayStaging,
    group: GroupId,
    payload: &[u8],
    kind: EntryKind,
) -> StorageResult<()> {
    match (kind, group) {
        (EntryKind::Checkpoint, _) => restore_snapshot(staging, payload),
        (_, GROUP_CATALOG) => apply_catalog_op(staging, payload),
        (_, group) if group >= GROUP_USER_BASE => {
            let staged = staging.tables.get_mut(&group).ok_or_else(|| {
                TracedStorageError::fatal(format!("log entry for unknown table group {}", group))
            })?;
            for op in decode_table_ops(payload)? {
                apply_table_op(staged, op);
            }
            Ok(())
        }
        (kind, group) => {
            warn!(?kind, group, "ignoring log entry in reserved group");
            Ok(())
        }
    }
}

fn apply_catalog_op(staging: &mut ReplayStaging, mut payload: &[u8]) -> StorageResult<()> {
    let buf = &mut payload;
    if buf.remaining() < 5 {
        return Err(TracedStorageError::decode("truncated catalog op"));
    }
    let op = buf.get_u8();
    let table_id = buf.get_u32();
    match op {
        CATALOG_OP_CREATE => {
            let schema = crate::catalog::Schema::deserialize(*buf)?;
            staging.tables.insert(
                table_id,
                StagedTable {
                    schema,
                    blocks: BTreeMap::new(),
                    dropped_segments: Vec::new(),
                },
            );
            staging.next_table_id = staging.next_table_id.max(table_id + 1);
            Ok(())
        }
        CATALOG_OP_DROP => {
            staging.tables.remove(&table_id);
            Ok(())
        }
        op => Err(TracedStorageError::decode(format!(
            "unknown catalog op {}",
            op
        ))),
    }
}

fn apply_table_op(staged: &mut StagedTable, op: TableOp) {
    match op {
        TableOp::AppendBlock {
            segment,
            block,
            rows,
        } => {
            staged.blocks.insert(
                block,
                BlockMeta {
                    id: block,
                    segment_id: segment,
                    rows,
                    update_lens: vec![0; staged.schema.column_count()],
                    delete_len: 0,
                },
            );
        }
        TableOp::Update {
            block,
            col,
            new_len,
        } => {
            if let Some(meta) = staged.blocks.get_mut(&block) {
                if let Some(len) = meta.update_lens.get_mut(col as usize) {
                    *len = (*len).max(new_len);
                }
            }
        }
        TableOp::Delete { block, new_len } => {
            if let Some(meta) = staged.blocks.get_mut(&block) {
                meta.delete_len = meta.delete_len.max(new_len);
            }
        }
        TableOp::DropSegment { segment } => {
            staged.blocks.retain(|_, meta| meta.segment_id != segment);
            staged.dropped_segments.push(segment);
        }
    }
}

fn restore_snapshot(staging: &mut ReplayStaging, mut payload: &[u8]) -> StorageResult<()> {
    let buf = &mut payload;
    if buf.remaining() < 8 {
        return Err(TracedStorageError::decode("truncated checkpoint snapshot"));
    }
    let table_count = buf.get_u32();
    staging.tables.clear();
    staging.next_table_id = staging.next_table_id.max(buf.get_u32());
    for _ in 0..table_count {
        if buf.remaining() < 12 {
            return Err(TracedStorageError::decode("truncated checkpoint table"));
        }
        let table_id = buf.get_u32();
        let schema_len = buf.get_u64() as usize;
        if buf.remaining() < schema_len {
            return Err(TracedStorageError::decode("truncated checkpoint schema"));
        }
        let schema = crate::catalog::Schema::deserialize(&buf[..schema_len])?;
        buf.advance(schema_len);
        let block_count = buf.get_u32();
        let mut blocks = BTreeMap::new();
        for _ in 0..block_count {
            if buf.remaining() < 14 {
                return Err(TracedStorageError::decode("truncated checkpoint block"));
            }
            let id = buf.get_u32();
            let segment_id = buf.get_u32();
            let rows = buf.get_u32();
            let col_count = buf.get_u16() as usize;
            if buf.remaining() < col_count * 8 + 8 {
                return Err(TracedStorageError::decode("truncated checkpoint block"));
            }
            let update_lens = (0..col_count).map(|_| buf.get_u64()).collect();
            let delete_len = buf.get_u64();
            blocks.insert(
                id,
                BlockMeta {
                    id,
                    segment_id,
                    rows,
                    update_lens,
                    delete_len,
                },
            );
        }
        staging.tables.insert(
            table_id,
            StagedTable {
                schema,
                blocks,
                dropped_segments: Vec::new(),
            },
        );
    }
    Ok(())
}

/// Turn a staged table into a live one: open its segments and rebuild the
/// append cursor.
fn wire_table(
    options: &Arc<StorageOptions>,
    wal: &Arc<LogStore>,
    cache: &Cache<(u32, BlockId, u16), Arc<ColumnVec>>,
    table_id: GroupId,
    staged: StagedTable,
) -> StorageResult<ColumnarTable> {
    let mut state = TableState::new();
    // a torn commit may have created a segment file no block references;
    // never hand its id out again, or the next rollover would collide with
    // the orphan on disk
    for id in list_segment_ids(options, table_id)? {
        state.next_segment_id = state.next_segment_id.max(id + 1);
    }
    for meta in staged.blocks.values() {
        if !state.segments.contains_key(&meta.segment_id) {
            let path = segment_path(options, table_id, meta.segment_id);
            let segment = Segment::open(meta.segment_id, &path)?;
            // a torn commit may have sealed streams whose block never made
            // it into the log; never hand their block ids out again
            for inode_id in segment.inode_ids() {
                let sealed_block = (inode_id >> 32) as BlockId;
                state.next_block_id = state.next_block_id.max(sealed_block + 1);
            }
            state.segments.insert(meta.segment_id, segment);
        }
        state.next_segment_id = state.next_segment_id.max(meta.segment_id + 1);
        state.next_block_id = state.next_block_id.max(meta.id + 1);
    }
    for dropped in &staged.dropped_segments {
        state.next_segment_id = state.next_segment_id.max(dropped + 1);
        let path = segment_path(options, table_id, *dropped);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "could not unlink dropped segment");
            }
        }
    }
    // resume appends into the youngest segment if it still has block slots
    if let Some(last_segment) = state.segments.keys().max().copied() {
        let in_last = staged
            .blocks
            .values()
            .filter(|m| m.segment_id == last_segment)
            .count() as u16;
        let max_blocks = table::effective_segment_max_blocks(&staged.schema, options);
        if in_last < max_blocks {
            state.current_segment = Some(last_segment);
            state.blocks_in_current = in_last;
        }
    }
    state.blocks = staged.blocks;

    Ok(ColumnarTable::new(
        table_id,
        Arc::new(staged.schema),
        options.clone(),
        wal.clone(),
        cache.clone(),
        state,
    ))
}
