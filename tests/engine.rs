// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

//! End-to-end scenarios: append/scan, dedup, point operations by filter and
//! hidden key, and crash recovery through the write-ahead log.

use std::time::Duration;

use colstore::catalog::Schema;
use colstore::storage::{
    Batch, ColumnVec, ColumnarStorage, Filter, StorageError, StorageOptions,
};
use colstore::types::{LogicalType, Value};

fn two_column_schema(block_max_rows: u32) -> Schema {
    let mut schema = Schema::new("t");
    schema.block_max_rows = block_max_rows;
    schema.segment_max_blocks = 2;
    schema.append_pk_column("a", LogicalType::Int32, 0).unwrap();
    schema
        .append_column("b", LogicalType::Varchar { width: 32 })
        .unwrap();
    schema.finalize(true).unwrap();
    schema
}

fn rows_batch(rows: &[(i32, &str)]) -> Batch {
    let a = ColumnVec::from_values(
        LogicalType::Int32,
        rows.iter().map(|(a, _)| Value::Int32(*a)),
    )
    .unwrap();
    let b = ColumnVec::from_values(
        LogicalType::Varchar { width: 32 },
        rows.iter().map(|(_, b)| Value::String(b.to_string())),
    )
    .unwrap();
    Batch::new(vec![a, b]).unwrap()
}

fn open_engine(dir: &tempfile::TempDir) -> ColumnarStorage {
    ColumnarStorage::open(StorageOptions::default_for_test(dir.path())).unwrap()
}

#[test]
fn append_and_scan() {
    // five rows with block_max_rows = 4: two blocks, full scan in insertion
    // order, point lookup by filter
    let dir = tempfile::TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let table = engine.create_table(two_column_schema(4)).unwrap();

    let mut txn = table.begin();
    txn.append(rows_batch(&[
        (1, "x"),
        (2, "y"),
        (3, "z"),
        (4, "w"),
        (5, "u"),
    ]))
    .unwrap();
    txn.commit().unwrap();

    let blocks: Vec<_> = table.block_iter().map(|b| b.unwrap()).collect();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].rows, 4);
    assert_eq!(blocks[1].rows, 1);
    assert_eq!(table.rows().unwrap(), 5);

    let rows: Vec<_> = table.scan(None).map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 5);
    let keys: Vec<Value> = rows.iter().map(|r| r.values[0].clone()).collect();
    assert_eq!(
        keys,
        vec![
            Value::Int32(1),
            Value::Int32(2),
            Value::Int32(3),
            Value::Int32(4),
            Value::Int32(5)
        ]
    );
    assert_eq!(rows[2].values[1], Value::String("z".into()));

    let (block, row) = table.get_by_filter(&Filter::eq(Value::Int32(3))).unwrap();
    assert_eq!((block, row), (blocks[0].id, 2));
    assert_eq!(
        table.get_value(block, row, "b").unwrap(),
        Value::String("z".into())
    );
}

#[test]
fn batch_dedup_reports_first_conflict() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let table = engine.create_table(two_column_schema(4)).unwrap();

    let mut txn = table.begin();
    txn.append(rows_batch(&[(1, "a"), (2, "b"), (3, "c")])).unwrap();
    txn.commit().unwrap();

    let probe =
        ColumnVec::from_values(LogicalType::Int32, [Value::Int32(3), Value::Int32(4)]).unwrap();
    let err = table.batch_dedup(std::slice::from_ref(&probe)).unwrap_err();
    assert!(
        matches!(err.kind(), StorageError::Duplicate(key) if key == "3"),
        "unexpected error: {}",
        err
    );

    let probe =
        ColumnVec::from_values(LogicalType::Int32, [Value::Int32(4), Value::Int32(5)]).unwrap();
    table.batch_dedup(std::slice::from_ref(&probe)).unwrap();
}

#[test]
fn append_rejects_duplicate_keys() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let table = engine.create_table(two_column_schema(4)).unwrap();

    let mut txn = table.begin();
    txn.append(rows_batch(&[(1, "a"), (2, "b")])).unwrap();
    txn.commit().unwrap();

    let mut txn = table.begin();
    txn.append(rows_batch(&[(2, "dup")])).unwrap();
    let err = txn.commit().unwrap_err();
    assert!(matches!(err.kind(), StorageError::Duplicate(_)));
    // the failed commit published nothing
    assert_eq!(table.rows().unwrap(), 2);
}

#[test]
fn update_and_delete_visibility() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let table = engine.create_table(two_column_schema(4)).unwrap();

    let mut txn = table.begin();
    txn.append(rows_batch(&[(1, "a"), (2, "b"), (3, "c")])).unwrap();
    txn.commit().unwrap();

    let (block, row) = table.get_by_filter(&Filter::eq(Value::Int32(2))).unwrap();

    // update commits, then reads see the new value
    let mut txn = table.begin();
    txn.update(block, row, "b", Value::String("B".into())).unwrap();
    txn.commit().unwrap();
    assert_eq!(
        table.get_value(block, row, "b").unwrap(),
        Value::String("B".into())
    );

    // an aborted mutation stays invisible
    let mut txn = table.begin();
    txn.update(block, row, "b", Value::String("never".into())).unwrap();
    txn.abort();
    assert_eq!(
        table.get_value(block, row, "b").unwrap(),
        Value::String("B".into())
    );

    // range delete hides the row from every read path
    let mut txn = table.begin();
    txn.range_delete(block, row, row + 1).unwrap();
    txn.commit().unwrap();
    assert!(table.get_value(block, row, "b").is_err());
    assert!(table.get_by_filter(&Filter::eq(Value::Int32(2))).is_err());
    assert_eq!(table.rows().unwrap(), 2);

    // deleted keys no longer conflict on dedup
    let probe = ColumnVec::from_values(LogicalType::Int32, [Value::Int32(2)]).unwrap();
    table.batch_dedup(std::slice::from_ref(&probe)).unwrap();
}

#[test]
fn hidden_key_operations() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let table = engine.create_table(two_column_schema(8)).unwrap();

    let mut txn = table.begin();
    txn.append(rows_batch(&[(10, "ten"), (20, "twenty"), (30, "thirty")]))
        .unwrap();
    txn.commit().unwrap();

    let keys: Vec<u64> = table.scan(None).map(|r| r.unwrap().key).collect();
    assert_eq!(keys.len(), 3);

    assert_eq!(
        table.get_value_by_hidden_key(keys[1], "b").unwrap(),
        Value::String("twenty".into())
    );

    let mut txn = table.begin();
    txn.update_by_hidden_key(keys[1], "b", Value::String("XX".into()))
        .unwrap();
    txn.commit().unwrap();
    assert_eq!(
        table.get_value_by_hidden_key(keys[1], "b").unwrap(),
        Value::String("XX".into())
    );

    let mut txn = table.begin();
    txn.delete_by_hidden_keys(&[keys[0], keys[2]]).unwrap();
    txn.commit().unwrap();
    assert_eq!(table.rows().unwrap(), 1);
    assert!(table.get_value_by_hidden_key(keys[0], "b").is_err());

    // filter-based forms resolve to hidden keys internally
    let mut txn = table.begin();
    txn.update_by_filter(&Filter::eq(Value::Int32(20)), "b", Value::String("YY".into()))
        .unwrap();
    txn.commit().unwrap();
    let mut txn = table.begin();
    txn.delete_by_filter(&Filter::eq(Value::Int32(20))).unwrap();
    txn.commit().unwrap();
    assert_eq!(table.rows().unwrap(), 0);
}

#[test]
fn reopen_recovers_committed_state() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let engine = open_engine(&dir);
        let table = engine.create_table(two_column_schema(4)).unwrap();
        let mut txn = table.begin();
        txn.append(rows_batch(&[(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")]))
            .unwrap();
        txn.commit().unwrap();

        let (block, row) = table.get_by_filter(&Filter::eq(Value::Int32(4))).unwrap();
        let mut txn = table.begin();
        txn.update(block, row, "b", Value::String("D".into())).unwrap();
        txn.commit().unwrap();
        let mut txn = table.begin();
        txn.delete_by_filter(&Filter::eq(Value::Int32(1))).unwrap();
        txn.commit().unwrap();
        engine.shutdown().unwrap();
    }

    let engine = open_engine(&dir);
    let table = engine.get_table("t").unwrap();
    assert_eq!(table.rows().unwrap(), 4);
    let rows: Vec<_> = table.scan(None).map(|r| r.unwrap()).collect();
    assert_eq!(rows[0].values[0], Value::Int32(2));
    let (block, row) = table.get_by_filter(&Filter::eq(Value::Int32(4))).unwrap();
    assert_eq!(
        table.get_value(block, row, "b").unwrap(),
        Value::String("D".into())
    );

    // the relation is appendable after recovery
    let mut txn = table.begin();
    txn.append(rows_batch(&[(6, "f")])).unwrap();
    txn.commit().unwrap();
    assert_eq!(table.rows().unwrap(), 5);
}

#[test]
fn reopen_after_checkpoint() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let engine = open_engine(&dir);
        let table = engine.create_table(two_column_schema(4)).unwrap();
        let mut txn = table.begin();
        txn.append(rows_batch(&[(1, "a"), (2, "b")])).unwrap();
        txn.commit().unwrap();

        engine.checkpoint().unwrap();

        // post-checkpoint traffic replays on top of the snapshot
        let mut txn = table.begin();
        txn.append(rows_batch(&[(3, "c")])).unwrap();
        txn.commit().unwrap();
        engine.shutdown().unwrap();
    }

    let engine = open_engine(&dir);
    let table = engine.get_table("t").unwrap();
    assert_eq!(table.rows().unwrap(), 3);
    let keys: Vec<Value> = table
        .scan(None)
        .map(|r| r.unwrap().values[0].clone())
        .collect();
    assert_eq!(
        keys,
        vec![Value::Int32(1), Value::Int32(2), Value::Int32(3)]
    );
}

#[test]
fn torn_wal_tail_recovers_previous_entry() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let engine = open_engine(&dir);
        let table = engine.create_table(two_column_schema(4)).unwrap();
        let mut txn = table.begin();
        txn.append(rows_batch(&[(1, "a")])).unwrap();
        txn.commit().unwrap();
        let mut txn = table.begin();
        txn.append(rows_batch(&[(2, "b")])).unwrap();
        txn.commit().unwrap();
        // no orderly shutdown: this run "crashes" here
    }

    // cut the newest wal file in the middle of its last entry's payload
    let wal_dir = dir.path().join("wal");
    let mut wal_files: Vec<_> = std::fs::read_dir(&wal_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    wal_files.sort();
    let last = wal_files.last().unwrap();
    let len = std::fs::metadata(last).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(last).unwrap();
    file.set_len(len - 3).unwrap();
    file.sync_all().unwrap();
    drop(file);

    let engine = open_engine(&dir);
    let table = engine.get_table("t").unwrap();
    // the torn commit is gone, the earlier one survives
    assert_eq!(table.rows().unwrap(), 1);
    let rows: Vec<_> = table.scan(None).map(|r| r.unwrap()).collect();
    assert_eq!(rows[0].values[0], Value::Int32(1));

    // the engine accepts new commits after truncation
    let mut txn = table.begin();
    txn.append(rows_batch(&[(9, "i")])).unwrap();
    txn.commit().unwrap();
    assert_eq!(table.rows().unwrap(), 2);
}

#[test]
fn orphan_segment_file_does_not_wedge_appends() {
    // a commit that rolls into a fresh segment creates the file before its
    // log entry is durable; crashing in that window leaves an orphan .seg
    // whose id must never be reissued
    let dir = tempfile::TempDir::new().unwrap();
    {
        let engine = open_engine(&dir);
        // 2 rows per block, 2 blocks per segment
        let table = engine.create_table(two_column_schema(2)).unwrap();
        let mut txn = table.begin();
        txn.append(rows_batch(&[(1, "a"), (2, "b"), (3, "c"), (4, "d")]))
            .unwrap();
        txn.commit().unwrap();
        // this commit fills segment 1
        let mut txn = table.begin();
        txn.append(rows_batch(&[(5, "e"), (6, "f")])).unwrap();
        txn.commit().unwrap();
        // no orderly shutdown: this run "crashes" here
    }

    // cut the second commit's log entry: segment 1 is now an orphan file
    let wal_dir = dir.path().join("wal");
    let mut wal_files: Vec<_> = std::fs::read_dir(&wal_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    wal_files.sort();
    let last = wal_files.last().unwrap();
    let len = std::fs::metadata(last).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(last).unwrap();
    file.set_len(len - 3).unwrap();
    file.sync_all().unwrap();
    drop(file);
    let orphan = dir.path().join("10_0001.seg");
    assert!(orphan.exists());

    let engine = open_engine(&dir);
    let table = engine.get_table("t").unwrap();
    assert_eq!(table.rows().unwrap(), 4);

    // segment 0 is full, so this rolls into a fresh segment; it must not
    // collide with the orphan file
    let mut txn = table.begin();
    txn.append(rows_batch(&[(7, "g"), (8, "h")])).unwrap();
    txn.commit().unwrap();
    assert_eq!(table.rows().unwrap(), 6);
    let keys: Vec<Value> = table
        .scan(None)
        .map(|r| r.unwrap().values[0].clone())
        .collect();
    assert_eq!(
        keys,
        vec![
            Value::Int32(1),
            Value::Int32(2),
            Value::Int32(3),
            Value::Int32(4),
            Value::Int32(7),
            Value::Int32(8)
        ]
    );
    // the orphan is untouched and the new block lives past it
    assert!(orphan.exists());
    assert!(dir.path().join("10_0002.seg").exists());
}

#[test]
fn segments_roll_over_and_iterate() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = open_engine(&dir);
    // 2 rows per block, 2 blocks per segment
    let table = engine.create_table(two_column_schema(2)).unwrap();

    let rows: Vec<(i32, String)> = (0..10).map(|i| (i, format!("r{}", i))).collect();
    let rows_ref: Vec<(i32, &str)> = rows.iter().map(|(a, b)| (*a, b.as_str())).collect();
    let mut txn = table.begin();
    txn.append(rows_batch(&rows_ref)).unwrap();
    txn.commit().unwrap();

    // 5 blocks at 2 rows each across segments capped at 2 blocks
    let blocks: Vec<_> = table.block_iter().map(|b| b.unwrap()).collect();
    assert_eq!(blocks.len(), 5);
    let segments: Vec<_> = table.segment_iter().collect();
    assert_eq!(segments.len(), 3);
    assert_eq!(segments.iter().map(|s| s.block_count).sum::<usize>(), 5);
    assert_eq!(table.rows().unwrap(), 10);
}

#[test]
fn scan_deadline_times_out() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let table = engine.create_table(two_column_schema(4)).unwrap();
    let mut txn = table.begin();
    txn.append(rows_batch(&[(1, "a")])).unwrap();
    txn.commit().unwrap();

    let err = table
        .scan(Some(Duration::ZERO))
        .next()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err.kind(), StorageError::Timeout(_)));
}

#[test]
fn drop_table_removes_files() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let table = engine.create_table(two_column_schema(4)).unwrap();
    let mut txn = table.begin();
    txn.append(rows_batch(&[(1, "a")])).unwrap();
    txn.commit().unwrap();
    drop(table);

    engine.drop_table("t").unwrap();
    assert!(engine.get_table("t").is_err());
    let seg_files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("seg"))
        .collect();
    assert!(seg_files.is_empty(), "left behind: {:?}", seg_files);

    // the drop is durable
    engine.shutdown().unwrap();
    drop(engine);
    let engine = open_engine(&dir);
    assert!(engine.get_table("t").is_err());
}

#[test]
fn drop_segment_releases_its_blocks() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = open_engine(&dir);
    // 2 rows per block, 2 blocks per segment: 6 rows fill segment 0 and
    // spill into segment 1
    let table = engine.create_table(two_column_schema(2)).unwrap();
    let mut txn = table.begin();
    txn.append(rows_batch(&[
        (1, "a"),
        (2, "b"),
        (3, "c"),
        (4, "d"),
        (5, "e"),
        (6, "f"),
    ]))
    .unwrap();
    txn.commit().unwrap();
    assert!(table.size("b").unwrap() > 0);

    let first_segment = table.segment_iter().next().unwrap().id;
    let mut txn = table.begin();
    txn.drop_segment(first_segment).unwrap();
    txn.commit().unwrap();

    // rows of segment 0 are gone, the rest survive
    assert_eq!(table.rows().unwrap(), 2);
    let keys: Vec<Value> = table
        .scan(None)
        .map(|r| r.unwrap().values[0].clone())
        .collect();
    assert_eq!(keys, vec![Value::Int32(5), Value::Int32(6)]);
    assert!(table.get_by_filter(&Filter::eq(Value::Int32(1))).is_err());

    // the drop is durable across restart
    engine.shutdown().unwrap();
    drop(table);
    drop(engine);
    let engine = open_engine(&dir);
    let table = engine.get_table("t").unwrap();
    assert_eq!(table.rows().unwrap(), 2);
    assert_eq!(table.segment_iter().count(), 1);
}

#[test]
fn mock_helpers_drive_large_appends() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let schema = colstore::test_util::mock_schema(3, Some(0));
    let table = engine.create_table(schema).unwrap();

    let batch = colstore::test_util::mock_batch(table.schema(), 100, 0).unwrap();
    let mut txn = table.begin();
    txn.append(batch).unwrap();
    txn.commit().unwrap();

    assert_eq!(table.rows().unwrap(), 100);
    // 100 rows at 16 rows per block
    assert_eq!(table.block_iter().count(), 7);
    let (block, row) = table.get_by_filter(&Filter::eq(Value::Int32(42))).unwrap();
    assert_eq!(table.get_value(block, row, "mock_0").unwrap(), Value::Int32(42));
}
