// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

//! Write-ahead log replay.
//!
//! Replay runs in three passes over the versioned log files: scan and
//! classify every entry, apply buffered checkpoints, then apply the ordered
//! entry list with checkpoint-range suppression. Uncommitted fragments are
//! buffered per `(group, txn)` and surface immediately before their
//! committing `Txn` entry; fragments whose transaction never commits are
//! dropped. A malformed entry truncates the file tail and ends that file's
//! scan; earlier files still apply.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

use tracing::{debug, warn};

use super::entry::{
    EntryInfo, EntryKind, EntryMeta, GroupId, Lsn, TxnId, ENTRY_META_SIZE,
};
use super::interval::ClosedIntervals;
use super::store::list_wal_files;
use crate::storage::{StorageResult, TracedStorageError};

/// Apply callback invoked for every surviving entry in replay order.
pub type ApplyFn<'a> =
    dyn FnMut(GroupId, Lsn, &[u8], EntryKind, Option<&EntryInfo>) -> StorageResult<()> + 'a;

/// Per-group merge function for uncommitted fragments.
pub type MergeFn = Box<dyn Fn(Vec<u8>, &[u8]) -> Vec<u8> + Send>;

/// The default merge policy: byte concatenation.
pub fn default_merge(mut prev: Vec<u8>, curr: &[u8]) -> Vec<u8> {
    prev.extend_from_slice(curr);
    prev
}

struct ReplayEntry {
    kind: EntryKind,
    group: GroupId,
    lsn: Lsn,
    txn_id: TxnId,
    payload: Vec<u8>,
}

/// Outcome of a replay run.
#[derive(Debug, Default)]
pub struct ReplaySummary {
    /// Maximum lsn observed per group, checkpointed entries included. Seeds
    /// the append store so fresh entries continue the sequence.
    pub group_lsns: HashMap<GroupId, Lsn>,
    /// Entries handed to the apply callback.
    pub applied: usize,
    /// Entries suppressed by checkpoint ranges.
    pub suppressed: usize,
    /// Files whose tail was truncated.
    pub truncated_files: usize,
}

/// Replays the versioned log files of one directory.
pub struct Replayer<'a> {
    apply: Box<ApplyFn<'a>>,
    merge_fns: HashMap<GroupId, MergeFn>,
}

impl<'a> Replayer<'a> {
    pub fn new(
        apply: impl FnMut(GroupId, Lsn, &[u8], EntryKind, Option<&EntryInfo>) -> StorageResult<()>
            + 'a,
    ) -> Self {
        Self {
            apply: Box::new(apply),
            merge_fns: HashMap::new(),
        }
    }

    /// Register a payload-merge function for one group. When present, a
    /// transaction's fragments and commit payload are folded into a single
    /// apply call; otherwise each fragment applies independently, in order.
    pub fn register_merge(&mut self, group: GroupId, merge: MergeFn) {
        self.merge_fns.insert(group, merge);
    }

    /// Scan, classify and apply. An apply failure is fatal and aborts
    /// replay immediately.
    pub fn replay(mut self, dir: impl AsRef<Path>) -> StorageResult<ReplaySummary> {
        let mut summary = ReplaySummary::default();
        let mut checkpoints: Vec<(EntryInfo, Vec<u8>)> = Vec::new();
        let mut checkpoint_range: HashMap<GroupId, ClosedIntervals> = HashMap::new();
        let mut uncommitted: HashMap<(GroupId, TxnId), Vec<Vec<u8>>> = HashMap::new();
        let mut entries: Vec<ReplayEntry> = Vec::new();

        // pass 1: scan every file in version order
        for (version, path) in list_wal_files(dir.as_ref())? {
            let truncated = self.scan_file(
                &path,
                &mut summary.group_lsns,
                &mut checkpoints,
                &mut checkpoint_range,
                &mut uncommitted,
                &mut entries,
            )?;
            if truncated {
                summary.truncated_files += 1;
            }
            debug!(version, entries = entries.len(), "scanned wal file");
        }

        // pass 2: checkpoints apply first, in log order
        for (info, payload) in &checkpoints {
            (self.apply)(
                info.group,
                info.group_lsn,
                payload,
                EntryKind::Checkpoint,
                Some(info),
            )
            .map_err(|e| TracedStorageError::fatal(format!("checkpoint apply failed: {}", e)))?;
            summary.applied += 1;
        }

        // pass 3: ordered entries with checkpoint suppression
        for entry in entries {
            if let Some(range) = checkpoint_range.get(&entry.group) {
                if range.contains_lsn(entry.lsn) {
                    summary.suppressed += 1;
                    continue;
                }
            }
            match entry.kind {
                EntryKind::Txn => {
                    let fragments = uncommitted
                        .remove(&(entry.group, entry.txn_id))
                        .unwrap_or_default();
                    if let Some(merge) = self.merge_fns.get(&entry.group) {
                        let mut merged = Vec::new();
                        for fragment in &fragments {
                            merged = merge(merged, fragment);
                        }
                        merged = merge(merged, &entry.payload);
                        (self.apply)(entry.group, entry.lsn, &merged, EntryKind::Txn, None)
                            .map_err(fatal_apply)?;
                        summary.applied += 1;
                    } else {
                        for fragment in &fragments {
                            (self.apply)(
                                entry.group,
                                entry.lsn,
                                fragment,
                                EntryKind::Uncommitted,
                                None,
                            )
                            .map_err(fatal_apply)?;
                            summary.applied += 1;
                        }
                        (self.apply)(entry.group, entry.lsn, &entry.payload, EntryKind::Txn, None)
                            .map_err(fatal_apply)?;
                        summary.applied += 1;
                    }
                }
                kind => {
                    (self.apply)(entry.group, entry.lsn, &entry.payload, kind, None)
                        .map_err(fatal_apply)?;
                    summary.applied += 1;
                }
            }
        }

        if !uncommitted.is_empty() {
            warn!(
                transactions = uncommitted.len(),
                "dropping uncommitted fragments without a committing txn"
            );
        }
        Ok(summary)
    }

    /// Scan one file; classify its entries. Returns whether the tail was
    /// truncated.
    #[allow(clippy::too_many_arguments)]
    fn scan_file(
        &mut self,
        path: &Path,
        group_lsns: &mut HashMap<GroupId, Lsn>,
        checkpoints: &mut Vec<(EntryInfo, Vec<u8>)>,
        checkpoint_range: &mut HashMap<GroupId, ClosedIntervals>,
        uncommitted: &mut HashMap<(GroupId, TxnId), Vec<Vec<u8>>>,
        entries: &mut Vec<ReplayEntry>,
    ) -> StorageResult<bool> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(TracedStorageError::from)?;
        let file_len = file.metadata().map_err(TracedStorageError::from)?.len();
        let mut offset = 0u64;

        let truncate_at = |at: u64| -> StorageResult<()> {
            warn!(path = %path.display(), at, "truncating wal tail");
            file.set_len(at).map_err(TracedStorageError::from)?;
            file.sync_data().map_err(TracedStorageError::from)?;
            Ok(())
        };

        loop {
            if offset + ENTRY_META_SIZE as u64 > file_len {
                // meta reads EOF: drop whatever partial bytes remain
                if offset < file_len {
                    truncate_at(offset)?;
                    return Ok(true);
                }
                return Ok(false);
            }
            let mut meta_bytes = [0u8; ENTRY_META_SIZE];
            file.read_exact_at(&mut meta_bytes, offset)
                .map_err(TracedStorageError::from)?;
            let meta = match EntryMeta::decode(&meta_bytes) {
                Some(meta) => meta,
                None => {
                    truncate_at(offset)?;
                    return Ok(true);
                }
            };
            let body_start = offset + ENTRY_META_SIZE as u64;
            if body_start + meta.body_len() > file_len {
                // payload length mismatch at the durable end of the file
                truncate_at(offset)?;
                return Ok(true);
            }
            let mut body = vec![0u8; meta.body_len() as usize];
            file.read_exact_at(&mut body, body_start)
                .map_err(TracedStorageError::from)?;
            if crc32fast::hash(&body) != meta.crc {
                truncate_at(offset)?;
                return Ok(true);
            }
            let (info_buf, payload) = body.split_at(meta.info_len as usize);
            let info = EntryInfo::decode(info_buf)?;

            let lsn_slot = group_lsns.entry(info.group).or_insert(0);
            *lsn_slot = (*lsn_slot).max(info.group_lsn);

            match meta.kind {
                EntryKind::Flush => {}
                EntryKind::Checkpoint => {
                    for decl in &info.checkpoints {
                        checkpoint_range
                            .entry(decl.group)
                            .or_default()
                            .merge_all(&decl.ranges);
                    }
                    checkpoints.push((info, payload.to_vec()));
                }
                EntryKind::Uncommitted => {
                    for group in &info.uncommits {
                        uncommitted
                            .entry((*group, info.txn_id))
                            .or_default()
                            .push(payload.to_vec());
                    }
                }
                EntryKind::Txn | EntryKind::Commit => {
                    entries.push(ReplayEntry {
                        kind: meta.kind,
                        group: info.group,
                        lsn: info.group_lsn,
                        txn_id: info.txn_id,
                        payload: payload.to_vec(),
                    });
                }
            }
            offset = body_start + meta.body_len();
        }
    }
}

fn fatal_apply(e: crate::storage::TracedStorageError) -> crate::storage::TracedStorageError {
    TracedStorageError::fatal(format!("wal apply failed: {}", e))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::super::entry::CheckpointDecl;
    use super::super::interval::ClosedInterval;
    use super::super::store::{wal_file_path, LogStore};
    use super::*;

    type Seen = Arc<Mutex<Vec<(GroupId, Lsn, Vec<u8>, EntryKind)>>>;

    fn collector() -> (Seen, impl FnMut(GroupId, Lsn, &[u8], EntryKind, Option<&EntryInfo>) -> StorageResult<()>)
    {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let apply = move |group: GroupId,
                          lsn: Lsn,
                          payload: &[u8],
                          kind: EntryKind,
                          _info: Option<&EntryInfo>| {
            sink.lock().unwrap().push((group, lsn, payload.to_vec(), kind));
            Ok(())
        };
        (seen, apply)
    }

    #[test]
    fn checkpoint_suppresses_ranges() {
        // S3: txn lsn 1, txn lsn 2, checkpoint covering [1,1], txn lsn 3.
        // Apply must see the checkpoint payload plus lsn 2 and lsn 3.
        let dir = tempfile::TempDir::new().unwrap();
        let store = LogStore::open(dir.path(), false, 1 << 20, HashMap::new()).unwrap();
        store
            .append(EntryKind::Txn, 1, 11, b"one".to_vec(), vec![], vec![])
            .unwrap();
        store
            .append(EntryKind::Txn, 1, 12, b"two".to_vec(), vec![], vec![])
            .unwrap();
        store
            .append(
                EntryKind::Checkpoint,
                1,
                0,
                b"ckp".to_vec(),
                vec![CheckpointDecl {
                    group: 1,
                    ranges: ClosedIntervals::from_interval(ClosedInterval::new(1, 1)),
                }],
                vec![],
            )
            .unwrap();
        store
            .append(EntryKind::Txn, 1, 13, b"three".to_vec(), vec![], vec![])
            .unwrap();
        drop(store);

        let (seen, apply) = collector();
        let summary = Replayer::new(apply).replay(dir.path()).unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.iter()
                .map(|(g, l, p, k)| (*g, *l, p.as_slice(), *k))
                .collect::<Vec<_>>(),
            vec![
                (1, 3, b"ckp".as_slice(), EntryKind::Checkpoint),
                (1, 2, b"two".as_slice(), EntryKind::Txn),
                (1, 4, b"three".as_slice(), EntryKind::Txn),
            ]
        );
        assert_eq!(summary.suppressed, 1);
        assert_eq!(summary.group_lsns[&1], 4);
    }

    #[test]
    fn uncommitted_fragments_apply_before_their_txn() {
        // S4: two uncommitted fragments for txn 7, then the committing txn.
        let dir = tempfile::TempDir::new().unwrap();
        let store = LogStore::open(dir.path(), false, 1 << 20, HashMap::new()).unwrap();
        store
            .append(EntryKind::Uncommitted, 1, 7, b"AB".to_vec(), vec![], vec![1])
            .unwrap();
        store
            .append(EntryKind::Uncommitted, 1, 7, b"CD".to_vec(), vec![], vec![1])
            .unwrap();
        store
            .append(EntryKind::Txn, 1, 7, b"EF".to_vec(), vec![], vec![])
            .unwrap();
        drop(store);

        let (seen, apply) = collector();
        Replayer::new(apply).replay(dir.path()).unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.iter()
                .map(|(_, _, p, k)| (p.as_slice(), *k))
                .collect::<Vec<_>>(),
            vec![
                (b"AB".as_slice(), EntryKind::Uncommitted),
                (b"CD".as_slice(), EntryKind::Uncommitted),
                (b"EF".as_slice(), EntryKind::Txn),
            ]
        );
    }

    #[test]
    fn registered_merge_folds_fragments() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LogStore::open(dir.path(), false, 1 << 20, HashMap::new()).unwrap();
        store
            .append(EntryKind::Uncommitted, 1, 7, b"AB".to_vec(), vec![], vec![1])
            .unwrap();
        store
            .append(EntryKind::Txn, 1, 7, b"EF".to_vec(), vec![], vec![])
            .unwrap();
        drop(store);

        let (seen, apply) = collector();
        let mut replayer = Replayer::new(apply);
        replayer.register_merge(1, Box::new(default_merge));
        replayer.replay(dir.path()).unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].2, b"ABEF".to_vec());
        assert_eq!(seen[0].3, EntryKind::Txn);
    }

    #[test]
    fn torn_tail_is_truncated() {
        // S6: cut the last entry mid-payload; replay keeps earlier entries
        // and truncates the file to the last complete one.
        let dir = tempfile::TempDir::new().unwrap();
        let store = LogStore::open(dir.path(), false, 1 << 20, HashMap::new()).unwrap();
        store
            .append(EntryKind::Commit, 1, 0, b"solid".to_vec(), vec![], vec![])
            .unwrap();
        store
            .append(EntryKind::Commit, 1, 0, b"torn-away".to_vec(), vec![], vec![])
            .unwrap();
        drop(store);

        let path = wal_file_path(dir.path(), 1);
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 4).unwrap();
        drop(file);

        let (seen, apply) = collector();
        let summary = Replayer::new(apply).replay(dir.path()).unwrap();
        assert_eq!(summary.truncated_files, 1);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].2, b"solid".to_vec());

        // the file now ends at the last complete entry: a second replay
        // truncates nothing
        let (_, apply) = collector();
        let summary = Replayer::new(apply).replay(dir.path()).unwrap();
        assert_eq!(summary.truncated_files, 0);
    }

    #[test]
    fn replay_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LogStore::open(dir.path(), false, 1 << 20, HashMap::new()).unwrap();
        for i in 0..5u8 {
            store
                .append(EntryKind::Commit, 1, 0, vec![i], vec![], vec![])
                .unwrap();
        }
        drop(store);

        let run = || {
            let (seen, apply) = collector();
            Replayer::new(apply).replay(dir.path()).unwrap();
            let seen = seen.lock().unwrap().clone();
            seen
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn apply_failure_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LogStore::open(dir.path(), false, 1 << 20, HashMap::new()).unwrap();
        store
            .append(EntryKind::Commit, 1, 0, vec![], vec![], vec![])
            .unwrap();
        drop(store);

        let err = Replayer::new(|_, _, _, _, _| Err(TracedStorageError::decode("boom")))
            .replay(dir.path())
            .unwrap_err();
        assert!(matches!(err.kind(), crate::storage::StorageError::Fatal(_)));
    }

    #[test]
    fn entries_across_files_apply_in_version_order() {
        let dir = tempfile::TempDir::new().unwrap();
        // tiny rotation threshold: every entry lands in its own file
        let store = LogStore::open(dir.path(), false, 1, HashMap::new()).unwrap();
        store
            .append(EntryKind::Commit, 1, 0, b"a".to_vec(), vec![], vec![])
            .unwrap();
        store
            .append(EntryKind::Commit, 1, 0, b"b".to_vec(), vec![], vec![])
            .unwrap();
        drop(store);

        let (seen, apply) = collector();
        Replayer::new(apply).replay(dir.path()).unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].2, b"a".to_vec());
        assert_eq!(seen[1].2, b"b".to_vec());
        assert_eq!(seen[0].1, 1);
        assert_eq!(seen[1].1, 2);
    }
}
