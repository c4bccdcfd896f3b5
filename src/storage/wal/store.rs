// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::info;

use super::entry::{CheckpointDecl, EntryInfo, EntryKind, GroupId, LogEntry, Lsn, TxnId};
use crate::storage::{StorageResult, TracedStorageError};

pub const WAL_FILE_SUFFIX: &str = "wal";

/// List the versioned log files under `dir`, ascending by version.
pub fn list_wal_files(dir: &Path) -> StorageResult<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in std::fs::read_dir(dir).map_err(TracedStorageError::from)? {
        let entry = entry.map_err(TracedStorageError::from)?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(WAL_FILE_SUFFIX) {
            continue;
        }
        if let Some(version) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            files.push((version, path));
        }
    }
    files.sort_by_key(|(version, _)| *version);
    Ok(files)
}

pub fn wal_file_path(dir: &Path, version: u64) -> PathBuf {
    dir.join(format!("{:08}.{}", version, WAL_FILE_SUFFIX))
}

struct StoreInner {
    version: u64,
    file: File,
    write_offset: u64,
    group_lsns: HashMap<GroupId, Lsn>,
}

/// Append side of the write-ahead log.
///
/// Entries are assigned per-group lsns under the store lock, so two
/// concurrent commits to one relation serialize into lsn order. With
/// `enable_fsync`, an append returns only after the entry is durable.
pub struct LogStore {
    dir: PathBuf,
    enable_fsync: bool,
    rotate_bytes: u64,
    inner: Mutex<StoreInner>,
}

impl LogStore {
    /// Open the store for appending. `group_lsns` carries the maximum lsn
    /// per group observed by replay; new entries continue after them.
    pub fn open(
        dir: impl AsRef<Path>,
        enable_fsync: bool,
        rotate_bytes: u64,
        group_lsns: HashMap<GroupId, Lsn>,
    ) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(TracedStorageError::from)?;
        let files = list_wal_files(&dir)?;
        let version = files.last().map(|(v, _)| *v).unwrap_or(1);
        let path = wal_file_path(&dir, version);
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(TracedStorageError::from)?;
        let write_offset = file.metadata().map_err(TracedStorageError::from)?.len();
        info!(path = %path.display(), write_offset, "opened wal");
        Ok(Self {
            dir,
            enable_fsync,
            rotate_bytes,
            inner: Mutex::new(StoreInner {
                version,
                file,
                write_offset,
                group_lsns,
            }),
        })
    }

    /// Append one entry and return its assigned `(group, lsn)`.
    pub fn append(
        &self,
        kind: EntryKind,
        group: GroupId,
        txn_id: TxnId,
        payload: Vec<u8>,
        checkpoints: Vec<CheckpointDecl>,
        uncommits: Vec<GroupId>,
    ) -> StorageResult<Lsn> {
        let mut inner = self.inner.lock();
        let lsn = inner.group_lsns.get(&group).copied().unwrap_or(0) + 1;
        let entry = LogEntry {
            kind,
            info: EntryInfo {
                group,
                group_lsn: lsn,
                txn_id,
                checkpoints,
                uncommits,
            },
            payload,
        };
        let encoded = entry.encode();
        inner
            .file
            .write_all(&encoded)
            .map_err(TracedStorageError::from)?;
        if self.enable_fsync {
            inner.file.sync_data().map_err(TracedStorageError::from)?;
        }
        inner.write_offset += encoded.len() as u64;
        inner.group_lsns.insert(group, lsn);
        if inner.write_offset >= self.rotate_bytes {
            self.rotate(&mut inner)?;
        }
        Ok(lsn)
    }

    /// Current lsn high-water mark of a group.
    pub fn group_lsn(&self, group: GroupId) -> Lsn {
        self.inner.lock().group_lsns.get(&group).copied().unwrap_or(0)
    }

    /// Force the current file to stable storage.
    pub fn sync(&self) -> StorageResult<()> {
        self.inner.lock().file.sync_data().map_err(TracedStorageError::from)
    }

    fn rotate(&self, inner: &mut StoreInner) -> StorageResult<()> {
        inner.file.sync_data().map_err(TracedStorageError::from)?;
        let version = inner.version + 1;
        let path = wal_file_path(&self.dir, version);
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&path)
            .map_err(TracedStorageError::from)?;
        info!(path = %path.display(), "rotated wal");
        inner.version = version;
        inner.file = file;
        inner.write_offset = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_assignment_is_per_group() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LogStore::open(dir.path(), false, 1 << 20, HashMap::new()).unwrap();
        assert_eq!(
            store
                .append(EntryKind::Commit, 1, 0, vec![1], vec![], vec![])
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .append(EntryKind::Commit, 1, 0, vec![2], vec![], vec![])
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .append(EntryKind::Commit, 2, 0, vec![3], vec![], vec![])
                .unwrap(),
            1
        );
        assert_eq!(store.group_lsn(1), 2);
    }

    #[test]
    fn lsn_floor_restored() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut floor = HashMap::new();
        floor.insert(5u32, 41u64);
        let store = LogStore::open(dir.path(), false, 1 << 20, floor).unwrap();
        assert_eq!(
            store
                .append(EntryKind::Txn, 5, 9, vec![], vec![], vec![])
                .unwrap(),
            42
        );
    }

    #[test]
    fn rotation_creates_new_version() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LogStore::open(dir.path(), false, 64, HashMap::new()).unwrap();
        for _ in 0..4 {
            store
                .append(EntryKind::Commit, 1, 0, vec![0u8; 64], vec![], vec![])
                .unwrap();
        }
        let files = list_wal_files(dir.path()).unwrap();
        assert!(files.len() >= 2, "expected rotation, got {:?}", files);
        assert_eq!(files.first().unwrap().0, 1);
    }
}
