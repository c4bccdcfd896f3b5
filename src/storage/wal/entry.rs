// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

use bytes::{Buf, BufMut};

use super::interval::{ClosedInterval, ClosedIntervals};
use crate::storage::{StorageResult, TracedStorageError};

/// Namespace of lsn-ordered log entries.
pub type GroupId = u32;
/// Sequence number within one group.
pub type Lsn = u64;
pub type TxnId = u64;

pub const WAL_ENTRY_MAGIC: u32 = 0x57414c45; // "WALE"

/// Fixed meta size: magic, kind, info length, payload length, crc32 of
/// info-buf plus payload.
pub const ENTRY_META_SIZE: usize = 4 + 1 + 4 + 4 + 4;

/// Kinds of durable log entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// Marks a sync position; carries no payload to apply.
    Flush,
    /// Declares lsn ranges durable elsewhere; its payload is applied first
    /// at replay.
    Checkpoint,
    /// A fragment of a transaction that has not committed yet. Never
    /// applied directly.
    Uncommitted,
    /// A committing transactional entry; picks up its buffered fragments.
    Txn,
    /// A plain committed entry.
    Commit,
}

impl EntryKind {
    pub fn as_u8(self) -> u8 {
        match self {
            EntryKind::Flush => 0,
            EntryKind::Checkpoint => 1,
            EntryKind::Uncommitted => 2,
            EntryKind::Txn => 3,
            EntryKind::Commit => 4,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(EntryKind::Flush),
            1 => Some(EntryKind::Checkpoint),
            2 => Some(EntryKind::Uncommitted),
            3 => Some(EntryKind::Txn),
            4 => Some(EntryKind::Commit),
            _ => None,
        }
    }
}

/// A checkpoint declaration: these lsn ranges of `group` are durable and
/// may be skipped at replay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointDecl {
    pub group: GroupId,
    pub ranges: ClosedIntervals,
}

/// The info-buf carried by every entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryInfo {
    pub group: GroupId,
    pub group_lsn: Lsn,
    pub txn_id: TxnId,
    /// Present on `Checkpoint` entries.
    pub checkpoints: Vec<CheckpointDecl>,
    /// On `Uncommitted` entries: the groups whose transaction the fragment
    /// belongs to.
    pub uncommits: Vec<GroupId>,
}

impl EntryInfo {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u32(self.group);
        buf.put_u64(self.group_lsn);
        buf.put_u64(self.txn_id);
        buf.put_u32(self.checkpoints.len() as u32);
        for decl in &self.checkpoints {
            buf.put_u32(decl.group);
            buf.put_u32(decl.ranges.intervals().len() as u32);
            for range in decl.ranges.intervals() {
                buf.put_u64(range.start);
                buf.put_u64(range.end);
            }
        }
        buf.put_u32(self.uncommits.len() as u32);
        for group in &self.uncommits {
            buf.put_u32(*group);
        }
    }

    pub fn decode(mut data: &[u8]) -> StorageResult<Self> {
        let buf = &mut data;
        if buf.remaining() < 4 + 8 + 8 + 4 {
            return Err(TracedStorageError::decode("truncated entry info"));
        }
        let group = buf.get_u32();
        let group_lsn = buf.get_u64();
        let txn_id = buf.get_u64();
        let ckp_count = buf.get_u32();
        let mut checkpoints = Vec::with_capacity(ckp_count as usize);
        for _ in 0..ckp_count {
            if buf.remaining() < 8 {
                return Err(TracedStorageError::decode("truncated checkpoint decl"));
            }
            let group = buf.get_u32();
            let range_count = buf.get_u32();
            let mut ranges = ClosedIntervals::new();
            for _ in 0..range_count {
                if buf.remaining() < 16 {
                    return Err(TracedStorageError::decode("truncated checkpoint range"));
                }
                let start = buf.get_u64();
                let end = buf.get_u64();
                ranges.try_merge(ClosedInterval::new(start, end));
            }
            checkpoints.push(CheckpointDecl { group, ranges });
        }
        if buf.remaining() < 4 {
            return Err(TracedStorageError::decode("truncated uncommit list"));
        }
        let uncommit_count = buf.get_u32();
        let mut uncommits = Vec::with_capacity(uncommit_count as usize);
        for _ in 0..uncommit_count {
            if buf.remaining() < 4 {
                return Err(TracedStorageError::decode("truncated uncommit list"));
            }
            uncommits.push(buf.get_u32());
        }
        Ok(Self {
            group,
            group_lsn,
            txn_id,
            checkpoints,
            uncommits,
        })
    }
}

/// One durable log entry: `[meta | info-buf | payload]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub kind: EntryKind,
    pub info: EntryInfo,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut info_buf = Vec::new();
        self.info.encode(&mut info_buf);
        let mut buf = Vec::with_capacity(ENTRY_META_SIZE + info_buf.len() + self.payload.len());
        buf.put_u32(WAL_ENTRY_MAGIC);
        buf.put_u8(self.kind.as_u8());
        buf.put_u32(info_buf.len() as u32);
        buf.put_u32(self.payload.len() as u32);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&info_buf);
        hasher.update(&self.payload);
        buf.put_u32(hasher.finalize());
        buf.put_slice(&info_buf);
        buf.put_slice(&self.payload);
        buf
    }
}

/// Parsed entry meta.
#[derive(Clone, Copy, Debug)]
pub struct EntryMeta {
    pub kind: EntryKind,
    pub info_len: u32,
    pub payload_len: u32,
    pub crc: u32,
}

impl EntryMeta {
    /// Parse a meta header; `None` means the bytes do not start a
    /// well-formed entry (torn tail or garbage).
    pub fn decode(data: &[u8; ENTRY_META_SIZE]) -> Option<Self> {
        let mut buf = &data[..];
        if buf.get_u32() != WAL_ENTRY_MAGIC {
            return None;
        }
        let kind = EntryKind::from_u8(buf.get_u8())?;
        Some(Self {
            kind,
            info_len: buf.get_u32(),
            payload_len: buf.get_u32(),
            crc: buf.get_u32(),
        })
    }

    pub fn body_len(&self) -> u64 {
        self.info_len as u64 + self.payload_len as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrip() {
        let entry = LogEntry {
            kind: EntryKind::Checkpoint,
            info: EntryInfo {
                group: 3,
                group_lsn: 17,
                txn_id: 0,
                checkpoints: vec![CheckpointDecl {
                    group: 1,
                    ranges: ClosedIntervals::from_interval(ClosedInterval::new(1, 5)),
                }],
                uncommits: vec![],
            },
            payload: b"snapshot".to_vec(),
        };
        let encoded = entry.encode();
        let meta_bytes: [u8; ENTRY_META_SIZE] = encoded[..ENTRY_META_SIZE].try_into().unwrap();
        let meta = EntryMeta::decode(&meta_bytes).unwrap();
        assert_eq!(meta.kind, EntryKind::Checkpoint);
        let info_end = ENTRY_META_SIZE + meta.info_len as usize;
        let info = EntryInfo::decode(&encoded[ENTRY_META_SIZE..info_end]).unwrap();
        assert_eq!(info, entry.info);
        assert_eq!(&encoded[info_end..], b"snapshot");
    }

    #[test]
    fn garbage_meta_rejected() {
        let data = [0u8; ENTRY_META_SIZE];
        assert!(EntryMeta::decode(&data).is_none());
    }
}
