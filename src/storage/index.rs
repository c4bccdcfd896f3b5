// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

use bytes::{Buf, BufMut};

use super::batch::ColumnVec;
use super::{StorageResult, TracedStorageError};

pub const ZONE_MAP_MAGIC: u32 = 0x5a4d_4150; // "ZMAP"

/// Per-block zone map over one column.
///
/// Stores the minimum and maximum key encoding plus row and null counts.
/// Dedup and filter scans consult it to skip blocks whose key range cannot
/// contain the probe.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ZoneMap {
    pub row_count: u32,
    pub null_count: u32,
    /// Order-preserving key bytes of the smallest non-null value; empty
    /// when every row is null.
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

impl ZoneMap {
    /// Build a zone map over every row of `column`.
    pub fn build(column: &ColumnVec) -> Self {
        let mut map = ZoneMap {
            row_count: column.len() as u32,
            ..Default::default()
        };
        for row in 0..column.len() {
            if !column.is_valid(row) {
                map.null_count += 1;
                continue;
            }
            map.observe(column.key_at(row));
        }
        map
    }

    fn observe(&mut self, key: Vec<u8>) {
        if self.min_key.is_empty() && self.max_key.is_empty() {
            self.min_key = key.clone();
            self.max_key = key;
            return;
        }
        if key < self.min_key {
            self.min_key = key;
        } else if key > self.max_key {
            self.max_key = key;
        }
    }

    /// Whether a row with this key encoding could live in the block.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        if self.min_key.is_empty() && self.max_key.is_empty() {
            return false;
        }
        self.min_key.as_slice() <= key && key <= self.max_key.as_slice()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u32(ZONE_MAP_MAGIC);
        buf.put_u32(self.row_count);
        buf.put_u32(self.null_count);
        buf.put_u32(self.min_key.len() as u32);
        buf.put_slice(&self.min_key);
        buf.put_u32(self.max_key.len() as u32);
        buf.put_slice(&self.max_key);
        let crc = crc32fast::hash(&buf);
        buf.put_u32(crc);
        buf
    }

    pub fn decode(data: &[u8]) -> StorageResult<Self> {
        if data.len() < 20 {
            return Err(TracedStorageError::decode("zone map truncated"));
        }
        let crc_found = (&data[data.len() - 4..]).get_u32();
        let crc_expected = crc32fast::hash(&data[..data.len() - 4]);
        if crc_found != crc_expected {
            return Err(TracedStorageError::checksum(crc_found, crc_expected));
        }
        let mut buf = &data[..data.len() - 4];
        if buf.get_u32() != ZONE_MAP_MAGIC {
            return Err(TracedStorageError::decode("bad zone map magic"));
        }
        let row_count = buf.get_u32();
        let null_count = buf.get_u32();
        let min_len = buf.get_u32() as usize;
        if buf.remaining() < min_len + 4 {
            return Err(TracedStorageError::decode("zone map truncated"));
        }
        let min_key = buf[..min_len].to_vec();
        buf.advance(min_len);
        let max_len = buf.get_u32() as usize;
        if buf.remaining() < max_len {
            return Err(TracedStorageError::decode("zone map truncated"));
        }
        let max_key = buf[..max_len].to_vec();
        Ok(Self {
            row_count,
            null_count,
            min_key,
            max_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogicalType, Value};

    #[test]
    fn build_and_probe() {
        let col = ColumnVec::from_values(
            LogicalType::Int32,
            [Value::Int32(5), Value::Null, Value::Int32(-3), Value::Int32(9)],
        )
        .unwrap();
        let map = ZoneMap::build(&col);
        assert_eq!(map.row_count, 4);
        assert_eq!(map.null_count, 1);

        let key = |v: i32| {
            let mut k = Vec::new();
            Value::Int32(v).encode_key(&mut k);
            k
        };
        assert!(map.may_contain(&key(-3)));
        assert!(map.may_contain(&key(0)));
        assert!(map.may_contain(&key(9)));
        assert!(!map.may_contain(&key(-4)));
        assert!(!map.may_contain(&key(10)));
    }

    #[test]
    fn all_null_matches_nothing() {
        let col =
            ColumnVec::from_values(LogicalType::Int32, [Value::Null, Value::Null]).unwrap();
        let map = ZoneMap::build(&col);
        assert!(!map.may_contain(&[0x80, 0, 0, 0]));
    }

    #[test]
    fn roundtrip() {
        let col = ColumnVec::from_values(
            LogicalType::Varchar { width: 8 },
            [Value::String("mm".into()), Value::String("zz".into())],
        )
        .unwrap();
        let map = ZoneMap::build(&col);
        let decoded = ZoneMap::decode(&map.encode()).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn corrupt_bytes_rejected() {
        let col =
            ColumnVec::from_values(LogicalType::Int32, [Value::Int32(1)]).unwrap();
        let mut bytes = ZoneMap::build(&col).encode();
        bytes[6] ^= 1;
        assert!(ZoneMap::decode(&bytes).is_err());
    }
}
