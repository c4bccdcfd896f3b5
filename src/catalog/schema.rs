// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use super::column::{get_bytes, get_string, put_bytes, put_string, ColumnDef};
use super::{PHY_ADDR_COLUMN_COMMENT, PHY_ADDR_COLUMN_NAME};
use crate::storage::{StorageResult, TracedStorageError};
use crate::types::LogicalType;

/// Creator identity recorded with a schema.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessInfo {
    pub tenant_id: u32,
    pub user_id: u32,
    pub role_id: u32,
    pub create_at: i64,
}

impl AccessInfo {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.tenant_id);
        buf.put_u32(self.user_id);
        buf.put_u32(self.role_id);
        buf.put_i64(self.create_at);
    }

    fn decode(buf: &mut impl Buf) -> StorageResult<Self> {
        if buf.remaining() < 20 {
            return Err(TracedStorageError::decode("truncated access info"));
        }
        Ok(Self {
            tenant_id: buf.get_u32(),
            user_id: buf.get_u32(),
            role_id: buf.get_u32(),
            create_at: buf.get_i64(),
        })
    }
}

/// The sort key of a schema. This version supports a single sort column;
/// composite keys are rejected at finalization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub idx: usize,
    pub is_primary: bool,
}

/// A table schema: ordered column definitions plus derived indices.
///
/// Construct with [`Schema::new`], append columns, then call
/// [`Schema::finalize`] exactly once. Finalization validates the
/// definitions, appends the hidden physical-address column when requested,
/// and caches the sort-key and phy-addr shortcuts.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub access_info: AccessInfo,
    pub column_defs: Vec<ColumnDef>,
    pub block_max_rows: u32,
    pub segment_max_blocks: u16,
    pub comment: String,
    pub partition: String,
    pub relkind: String,
    pub createsql: String,
    pub view: String,
    pub unique_index: String,
    pub secondary_index: String,
    pub constraint: Vec<u8>,

    #[serde(skip)]
    name_index: HashMap<String, usize>,
    #[serde(skip)]
    sort_key: Option<SortKey>,
    #[serde(skip)]
    phy_addr_idx: Option<usize>,
    #[serde(skip)]
    finalized: bool,
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.access_info == other.access_info
            && self.column_defs == other.column_defs
            && self.block_max_rows == other.block_max_rows
            && self.segment_max_blocks == other.segment_max_blocks
            && self.comment == other.comment
            && self.partition == other.partition
            && self.relkind == other.relkind
            && self.createsql == other.createsql
            && self.view == other.view
            && self.unique_index == other.unique_index
            && self.secondary_index == other.secondary_index
            && self.constraint == other.constraint
    }
}

const SCHEMA_MAGIC: u32 = 0x434f_5353; // "COSS"

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            block_max_rows: 8192,
            segment_max_blocks: 64,
            ..Default::default()
        }
    }

    /// Append a column definition. The stored `idx` is overwritten with the
    /// list position. Duplicate names fail early with `ConstraintViolation`.
    pub fn append_column_def(&mut self, mut def: ColumnDef) -> StorageResult<()> {
        if self.finalized {
            return Err(TracedStorageError::constraint(format!(
                "schema \"{}\" already finalized",
                self.name
            )));
        }
        if self.name_index.contains_key(&def.name) {
            return Err(TracedStorageError::constraint(format!(
                "duplicate column \"{}\"",
                def.name
            )));
        }
        def.idx = self.column_defs.len();
        self.name_index.insert(def.name.clone(), def.idx);
        self.column_defs.push(def);
        Ok(())
    }

    pub fn append_column(&mut self, name: &str, ty: LogicalType) -> StorageResult<()> {
        self.append_column_def(ColumnDef::new(name, ty))
    }

    pub fn append_pk_column(
        &mut self,
        name: &str,
        ty: LogicalType,
        sort_idx: i8,
    ) -> StorageResult<()> {
        self.append_column_def(ColumnDef::new_primary(name, ty, sort_idx))
    }

    /// Run validation and build the derived indices. Called exactly once.
    ///
    /// When `with_phy_addr` is set and no physical-address column exists yet,
    /// the hidden `__rowid` column is appended first.
    pub fn finalize(&mut self, with_phy_addr: bool) -> StorageResult<()> {
        if self.finalized {
            return Err(TracedStorageError::constraint(format!(
                "schema \"{}\" already finalized",
                self.name
            )));
        }
        if with_phy_addr && !self.column_defs.iter().any(|d| d.phy_addr) {
            let mut def = ColumnDef::new(PHY_ADDR_COLUMN_NAME, LogicalType::UInt64)
                .with_comment(PHY_ADDR_COLUMN_COMMENT);
            def.hidden = true;
            def.nullable = false;
            def.phy_addr = true;
            self.append_column_def(def)?;
        }
        if self.column_defs.is_empty() {
            return Err(TracedStorageError::constraint("empty column defs"));
        }

        let mut names = HashMap::new();
        let mut sort_cols = Vec::new();
        self.phy_addr_idx = None;
        for (idx, def) in self.column_defs.iter().enumerate() {
            if def.idx != idx {
                return Err(TracedStorageError::invalid_input(format!(
                    "wrong column index {} specified for \"{}\"",
                    def.idx, def.name
                )));
            }
            if names.insert(def.name.clone(), idx).is_some() {
                return Err(TracedStorageError::invalid_input(format!(
                    "duplicate column \"{}\"",
                    def.name
                )));
            }
            if def.is_sort_key() {
                sort_cols.push(idx);
            }
            if def.is_phy_addr() {
                if self.phy_addr_idx.is_some() {
                    return Err(TracedStorageError::invalid_input(format!(
                        "duplicated physical address column \"{}\"",
                        def.name
                    )));
                }
                self.phy_addr_idx = Some(idx);
            }
        }

        match sort_cols.len() {
            0 => self.sort_key = None,
            1 => {
                let def = &self.column_defs[sort_cols[0]];
                if def.sort_idx != 0 {
                    return Err(TracedStorageError::constraint(format!(
                        "bad sort idx {}, should be 0",
                        def.sort_idx
                    )));
                }
                self.sort_key = Some(SortKey {
                    idx: def.idx,
                    is_primary: def.primary,
                });
            }
            n => {
                // Composite sort keys are a future extension.
                return Err(TracedStorageError::constraint(format!(
                    "{} sort key columns, at most one supported",
                    n
                )));
            }
        }
        self.name_index = names;
        self.finalized = true;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn has_pk(&self) -> bool {
        matches!(&self.sort_key, Some(k) if k.is_primary)
    }

    pub fn has_sort_key(&self) -> bool {
        self.sort_key.is_some()
    }

    pub fn sort_key(&self) -> Option<&SortKey> {
        self.sort_key.as_ref()
    }

    /// Definition of the single sort-key column. Check
    /// [`Schema::has_sort_key`] first.
    pub fn sort_key_def(&self) -> &ColumnDef {
        &self.column_defs[self.sort_key.as_ref().unwrap().idx]
    }

    pub fn phy_addr_def(&self) -> Option<&ColumnDef> {
        self.phy_addr_idx.map(|idx| &self.column_defs[idx])
    }

    /// Column index for the given name, `None` when absent.
    pub fn column_idx(&self, name: &str) -> Option<usize> {
        self.name_index.get(name).copied()
    }

    pub fn column_count(&self) -> usize {
        self.column_defs.len()
    }

    /// Names of user-visible columns, hidden physical address excluded.
    pub fn attrs(&self) -> Vec<&str> {
        self.column_defs
            .iter()
            .filter(|d| !d.is_phy_addr())
            .map(|d| d.name.as_str())
            .collect()
    }

    /// Types of user-visible columns.
    pub fn types(&self) -> Vec<LogicalType> {
        self.column_defs
            .iter()
            .filter(|d| !d.is_phy_addr())
            .map(|d| d.ty)
            .collect()
    }

    /// Count of user-visible columns.
    pub fn visible_column_count(&self) -> usize {
        self.column_defs.iter().filter(|d| !d.is_phy_addr()).count()
    }

    /// JSON dump for logs and debugging. Never used for durable state.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "<unserializable schema>".to_string())
    }

    /// Durable binary layout:
    /// `magic | block_max_rows | segment_max_blocks | access_info | name |
    ///  comment | partition | relkind | createsql | view | constraint |
    ///  unique_index | secondary_index | col_count | (col repr)*`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u32(SCHEMA_MAGIC);
        buf.put_u32(self.block_max_rows);
        buf.put_u16(self.segment_max_blocks);
        self.access_info.encode(&mut buf);
        put_string(&mut buf, &self.name);
        put_string(&mut buf, &self.comment);
        put_string(&mut buf, &self.partition);
        put_string(&mut buf, &self.relkind);
        put_string(&mut buf, &self.createsql);
        put_string(&mut buf, &self.view);
        put_bytes(&mut buf, &self.constraint);
        put_string(&mut buf, &self.unique_index);
        put_string(&mut buf, &self.secondary_index);
        buf.put_u16(self.column_defs.len() as u16);
        for def in &self.column_defs {
            def.encode(&mut buf);
        }
        buf
    }

    /// Inverse of [`Schema::serialize`]. The result is finalized; derived
    /// indices are rebuilt, the column list is taken as-is.
    pub fn deserialize(mut buf: &[u8]) -> StorageResult<Self> {
        let buf = &mut buf;
        if buf.remaining() < 10 || buf.get_u32() != SCHEMA_MAGIC {
            return Err(TracedStorageError::decode("bad schema magic"));
        }
        let block_max_rows = buf.get_u32();
        let segment_max_blocks = buf.get_u16();
        let access_info = AccessInfo::decode(buf)?;
        let name = get_string(buf)?;
        let comment = get_string(buf)?;
        let partition = get_string(buf)?;
        let relkind = get_string(buf)?;
        let createsql = get_string(buf)?;
        let view = get_string(buf)?;
        let constraint = get_bytes(buf)?;
        let unique_index = get_string(buf)?;
        let secondary_index = get_string(buf)?;
        if buf.remaining() < 2 {
            return Err(TracedStorageError::decode("truncated column count"));
        }
        let col_count = buf.get_u16();

        let mut schema = Schema {
            name,
            access_info,
            block_max_rows,
            segment_max_blocks,
            comment,
            partition,
            relkind,
            createsql,
            view,
            unique_index,
            secondary_index,
            constraint,
            ..Default::default()
        };
        for _ in 0..col_count {
            let def = ColumnDef::decode(buf)?;
            schema.append_column_def(def)?;
        }
        schema.finalize(false)?;
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        let mut schema = Schema::new("t");
        schema.block_max_rows = 4;
        schema.segment_max_blocks = 2;
        schema.append_pk_column("a", LogicalType::Int32, 0).unwrap();
        schema
            .append_column("b", LogicalType::Varchar { width: 32 })
            .unwrap();
        schema.finalize(true).unwrap();
        schema
    }

    #[test]
    fn finalize_appends_phy_addr() {
        let schema = sample_schema();
        assert_eq!(schema.column_count(), 3);
        let phy = schema.phy_addr_def().unwrap();
        assert_eq!(phy.name, PHY_ADDR_COLUMN_NAME);
        assert!(phy.hidden);
        assert!(!phy.nullable);
        assert_eq!(phy.ty, LogicalType::UInt64);
        assert_eq!(schema.attrs(), vec!["a", "b"]);
        assert!(schema.has_pk());
        assert_eq!(schema.sort_key_def().name, "a");
    }

    #[test]
    fn serialize_roundtrip() {
        let schema = sample_schema();
        let buf = schema.serialize();
        let decoded = Schema::deserialize(&buf).unwrap();
        assert_eq!(decoded, schema);
        assert_eq!(decoded.column_idx("b"), Some(1));
        assert_eq!(
            decoded.sort_key(),
            Some(&SortKey {
                idx: 0,
                is_primary: true
            })
        );
        // serialize again: byte-identical
        assert_eq!(decoded.serialize(), buf);
    }

    #[test]
    fn duplicate_column_rejected() {
        let mut schema = Schema::new("t");
        schema.append_column("a", LogicalType::Int32).unwrap();
        let err = schema.append_column("a", LogicalType::Int64).unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::storage::StorageError::ConstraintViolation(_)
        ));
    }

    #[test]
    fn multiple_sort_keys_rejected() {
        let mut schema = Schema::new("t");
        schema.append_pk_column("a", LogicalType::Int32, 0).unwrap();
        schema
            .append_column_def(ColumnDef::new_sort_key("b", LogicalType::Int32, 1))
            .unwrap();
        let err = schema.finalize(true).unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::storage::StorageError::ConstraintViolation(_)
        ));
    }

    #[test]
    fn nonzero_single_sort_idx_rejected() {
        let mut schema = Schema::new("t");
        schema.append_pk_column("a", LogicalType::Int32, 1).unwrap();
        let err = schema.finalize(true).unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::storage::StorageError::ConstraintViolation(_)
        ));
    }

    #[test]
    fn double_finalize_rejected() {
        let mut schema = sample_schema();
        assert!(schema.finalize(true).is_err());
    }
}
