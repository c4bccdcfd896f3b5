// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::storage::{StorageResult, TracedStorageError};
use crate::types::LogicalType;

/// Definition of one column in a schema.
///
/// `idx` is the position inside the schema's column list and is assigned
/// when the definition is appended. `sort_idx` is the position inside the
/// sort key, `-1` when the column does not participate in ordering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub idx: usize,
    pub ty: LogicalType,
    /// Hidden columns are generated by the compute layer and never shown to
    /// the user.
    pub hidden: bool,
    /// The engine-generated row identifier column.
    pub phy_addr: bool,
    pub nullable: bool,
    pub auto_increment: bool,
    pub primary: bool,
    pub sort_idx: i8,
    pub sort_key: bool,
    pub cluster_by: bool,
    pub comment: String,
    /// Opaque default-value expression blob, interpreted by the layer above.
    pub default_expr: Vec<u8>,
    /// Opaque on-update expression blob.
    pub on_update: Vec<u8>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: LogicalType) -> Self {
        Self {
            name: name.into(),
            idx: 0,
            ty,
            hidden: false,
            phy_addr: false,
            nullable: true,
            auto_increment: false,
            primary: false,
            sort_idx: -1,
            sort_key: false,
            cluster_by: false,
            comment: String::new(),
            default_expr: Vec::new(),
            on_update: Vec::new(),
        }
    }

    /// A primary-key column: sort key position `sort_idx`, non-nullable.
    pub fn new_primary(name: impl Into<String>, ty: LogicalType, sort_idx: i8) -> Self {
        let mut def = Self::new(name, ty);
        def.sort_idx = sort_idx;
        def.sort_key = true;
        def.primary = true;
        def.nullable = false;
        def
    }

    /// A cluster-by sort column without primary semantics.
    pub fn new_sort_key(name: impl Into<String>, ty: LogicalType, sort_idx: i8) -> Self {
        let mut def = Self::new(name, ty);
        def.sort_idx = sort_idx;
        def.sort_key = true;
        def.cluster_by = true;
        def
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn is_sort_key(&self) -> bool {
        self.sort_key
    }

    pub fn is_phy_addr(&self) -> bool {
        self.phy_addr
    }

    /// Serialize one column repr:
    /// `type | name | comment | nullable | hidden | phy_addr |
    ///  auto_increment | sort_idx | primary | sort_key | cluster_by |
    ///  default_len | default | on_update_len | on_update`.
    /// String and blob lengths are 64-bit big-endian, flags single bytes.
    pub(crate) fn encode(&self, buf: &mut impl BufMut) {
        self.ty.encode(buf);
        put_string(buf, &self.name);
        put_string(buf, &self.comment);
        buf.put_u8(self.nullable as u8);
        buf.put_u8(self.hidden as u8);
        buf.put_u8(self.phy_addr as u8);
        buf.put_u8(self.auto_increment as u8);
        buf.put_i8(self.sort_idx);
        buf.put_u8(self.primary as u8);
        buf.put_u8(self.sort_key as u8);
        buf.put_u8(self.cluster_by as u8);
        put_bytes(buf, &self.default_expr);
        put_bytes(buf, &self.on_update);
    }

    pub(crate) fn decode(buf: &mut impl Buf) -> StorageResult<Self> {
        let ty = LogicalType::decode(buf)
            .ok_or_else(|| TracedStorageError::decode("bad column type"))?;
        let name = get_string(buf)?;
        let comment = get_string(buf)?;
        if buf.remaining() < 8 {
            return Err(TracedStorageError::decode("truncated column flags"));
        }
        let nullable = buf.get_u8() != 0;
        let hidden = buf.get_u8() != 0;
        let phy_addr = buf.get_u8() != 0;
        let auto_increment = buf.get_u8() != 0;
        let sort_idx = buf.get_i8();
        let primary = buf.get_u8() != 0;
        let sort_key = buf.get_u8() != 0;
        let cluster_by = buf.get_u8() != 0;
        let default_expr = get_bytes(buf)?;
        let on_update = get_bytes(buf)?;
        Ok(Self {
            name,
            idx: 0,
            ty,
            hidden,
            phy_addr,
            nullable,
            auto_increment,
            primary,
            sort_idx,
            sort_key,
            cluster_by,
            comment,
            default_expr,
            on_update,
        })
    }
}

pub(crate) fn put_string(buf: &mut impl BufMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub(crate) fn put_bytes(buf: &mut impl BufMut, b: &[u8]) {
    buf.put_u64(b.len() as u64);
    buf.put_slice(b);
}

pub(crate) fn get_string(buf: &mut impl Buf) -> StorageResult<String> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes).map_err(|_| TracedStorageError::decode("invalid utf-8 string"))
}

pub(crate) fn get_bytes(buf: &mut impl Buf) -> StorageResult<Vec<u8>> {
    if buf.remaining() < 8 {
        return Err(TracedStorageError::decode("truncated length"));
    }
    let len = buf.get_u64() as usize;
    if buf.remaining() < len {
        return Err(TracedStorageError::decode("truncated payload"));
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_def_roundtrip() {
        let mut def = ColumnDef::new_primary("id", LogicalType::Int32, 0)
            .with_comment("row identifier");
        def.default_expr = vec![1, 2, 3];
        let mut buf = Vec::new();
        def.encode(&mut buf);
        let decoded = ColumnDef::decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded, def);
    }
}
