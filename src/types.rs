// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

//! Logical types and single values.
//!
//! The engine stores column payloads in fixed-width little-endian form and
//! variable-length strings through offset tables. Metadata structures
//! (schema, inode images, WAL entries) always use big-endian fixed-width
//! integers; the conversion points live in [`LogicalType::encode`] and the
//! key codec below.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Column index inside a schema.
pub type ColumnIdx = u16;

/// Logical data type of one column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    /// Days since the unix epoch.
    Date,
    /// Microseconds since the unix epoch.
    Timestamp,
    /// Fixed-width character type, padded with spaces on output.
    Char { width: u32 },
    Varchar { width: u32 },
}

impl LogicalType {
    /// Width in bytes of the in-memory fixed representation, `None` for
    /// variable-length types.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            LogicalType::Bool | LogicalType::Int8 | LogicalType::UInt8 => Some(1),
            LogicalType::Int16 | LogicalType::UInt16 => Some(2),
            LogicalType::Int32 | LogicalType::UInt32 | LogicalType::Float32 | LogicalType::Date => {
                Some(4)
            }
            LogicalType::Int64
            | LogicalType::UInt64
            | LogicalType::Float64
            | LogicalType::Timestamp => Some(8),
            LogicalType::Char { .. } | LogicalType::Varchar { .. } => None,
        }
    }

    pub fn is_variable(&self) -> bool {
        self.fixed_width().is_none()
    }

    fn type_tag(&self) -> u8 {
        match self {
            LogicalType::Bool => 1,
            LogicalType::Int8 => 2,
            LogicalType::Int16 => 3,
            LogicalType::Int32 => 4,
            LogicalType::Int64 => 5,
            LogicalType::UInt8 => 6,
            LogicalType::UInt16 => 7,
            LogicalType::UInt32 => 8,
            LogicalType::UInt64 => 9,
            LogicalType::Float32 => 10,
            LogicalType::Float64 => 11,
            LogicalType::Date => 12,
            LogicalType::Timestamp => 13,
            LogicalType::Char { .. } => 14,
            LogicalType::Varchar { .. } => 15,
        }
    }

    /// Serialize as `tag (1B) | width (4B BE)`. Fixed-width types carry a
    /// zero width field so every column repr has the same prefix size.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.type_tag());
        let width = match self {
            LogicalType::Char { width } | LogicalType::Varchar { width } => *width,
            _ => 0,
        };
        buf.put_u32(width);
    }

    /// Decode a type serialized by [`LogicalType::encode`]. Returns `None`
    /// on an unknown tag.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 5 {
            return None;
        }
        let tag = buf.get_u8();
        let width = buf.get_u32();
        let ty = match tag {
            1 => LogicalType::Bool,
            2 => LogicalType::Int8,
            3 => LogicalType::Int16,
            4 => LogicalType::Int32,
            5 => LogicalType::Int64,
            6 => LogicalType::UInt8,
            7 => LogicalType::UInt16,
            8 => LogicalType::UInt32,
            9 => LogicalType::UInt64,
            10 => LogicalType::Float32,
            11 => LogicalType::Float64,
            12 => LogicalType::Date,
            13 => LogicalType::Timestamp,
            14 => LogicalType::Char { width },
            15 => LogicalType::Varchar { width },
            _ => return None,
        };
        Some(ty)
    }
}

impl std::fmt::Display for LogicalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogicalType::Char { width } => write!(f, "char({})", width),
            LogicalType::Varchar { width } => write!(f, "varchar({})", width),
            other => write!(f, "{}", format!("{:?}", other).to_lowercase()),
        }
    }
}

/// A single cell value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Date(i32),
    Timestamp(i64),
    String(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value can live in a column of type `ty`.
    pub fn fits(&self, ty: &LogicalType) -> bool {
        matches!(
            (self, ty),
            (Value::Null, _)
                | (Value::Bool(_), LogicalType::Bool)
                | (Value::Int8(_), LogicalType::Int8)
                | (Value::Int16(_), LogicalType::Int16)
                | (Value::Int32(_), LogicalType::Int32)
                | (Value::Int64(_), LogicalType::Int64)
                | (Value::UInt8(_), LogicalType::UInt8)
                | (Value::UInt16(_), LogicalType::UInt16)
                | (Value::UInt32(_), LogicalType::UInt32)
                | (Value::UInt64(_), LogicalType::UInt64)
                | (Value::Float32(_), LogicalType::Float32)
                | (Value::Float64(_), LogicalType::Float64)
                | (Value::Date(_), LogicalType::Date)
                | (Value::Timestamp(_), LogicalType::Timestamp)
                | (Value::String(_), LogicalType::Char { .. })
                | (Value::String(_), LogicalType::Varchar { .. })
        )
    }

    /// Serialize as `null flag (1B) | length (4B BE) | payload`. Used by the
    /// update delta streams, where values of any type share one framing.
    pub fn encode(&self, buf: &mut impl BufMut) {
        if self.is_null() {
            buf.put_u8(0);
            buf.put_u32(0);
            return;
        }
        buf.put_u8(1);
        let mut payload = Vec::new();
        self.encode_key(&mut payload);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
    }

    /// Decode a value written by [`Value::encode`].
    pub fn decode(ty: &LogicalType, buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 5 {
            return None;
        }
        let present = buf.get_u8() != 0;
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return None;
        }
        if !present {
            return Some(Value::Null);
        }
        let mut payload = vec![0u8; len];
        buf.copy_to_slice(&mut payload);
        Value::decode_key(ty, &payload)
    }

    /// Order-preserving byte encoding, used for zone-map bounds, dedup keys
    /// and update payloads. Integers are biased so that unsigned byte order
    /// matches value order; floats use the usual sign-flip trick.
    pub fn encode_key(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Null => {}
            Value::Bool(v) => buf.put_u8(*v as u8),
            Value::Int8(v) => buf.put_u8((*v as u8) ^ 0x80),
            Value::Int16(v) => buf.put_u16((*v as u16) ^ (1 << 15)),
            Value::Int32(v) => buf.put_u32((*v as u32) ^ (1 << 31)),
            Value::Int64(v) => buf.put_u64((*v as u64) ^ (1 << 63)),
            Value::UInt8(v) => buf.put_u8(*v),
            Value::UInt16(v) => buf.put_u16(*v),
            Value::UInt32(v) => buf.put_u32(*v),
            Value::UInt64(v) => buf.put_u64(*v),
            Value::Float32(v) => {
                let bits = v.to_bits();
                let bits = if bits >> 31 == 0 {
                    bits ^ (1 << 31)
                } else {
                    !bits
                };
                buf.put_u32(bits);
            }
            Value::Float64(v) => {
                let bits = v.to_bits();
                let bits = if bits >> 63 == 0 {
                    bits ^ (1 << 63)
                } else {
                    !bits
                };
                buf.put_u64(bits);
            }
            Value::Date(v) => buf.put_u32((*v as u32) ^ (1 << 31)),
            Value::Timestamp(v) => buf.put_u64((*v as u64) ^ (1 << 63)),
            Value::String(v) => buf.put_slice(v.as_bytes()),
        }
    }

    /// Inverse of [`Value::encode_key`] for a known type.
    pub fn decode_key(ty: &LogicalType, mut key: &[u8]) -> Option<Self> {
        let need = ty.fixed_width().unwrap_or(0);
        if key.len() < need {
            return None;
        }
        let value = match ty {
            LogicalType::Bool => Value::Bool(key.get_u8() != 0),
            LogicalType::Int8 => Value::Int8((key.get_u8() ^ 0x80) as i8),
            LogicalType::Int16 => Value::Int16((key.get_u16() ^ (1 << 15)) as i16),
            LogicalType::Int32 => Value::Int32((key.get_u32() ^ (1 << 31)) as i32),
            LogicalType::Int64 => Value::Int64((key.get_u64() ^ (1 << 63)) as i64),
            LogicalType::UInt8 => Value::UInt8(key.get_u8()),
            LogicalType::UInt16 => Value::UInt16(key.get_u16()),
            LogicalType::UInt32 => Value::UInt32(key.get_u32()),
            LogicalType::UInt64 => Value::UInt64(key.get_u64()),
            LogicalType::Float32 => {
                let bits = key.get_u32();
                let bits = if bits >> 31 == 1 {
                    bits ^ (1 << 31)
                } else {
                    !bits
                };
                Value::Float32(f32::from_bits(bits))
            }
            LogicalType::Float64 => {
                let bits = key.get_u64();
                let bits = if bits >> 63 == 1 {
                    bits ^ (1 << 63)
                } else {
                    !bits
                };
                Value::Float64(f64::from_bits(bits))
            }
            LogicalType::Date => Value::Date((key.get_u32() ^ (1 << 31)) as i32),
            LogicalType::Timestamp => Value::Timestamp((key.get_u64() ^ (1 << 63)) as i64),
            LogicalType::Char { .. } | LogicalType::Varchar { .. } => {
                Value::String(String::from_utf8_lossy(key).into_owned())
            }
        };
        Some(value)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int8(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::UInt8(v) => write!(f, "{}", v),
            Value::UInt16(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::Float32(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Date(v) => write!(f, "{}", v),
            Value::Timestamp(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_roundtrip() {
        let types = [
            LogicalType::Bool,
            LogicalType::Int32,
            LogicalType::UInt64,
            LogicalType::Float64,
            LogicalType::Timestamp,
            LogicalType::Char { width: 8 },
            LogicalType::Varchar { width: 32 },
        ];
        for ty in types {
            let mut buf = Vec::new();
            ty.encode(&mut buf);
            assert_eq!(LogicalType::decode(&mut &buf[..]), Some(ty));
        }
    }

    #[test]
    fn key_encoding_preserves_order() {
        let pairs = [
            (Value::Int32(-5), Value::Int32(3)),
            (Value::Int64(i64::MIN), Value::Int64(i64::MAX)),
            (Value::Float64(-1.5), Value::Float64(0.25)),
            (Value::UInt32(1), Value::UInt32(2)),
            (
                Value::String("abc".into()),
                Value::String("abd".into()),
            ),
        ];
        for (lo, hi) in pairs {
            let (mut a, mut b) = (Vec::new(), Vec::new());
            lo.encode_key(&mut a);
            hi.encode_key(&mut b);
            assert!(a < b, "{:?} !< {:?}", lo, hi);
        }
    }

    #[test]
    fn value_roundtrip() {
        let cases = [
            (LogicalType::Int32, Value::Int32(-42)),
            (LogicalType::UInt64, Value::UInt64(7)),
            (LogicalType::Float32, Value::Float32(-2.5)),
            (LogicalType::Varchar { width: 16 }, Value::String("xy".into())),
            (LogicalType::Int32, Value::Null),
        ];
        for (ty, value) in cases {
            let mut buf = Vec::new();
            value.encode(&mut buf);
            assert_eq!(Value::decode(&ty, &mut &buf[..]), Some(value));
        }
    }
}
