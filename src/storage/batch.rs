// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

//! Typed column vectors and row batches.
//!
//! A [`Batch`] is the unit handed to the relation append path: one
//! [`ColumnVec`] per schema column, all of equal length. Column payloads
//! encode to `row_count (4B BE) | validity bitmap | values`, with
//! fixed-width values little-endian and strings through an offset table.

use bitvec::order::Lsb0;
use bitvec::vec::BitVec;
use bytes::{Buf, BufMut};

use super::{StorageResult, TracedStorageError};
use crate::types::{LogicalType, Value};

type ValidityMap = BitVec<u8, Lsb0>;

#[derive(Clone, Debug, PartialEq)]
enum Values {
    Bool(Vec<bool>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Str(Vec<String>),
}

impl Values {
    fn with_type(ty: &LogicalType) -> Self {
        match ty {
            LogicalType::Bool => Values::Bool(Vec::new()),
            LogicalType::Int8 => Values::I8(Vec::new()),
            LogicalType::Int16 => Values::I16(Vec::new()),
            LogicalType::Int32 | LogicalType::Date => Values::I32(Vec::new()),
            LogicalType::Int64 | LogicalType::Timestamp => Values::I64(Vec::new()),
            LogicalType::UInt8 => Values::U8(Vec::new()),
            LogicalType::UInt16 => Values::U16(Vec::new()),
            LogicalType::UInt32 => Values::U32(Vec::new()),
            LogicalType::UInt64 => Values::U64(Vec::new()),
            LogicalType::Float32 => Values::F32(Vec::new()),
            LogicalType::Float64 => Values::F64(Vec::new()),
            LogicalType::Char { .. } | LogicalType::Varchar { .. } => Values::Str(Vec::new()),
        }
    }

    fn len(&self) -> usize {
        match self {
            Values::Bool(v) => v.len(),
            Values::I8(v) => v.len(),
            Values::I16(v) => v.len(),
            Values::I32(v) => v.len(),
            Values::I64(v) => v.len(),
            Values::U8(v) => v.len(),
            Values::U16(v) => v.len(),
            Values::U32(v) => v.len(),
            Values::U64(v) => v.len(),
            Values::F32(v) => v.len(),
            Values::F64(v) => v.len(),
            Values::Str(v) => v.len(),
        }
    }
}

/// One column's values plus a validity bitmap.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnVec {
    ty: LogicalType,
    validity: ValidityMap,
    values: Values,
}

impl ColumnVec {
    pub fn new(ty: LogicalType) -> Self {
        Self {
            values: Values::with_type(&ty),
            validity: ValidityMap::new(),
            ty,
        }
    }

    pub fn from_values(
        ty: LogicalType,
        values: impl IntoIterator<Item = Value>,
    ) -> StorageResult<Self> {
        let mut col = Self::new(ty);
        for value in values {
            col.push(value)?;
        }
        Ok(col)
    }

    pub fn logical_type(&self) -> &LogicalType {
        &self.ty
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_valid(&self, row: usize) -> bool {
        self.validity[row]
    }

    pub fn has_nulls(&self) -> bool {
        self.validity.count_zeros() > 0
    }

    /// Append one value. `Null` stores the type's default payload and a
    /// cleared validity bit.
    pub fn push(&mut self, value: Value) -> StorageResult<()> {
        if !value.fits(&self.ty) {
            return Err(TracedStorageError::invalid_input(format!(
                "value {:?} does not fit column type {}",
                value, self.ty
            )));
        }
        let valid = !value.is_null();
        match (&mut self.values, value) {
            (Values::Bool(v), Value::Bool(x)) => v.push(x),
            (Values::Bool(v), Value::Null) => v.push(false),
            (Values::I8(v), Value::Int8(x)) => v.push(x),
            (Values::I8(v), Value::Null) => v.push(0),
            (Values::I16(v), Value::Int16(x)) => v.push(x),
            (Values::I16(v), Value::Null) => v.push(0),
            (Values::I32(v), Value::Int32(x)) => v.push(x),
            (Values::I32(v), Value::Date(x)) => v.push(x),
            (Values::I32(v), Value::Null) => v.push(0),
            (Values::I64(v), Value::Int64(x)) => v.push(x),
            (Values::I64(v), Value::Timestamp(x)) => v.push(x),
            (Values::I64(v), Value::Null) => v.push(0),
            (Values::U8(v), Value::UInt8(x)) => v.push(x),
            (Values::U8(v), Value::Null) => v.push(0),
            (Values::U16(v), Value::UInt16(x)) => v.push(x),
            (Values::U16(v), Value::Null) => v.push(0),
            (Values::U32(v), Value::UInt32(x)) => v.push(x),
            (Values::U32(v), Value::Null) => v.push(0),
            (Values::U64(v), Value::UInt64(x)) => v.push(x),
            (Values::U64(v), Value::Null) => v.push(0),
            (Values::F32(v), Value::Float32(x)) => v.push(x),
            (Values::F32(v), Value::Null) => v.push(0.0),
            (Values::F64(v), Value::Float64(x)) => v.push(x),
            (Values::F64(v), Value::Null) => v.push(0.0),
            (Values::Str(v), Value::String(x)) => v.push(x),
            (Values::Str(v), Value::Null) => v.push(String::new()),
            _ => unreachable!("fits() checked above"),
        }
        self.validity.push(valid);
        Ok(())
    }

    pub fn get(&self, row: usize) -> Value {
        if !self.validity[row] {
            return Value::Null;
        }
        match &self.values {
            Values::Bool(v) => Value::Bool(v[row]),
            Values::I8(v) => Value::Int8(v[row]),
            Values::I16(v) => Value::Int16(v[row]),
            Values::I32(v) => match self.ty {
                LogicalType::Date => Value::Date(v[row]),
                _ => Value::Int32(v[row]),
            },
            Values::I64(v) => match self.ty {
                LogicalType::Timestamp => Value::Timestamp(v[row]),
                _ => Value::Int64(v[row]),
            },
            Values::U8(v) => Value::UInt8(v[row]),
            Values::U16(v) => Value::UInt16(v[row]),
            Values::U32(v) => Value::UInt32(v[row]),
            Values::U64(v) => Value::UInt64(v[row]),
            Values::F32(v) => Value::Float32(v[row]),
            Values::F64(v) => Value::Float64(v[row]),
            Values::Str(v) => Value::String(v[row].clone()),
        }
    }

    /// Order-preserving key bytes of one row, empty for null.
    pub fn key_at(&self, row: usize) -> Vec<u8> {
        let mut key = Vec::new();
        self.get(row).encode_key(&mut key);
        key
    }

    /// Overwrite one row in place. Used by the read path when overlaying
    /// update deltas.
    pub fn set(&mut self, row: usize, value: Value) -> StorageResult<()> {
        if !value.fits(&self.ty) {
            return Err(TracedStorageError::invalid_input(format!(
                "value {:?} does not fit column type {}",
                value, self.ty
            )));
        }
        let valid = !value.is_null();
        match (&mut self.values, value) {
            (Values::Bool(v), Value::Bool(x)) => v[row] = x,
            (Values::I8(v), Value::Int8(x)) => v[row] = x,
            (Values::I16(v), Value::Int16(x)) => v[row] = x,
            (Values::I32(v), Value::Int32(x)) => v[row] = x,
            (Values::I32(v), Value::Date(x)) => v[row] = x,
            (Values::I64(v), Value::Int64(x)) => v[row] = x,
            (Values::I64(v), Value::Timestamp(x)) => v[row] = x,
            (Values::U8(v), Value::UInt8(x)) => v[row] = x,
            (Values::U16(v), Value::UInt16(x)) => v[row] = x,
            (Values::U32(v), Value::UInt32(x)) => v[row] = x,
            (Values::U64(v), Value::UInt64(x)) => v[row] = x,
            (Values::F32(v), Value::Float32(x)) => v[row] = x,
            (Values::F64(v), Value::Float64(x)) => v[row] = x,
            (Values::Str(v), Value::String(x)) => v[row] = x,
            (_, Value::Null) => {}
            _ => unreachable!("fits() checked above"),
        }
        self.validity.set(row, valid);
        Ok(())
    }

    /// Copy out rows `[start, end)`.
    pub fn slice(&self, start: usize, end: usize) -> Self {
        let mut out = Self::new(self.ty);
        for row in start..end {
            out.push(self.get(row)).expect("same type");
        }
        out
    }

    /// Encode to the block payload layout.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let n = self.len();
        buf.put_u32(n as u32);
        let mut validity = self.validity.clone();
        validity.set_uninitialized(false);
        buf.put_slice(validity.as_raw_slice());
        match &self.values {
            Values::Bool(v) => v.iter().for_each(|x| buf.put_u8(*x as u8)),
            Values::I8(v) => v.iter().for_each(|x| buf.put_i8(*x)),
            Values::I16(v) => v.iter().for_each(|x| buf.put_i16_le(*x)),
            Values::I32(v) => v.iter().for_each(|x| buf.put_i32_le(*x)),
            Values::I64(v) => v.iter().for_each(|x| buf.put_i64_le(*x)),
            Values::U8(v) => v.iter().for_each(|x| buf.put_u8(*x)),
            Values::U16(v) => v.iter().for_each(|x| buf.put_u16_le(*x)),
            Values::U32(v) => v.iter().for_each(|x| buf.put_u32_le(*x)),
            Values::U64(v) => v.iter().for_each(|x| buf.put_u64_le(*x)),
            Values::F32(v) => v.iter().for_each(|x| buf.put_f32_le(*x)),
            Values::F64(v) => v.iter().for_each(|x| buf.put_f64_le(*x)),
            Values::Str(v) => {
                let mut offset = 0u32;
                buf.put_u32_le(offset);
                for s in v {
                    offset += s.len() as u32;
                    buf.put_u32_le(offset);
                }
                for s in v {
                    buf.put_slice(s.as_bytes());
                }
            }
        }
    }

    /// Decode a payload written by [`ColumnVec::encode`].
    pub fn decode(ty: LogicalType, data: &[u8]) -> StorageResult<Self> {
        let mut buf = data;
        if buf.remaining() < 4 {
            return Err(TracedStorageError::decode("truncated column header"));
        }
        let n = buf.get_u32() as usize;
        let validity_bytes = n.div_ceil(8);
        if buf.remaining() < validity_bytes {
            return Err(TracedStorageError::decode("truncated validity bitmap"));
        }
        let mut validity = ValidityMap::from_vec(buf[..validity_bytes].to_vec());
        validity.truncate(n);
        buf.advance(validity_bytes);

        macro_rules! fixed {
            ($variant:ident, $get:ident, $width:expr) => {{
                if buf.remaining() < n * $width {
                    return Err(TracedStorageError::decode("truncated column payload"));
                }
                Values::$variant((0..n).map(|_| buf.$get()).collect())
            }};
        }
        let values = match ty {
            LogicalType::Bool => {
                if buf.remaining() < n {
                    return Err(TracedStorageError::decode("truncated column payload"));
                }
                Values::Bool((0..n).map(|_| buf.get_u8() != 0).collect())
            }
            LogicalType::Int8 => fixed!(I8, get_i8, 1),
            LogicalType::Int16 => fixed!(I16, get_i16_le, 2),
            LogicalType::Int32 | LogicalType::Date => fixed!(I32, get_i32_le, 4),
            LogicalType::Int64 | LogicalType::Timestamp => fixed!(I64, get_i64_le, 8),
            LogicalType::UInt8 => fixed!(U8, get_u8, 1),
            LogicalType::UInt16 => fixed!(U16, get_u16_le, 2),
            LogicalType::UInt32 => fixed!(U32, get_u32_le, 4),
            LogicalType::UInt64 => fixed!(U64, get_u64_le, 8),
            LogicalType::Float32 => fixed!(F32, get_f32_le, 4),
            LogicalType::Float64 => fixed!(F64, get_f64_le, 8),
            LogicalType::Char { .. } | LogicalType::Varchar { .. } => {
                if buf.remaining() < (n + 1) * 4 {
                    return Err(TracedStorageError::decode("truncated offset table"));
                }
                let offsets: Vec<u32> = (0..=n).map(|_| buf.get_u32_le()).collect();
                let total = *offsets.last().unwrap() as usize;
                if buf.remaining() < total {
                    return Err(TracedStorageError::decode("truncated string payload"));
                }
                let bytes = &buf[..total];
                let mut strings = Vec::with_capacity(n);
                for w in offsets.windows(2) {
                    let (lo, hi) = (w[0] as usize, w[1] as usize);
                    if lo > hi || hi > total {
                        return Err(TracedStorageError::decode("bad string offsets"));
                    }
                    let s = std::str::from_utf8(&bytes[lo..hi])
                        .map_err(|_| TracedStorageError::decode("invalid utf-8 payload"))?;
                    strings.push(s.to_string());
                }
                Values::Str(strings)
            }
        };
        Ok(Self {
            ty,
            validity,
            values,
        })
    }
}

/// A batch of rows: one column vector per schema column, equal lengths.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    columns: Vec<ColumnVec>,
}

impl Batch {
    pub fn new(columns: Vec<ColumnVec>) -> StorageResult<Self> {
        if let Some(first) = columns.first() {
            let n = first.len();
            if columns.iter().any(|c| c.len() != n) {
                return Err(TracedStorageError::invalid_input(
                    "batch columns have different lengths",
                ));
            }
        }
        Ok(Self { columns })
    }

    pub fn cardinality(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, idx: usize) -> &ColumnVec {
        &self.columns[idx]
    }

    pub fn columns(&self) -> &[ColumnVec] {
        &self.columns
    }

    pub fn push_column(&mut self, column: ColumnVec) {
        self.columns.push(column);
    }

    /// Copy out rows `[start, end)` across all columns.
    pub fn slice(&self, start: usize, end: usize) -> Self {
        Self {
            columns: self.columns.iter().map(|c| c.slice(start, end)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_column_roundtrip() {
        let col = ColumnVec::from_values(
            LogicalType::Int32,
            [Value::Int32(1), Value::Null, Value::Int32(-3)],
        )
        .unwrap();
        let mut buf = Vec::new();
        col.encode(&mut buf);
        let decoded = ColumnVec::decode(LogicalType::Int32, &buf).unwrap();
        assert_eq!(decoded, col);
        assert_eq!(decoded.get(0), Value::Int32(1));
        assert_eq!(decoded.get(1), Value::Null);
        assert!(decoded.has_nulls());
    }

    #[test]
    fn string_column_roundtrip() {
        let ty = LogicalType::Varchar { width: 32 };
        let col = ColumnVec::from_values(
            ty,
            [
                Value::String("hello".into()),
                Value::String(String::new()),
                Value::Null,
                Value::String("world".into()),
            ],
        )
        .unwrap();
        let mut buf = Vec::new();
        col.encode(&mut buf);
        let decoded = ColumnVec::decode(ty, &buf).unwrap();
        assert_eq!(decoded, col);
    }

    #[test]
    fn type_mismatch_rejected() {
        let mut col = ColumnVec::new(LogicalType::Int32);
        assert!(col.push(Value::String("x".into())).is_err());
    }

    #[test]
    fn batch_slice() {
        let a =
            ColumnVec::from_values(LogicalType::Int32, (0..10).map(Value::Int32)).unwrap();
        let batch = Batch::new(vec![a]).unwrap();
        let part = batch.slice(4, 7);
        assert_eq!(part.cardinality(), 3);
        assert_eq!(part.column(0).get(0), Value::Int32(4));
    }

    #[test]
    fn ragged_batch_rejected() {
        let a = ColumnVec::from_values(LogicalType::Int32, [Value::Int32(1)]).unwrap();
        let b = ColumnVec::from_values(
            LogicalType::Int32,
            [Value::Int32(1), Value::Int32(2)],
        )
        .unwrap();
        assert!(Batch::new(vec![a, b]).is_err());
    }
}
