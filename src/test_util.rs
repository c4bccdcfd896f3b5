// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

//! Mock schemas and batches for tests and benchmarks.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::catalog::Schema;
use crate::storage::{Batch, ColumnVec, StorageResult};
use crate::types::{LogicalType, Value};

/// A schema of `col_cnt` int32 columns named `mock_0..`, with the column at
/// `pk_idx` as primary key. The hidden physical-address column is appended
/// by finalization.
pub fn mock_schema(col_cnt: usize, pk_idx: Option<usize>) -> Schema {
    let mut schema = Schema::new("mock");
    schema.block_max_rows = 16;
    schema.segment_max_blocks = 4;
    for i in 0..col_cnt {
        let name = format!("mock_{}", i);
        if Some(i) == pk_idx {
            schema
                .append_pk_column(&name, LogicalType::Int32, 0)
                .unwrap();
        } else {
            schema.append_column(&name, LogicalType::Int32).unwrap();
        }
    }
    schema.finalize(true).unwrap();
    schema
}

/// A batch of ascending int32 rows `[start, start + rows)` shaped for
/// `schema`; the key column counts up, the rest carry seeded random noise.
pub fn mock_batch(schema: &Schema, rows: i32, start: i32) -> StorageResult<Batch> {
    let mut rng = StdRng::seed_from_u64(start as u64);
    let mut columns = Vec::new();
    for def in schema.column_defs.iter().filter(|d| !d.is_phy_addr()) {
        let column = if def.is_sort_key() {
            ColumnVec::from_values(def.ty, (start..start + rows).map(Value::Int32))?
        } else {
            ColumnVec::from_values(
                def.ty,
                (0..rows).map(|_| Value::Int32(rng.gen_range(0..1 << 20))),
            )?
        };
        columns.push(column);
    }
    Batch::new(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_schema_shape() {
        let schema = mock_schema(3, Some(0));
        // three user columns plus the hidden physical address
        assert_eq!(schema.column_count(), 4);
        assert!(schema.has_pk());
        let batch = mock_batch(&schema, 8, 100).unwrap();
        assert_eq!(batch.column_count(), 3);
        assert_eq!(batch.cardinality(), 8);
        assert_eq!(batch.column(0).get(0), Value::Int32(100));
    }
}
