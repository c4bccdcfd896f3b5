// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

//! Table schema and column definitions enforced by the engine.

mod column;
mod schema;

pub use column::*;
pub use schema::*;

/// Name of the engine-generated hidden physical-address column.
pub const PHY_ADDR_COLUMN_NAME: &str = "__rowid";

/// Comment attached to the generated physical-address column.
pub const PHY_ADDR_COLUMN_COMMENT: &str = "engine generated physical address";
