// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

//! ColStore is a columnar table storage engine.
//!
//! Row batches enter through the relation API, get split into bounded
//! blocks, and are persisted column-by-column into segment files. A segment
//! file carries its own allocator and an embedded log that journals inode
//! metadata, so a half-written segment recovers to its last durable state.
//! Engine-level visibility is gated by a typed write-ahead log whose replay
//! suppresses checkpointed ranges and stitches uncommitted fragments back
//! onto their committing transaction.

#![feature(error_generic_member_access)]
#![deny(unused_must_use)]

pub mod catalog;
pub mod storage;
pub mod test_util;
pub mod types;

pub use self::storage::{
    ColumnarStorage, StorageError, StorageOptions, StorageResult, TracedStorageError,
};
