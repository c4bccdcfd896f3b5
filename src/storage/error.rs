// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

use std::backtrace::Backtrace;
use std::sync::Arc;

use thiserror::Error;

/// Error kinds surfaced by the storage engine.
///
/// `ConstraintViolation` and `InvalidInput` are user-visible misuse; I/O and
/// allocator errors propagate unchanged; `Fatal` means an invariant was
/// broken at runtime and the engine must shut down.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}({1}) not found")]
    NotFound(&'static str, String),
    #[error("duplicate key: {0}")]
    Duplicate(String),
    #[error("out of space: requested {0} bytes")]
    OutOfSpace(u64),
    #[error("invalid extent: offset {0} length {1}")]
    InvalidExtent(u64, u64),
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid checksum: found {0}, expected {1}")]
    Checksum(u32, u32),
    #[error("timeout: {0}")]
    Timeout(&'static str),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("{0}")]
    Nested(
        #[from]
        #[backtrace]
        Arc<TracedStorageError>,
    ),
}

impl From<std::io::Error> for TracedStorageError {
    #[inline]
    fn from(e: std::io::Error) -> TracedStorageError {
        StorageError::Io(e.into()).into()
    }
}

impl From<Arc<TracedStorageError>> for TracedStorageError {
    #[inline]
    fn from(e: Arc<TracedStorageError>) -> TracedStorageError {
        StorageError::Nested(e).into()
    }
}

/// [`StorageError`] with backtrace.
#[derive(Error)]
#[error("{source:?}\n{backtrace}")]
pub struct TracedStorageError {
    #[from]
    source: StorageError,
    backtrace: Backtrace,
}

impl std::fmt::Debug for TracedStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl TracedStorageError {
    pub fn kind(&self) -> &StorageError {
        &self.source
    }

    pub fn constraint(message: impl ToString) -> Self {
        StorageError::ConstraintViolation(message.to_string()).into()
    }

    pub fn invalid_input(message: impl ToString) -> Self {
        StorageError::InvalidInput(message.to_string()).into()
    }

    pub fn not_found(ty: &'static str, item: impl ToString) -> Self {
        StorageError::NotFound(ty, item.to_string()).into()
    }

    pub fn duplicate(key: impl ToString) -> Self {
        StorageError::Duplicate(key.to_string()).into()
    }

    pub fn out_of_space(requested: u64) -> Self {
        StorageError::OutOfSpace(requested).into()
    }

    pub fn invalid_extent(offset: u64, length: u64) -> Self {
        StorageError::InvalidExtent(offset, length).into()
    }

    pub fn decode(message: impl ToString) -> Self {
        StorageError::Decode(message.to_string()).into()
    }

    pub fn checksum(found: u32, expected: u32) -> Self {
        StorageError::Checksum(found, expected).into()
    }

    pub fn fatal(message: impl ToString) -> Self {
        StorageError::Fatal(message.to_string()).into()
    }
}

pub type StorageResult<T> = std::result::Result<T, TracedStorageError>;
