// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

//! The typed write-ahead log: entry kinds, the append store and the
//! replayer with checkpoint-range suppression.

mod entry;
mod interval;
mod replayer;
mod store;

pub use entry::*;
pub use interval::*;
pub use replayer::*;
pub use store::*;
