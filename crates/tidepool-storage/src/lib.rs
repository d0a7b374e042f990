//! Storage layer for Tidepool.
//!
//! This crate provides:
//! - The `DiskIo` contract the buffer pool depends on
//! - `DiskManager`, a single-file implementation with fsync-on-write
//! - `MemoryDisk`, an in-memory implementation for tests

mod disk;
mod memory;

pub use disk::{DiskIo, DiskManager};
pub use memory::MemoryDisk;
