//! Buffer pool management for Tidepool.
//!
//! This crate provides in-memory page caching with:
//! - Fixed-size buffer pool with configurable page count
//! - Clock or LRU eviction, chosen at construction
//! - A lock-free recency list backing the LRU policy
//! - Pin counting and scoped page guards for concurrent access
//! - Dirty page tracking with write-back on eviction

mod frame;
mod lru;
mod page_table;
mod pool;
mod recency_list;
mod replacer;

pub use frame::{FrameId, Page};
pub use lru::LruReplacer;
pub use page_table::PageTable;
pub use pool::{BasicPageGuard, BufferPool, BufferPoolStats, PageReadGuard, PageWriteGuard};
pub use recency_list::{NodeHandle, RecencyList, SlotValue};
pub use replacer::{AnyReplacer, ClockReplacer, Replacer};
