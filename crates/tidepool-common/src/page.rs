//! Page identifiers and on-page header layout for Tidepool storage.

use serde::{Deserialize, Serialize};

/// Default page size in bytes (4 KB).
pub const DEFAULT_PAGE_SIZE: usize = 4 * 1024;

/// Logical identifier of a page.
///
/// Page ids index a virtual array of fixed-size blocks in the database file.
/// They are allocated monotonically and never reused after deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub i32);

impl PageId {
    /// Sentinel meaning "no page".
    pub const INVALID: PageId = PageId(-1);

    /// Creates a new PageId.
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    /// Returns true if this id refers to a real page.
    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }

    /// Returns the byte offset of this page in a file of `page_size` blocks.
    ///
    /// Returns None for invalid ids.
    pub fn file_offset(&self, page_size: usize) -> Option<u64> {
        if !self.is_valid() {
            return None;
        }
        Some(self.0 as u64 * page_size as u64)
    }

    /// Returns the id that follows this one, or None at `i32::MAX`.
    pub fn next(&self) -> Option<PageId> {
        self.0.checked_add(1).map(PageId)
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "page:{}", self.0)
        } else {
            write!(f, "page:invalid")
        }
    }
}

/// Fixed header at the start of every page.
///
/// Layout (8 bytes total):
/// - page_start: 4 bytes (reserved for higher layers)
/// - lsn: 4 bytes, little-endian
pub struct PageHeader;

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 8;

    /// Offset of the log sequence number.
    pub const LSN_OFFSET: usize = 4;

    /// Reads the LSN from a page buffer.
    pub fn read_lsn(buf: &[u8]) -> i32 {
        let o = Self::LSN_OFFSET;
        i32::from_le_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]])
    }

    /// Writes the LSN into a page buffer.
    pub fn write_lsn(buf: &mut [u8], lsn: i32) {
        let o = Self::LSN_OFFSET;
        buf[o..o + 4].copy_from_slice(&lsn.to_le_bytes());
    }
}
