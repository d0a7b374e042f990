//! Page table for buffer pool page ID to frame ID mapping.

use crate::frame::FrameId;
use std::collections::HashMap;
use tidepool_common::page::PageId;

/// Maps resident page IDs to the frames holding them.
///
/// An entry exists iff the page is currently resident. The table is owned
/// by the pool state and only touched under the pool latch.
#[derive(Debug, Default)]
pub struct PageTable {
    entries: HashMap<PageId, FrameId>,
}

impl PageTable {
    /// Creates a new page table with capacity for the given number of frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// Looks up a page ID and returns its frame ID if present.
    #[inline]
    pub fn get(&self, page_id: PageId) -> Option<FrameId> {
        self.entries.get(&page_id).copied()
    }

    /// Inserts a mapping, returning the frame previously mapped to the page.
    pub fn insert(&mut self, page_id: PageId, frame_id: FrameId) -> Option<FrameId> {
        debug_assert!(page_id.is_valid(), "page table key must be a valid page id");
        self.entries.insert(page_id, frame_id)
    }

    /// Removes a page ID mapping. Returns the frame ID if it was present.
    pub fn remove(&mut self, page_id: PageId) -> Option<FrameId> {
        self.entries.remove(&page_id)
    }

    /// Returns true if the page ID is in the table.
    #[inline]
    pub fn contains(&self, page_id: PageId) -> bool {
        self.entries.contains_key(&page_id)
    }

    /// Returns the number of entries in the table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all entries, calling the provided function for each.
    /// Returns early if the function returns false.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(PageId, FrameId) -> bool,
    {
        for (&page_id, &frame_id) in &self.entries {
            if !f(page_id, frame_id) {
                return;
            }
        }
    }

    /// Returns the resident page IDs in ascending order.
    pub fn page_ids(&self) -> Vec<PageId> {
        let mut ids: Vec<PageId> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
