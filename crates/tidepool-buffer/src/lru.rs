//! Least-recently-unpinned replacement over the lock-free recency list.

use crate::frame::FrameId;
use crate::recency_list::{NodeHandle, RecencyList};
use crate::replacer::Replacer;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// LRU replacement without a replacer-wide lock.
///
/// Unpinned frames are pushed at the head of the recency list; the victim is
/// the node at the tail. `index` maps each evictable frame to its node, and
/// whoever removes a frame's entry from it is the one that deletes the node.
pub struct LruReplacer {
    list: RecencyList<FrameId>,
    index: DashMap<FrameId, NodeHandle>,
    num_frames: usize,
}

impl LruReplacer {
    /// Creates a new LRU replacer with the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            list: RecencyList::new(),
            index: DashMap::with_capacity(num_frames),
            num_frames,
        }
    }

    /// Returns the total capacity.
    pub fn capacity(&self) -> usize {
        self.num_frames
    }

    fn untrack(&self, frame_id: FrameId) {
        if let Some((_, handle)) = self.index.remove(&frame_id) {
            self.list.delete(&handle);
        }
    }
}

impl Replacer for LruReplacer {
    fn victim(&self) -> Option<FrameId> {
        loop {
            let (handle, frame_id) = self.list.tail()?;
            // Lost the race to a concurrent pin, or the node is a duplicate
            // about to be deleted by its own unpin.
            if self
                .index
                .remove_if(&frame_id, |_, indexed| *indexed == handle)
                .is_some()
            {
                self.list.delete(&handle);
                return Some(frame_id);
            }
            std::hint::spin_loop();
        }
    }

    fn pin(&self, frame_id: FrameId) {
        self.untrack(frame_id);
    }

    fn unpin(&self, frame_id: FrameId) {
        if frame_id.index() >= self.num_frames {
            return;
        }

        let handle = self.list.push_head(frame_id);
        match self.index.entry(frame_id) {
            Entry::Vacant(entry) => {
                entry.insert(handle);
            }
            Entry::Occupied(_) => {
                // Already evictable; keep its original position.
                self.list.delete(&handle);
            }
        }
    }

    /// Removing a frame the policy does not track is a no-op. LRU keeps no
    /// pinned set, so it cannot tell a pinned frame from an untracked one.
    fn remove(&self, frame_id: FrameId) {
        self.untrack(frame_id);
    }

    fn size(&self) -> usize {
        self.index.len()
    }
}
