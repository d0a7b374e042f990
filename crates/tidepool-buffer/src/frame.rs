//! Frame slots and the pages they hold.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use tidepool_common::page::{PageHeader, PageId};

/// Index of a frame in the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FrameId(pub u32);

impl FrameId {
    /// Invalid frame ID.
    pub const INVALID: FrameId = FrameId(u32::MAX);

    /// Returns true if this is a valid frame ID.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Returns the frame index as a usize.
    #[inline(always)]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// A page held in a buffer frame.
///
/// Exactly one `Page` exists per frame for the lifetime of the pool; its
/// page id is reassigned as the frame is recycled.
///
/// Metadata (page id, pin count, dirty flag) is only mutated by the buffer
/// pool while it holds its own latch. The data latch is separate: it guards
/// the bytes for callers that hold a pin.
pub struct Page {
    /// Frame identifier.
    frame_id: FrameId,
    /// The page currently stored in this frame.
    page_id: AtomicI32,
    /// Page data buffer behind the data latch.
    data: RwLock<Box<[u8]>>,
    /// Number of users currently holding this page.
    pin_count: AtomicU32,
    /// Whether the bytes differ from the on-disk copy.
    is_dirty: AtomicBool,
}

impl Page {
    /// Creates an empty page for the given frame.
    pub fn new(frame_id: FrameId, page_size: usize) -> Self {
        Self {
            frame_id,
            page_id: AtomicI32::new(PageId::INVALID.0),
            data: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    /// Returns the frame ID.
    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the page ID, `PageId::INVALID` if the frame is empty.
    #[inline]
    pub fn page_id(&self) -> PageId {
        PageId(self.page_id.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id.0, Ordering::Release);
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the previous pin count.
    #[inline]
    pub(crate) fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the pin count and returns the new pin count.
    ///
    /// Never goes below zero.
    #[inline]
    pub(crate) fn unpin(&self) -> u32 {
        match self
            .pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => 0,
        }
    }

    /// Returns true if this page is pinned.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Returns true if this page is dirty.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Returns true if no page is loaded in this frame.
    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.page_id().is_valid()
    }

    /// Returns the size of the page buffer.
    pub fn page_size(&self) -> usize {
        self.data.read().len()
    }

    /// Acquires the data latch in shared mode.
    #[inline]
    pub fn read_data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Acquires the data latch in exclusive mode.
    #[inline]
    pub fn write_data(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    /// Copies data into the page, starting at offset 0.
    pub fn copy_from(&self, src: &[u8]) {
        let mut data = self.data.write();
        let len = src.len().min(data.len());
        data[..len].copy_from_slice(&src[..len]);
    }

    /// Copies data out of the page, starting at offset 0.
    pub fn copy_to(&self, dst: &mut [u8]) {
        let data = self.data.read();
        let len = dst.len().min(data.len());
        dst[..len].copy_from_slice(&data[..len]);
    }

    /// Returns the log sequence number stored in the page header.
    pub fn lsn(&self) -> i32 {
        PageHeader::read_lsn(&self.data.read())
    }

    /// Stores a log sequence number in the page header.
    pub fn set_lsn(&self, lsn: i32) {
        PageHeader::write_lsn(&mut self.data.write(), lsn);
    }

    /// Zeroes the page bytes.
    #[inline]
    pub(crate) fn reset_memory(&self) {
        self.data.write().fill(0);
    }

    /// Resets the frame to the empty state.
    pub(crate) fn reset(&self) {
        self.page_id.store(PageId::INVALID.0, Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        self.reset_memory();
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("frame_id", &self.frame_id)
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .field("is_dirty", &self.is_dirty())
            .finish()
    }
}
