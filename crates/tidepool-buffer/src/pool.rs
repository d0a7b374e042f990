//! Buffer pool manager.

use crate::frame::{FrameId, Page};
use crate::page_table::PageTable;
use crate::replacer::{AnyReplacer, Replacer};
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use sysinfo::System;
use tidepool_common::page::PageId;
use tidepool_common::{BufferConfig, ReplacerKind, Result, TidepoolError};
use tidepool_storage::DiskIo;
use tracing::{debug, trace, warn};

/// Bookkeeping guarded by the pool latch.
struct PoolState {
    /// Page ID to frame ID mapping for resident pages.
    page_table: PageTable,
    /// Frames that hold no page.
    free_list: VecDeque<FrameId>,
    /// Next page ID handed out by `new_page`, None once `i32::MAX` is used.
    next_page_id: Option<PageId>,
}

/// Buffer pool manager.
///
/// Manages a fixed-size pool of page frames with:
/// - Page ID to frame ID mapping
/// - Free frame list, used before evicting anything
/// - A pluggable replacement policy (clock or LRU)
/// - Pin counting for concurrent access
/// - Write-back of dirty victims through the disk manager
///
/// Every operation except `flush_all_pages` runs entirely under one pool
/// latch. Each frame is always in exactly one of three places: the free list,
/// the replacer (resident with pin count 0), or in use (pinned).
pub struct BufferPool {
    /// Configuration.
    config: BufferConfig,
    /// Array of frames, one page each, never resized.
    frames: Vec<Page>,
    /// Page table, free list, and id allocator.
    state: Mutex<PoolState>,
    /// Page replacement policy.
    replacer: AnyReplacer,
    /// Backing storage.
    disk: Arc<dyn DiskIo>,
}

impl BufferPool {
    /// Creates a new buffer pool over `disk`.
    pub fn new(config: BufferConfig, disk: Arc<dyn DiskIo>) -> Result<Self> {
        config.validate()?;
        if disk.page_size() != config.page_size {
            return Err(TidepoolError::PageSizeMismatch {
                expected: config.page_size,
                actual: disk.page_size(),
            });
        }

        let num_frames = config.pool_size;

        // Initialize frames
        let frames: Vec<_> = (0..num_frames)
            .map(|i| Page::new(FrameId(i as u32), config.page_size))
            .collect();

        // All frames start in free list
        let free_list: VecDeque<_> = (0..num_frames).map(|i| FrameId(i as u32)).collect();

        debug!(
            pool_size = num_frames,
            page_size = config.page_size,
            replacer = ?config.replacer,
            "buffer pool created"
        );

        Ok(Self {
            replacer: AnyReplacer::new(config.replacer, num_frames),
            state: Mutex::new(PoolState {
                page_table: PageTable::new(num_frames),
                free_list,
                next_page_id: Some(PageId::new(config.first_page_id)),
            }),
            frames,
            config,
            disk,
        })
    }

    /// Creates a buffer pool sized to 25% of available system RAM.
    ///
    /// Minimum 1,000 frames to ensure useful caching even on low-memory
    /// systems. For a system with 16GB available and 4KB pages this
    /// allocates ~4GB (~1M frames).
    pub fn auto_sized(page_size: usize, disk: Arc<dyn DiskIo>) -> Result<Self> {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4; // 25% of available RAM
        let pool_size = (target_bytes / page_size.max(1)).max(1_000);

        Self::new(
            BufferConfig {
                page_size,
                pool_size,
                ..Default::default()
            },
            disk,
        )
    }

    /// Returns the number of frames in the pool.
    pub fn pool_size(&self) -> usize {
        self.config.pool_size
    }

    /// Returns the page size in bytes.
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Returns the replacement policy in use.
    pub fn replacer_kind(&self) -> ReplacerKind {
        self.replacer.kind()
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.state.lock().free_list.len()
    }

    /// Returns the number of pages currently in the pool.
    pub fn page_count(&self) -> usize {
        self.state.lock().page_table.len()
    }

    /// Checks if a page is in the buffer pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.state.lock().page_table.contains(page_id)
    }

    /// Returns the pin count of a resident page.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock();
        state
            .page_table
            .get(page_id)
            .map(|frame_id| self.frames[frame_id.index()].pin_count())
    }

    /// Allocates a new page and pins it.
    ///
    /// The page starts zeroed with pin count 1. Fails with `BufferPoolFull`
    /// when no frame is free and nothing is evictable, and with
    /// `PageIdsExhausted` once every id up to `i32::MAX` has been handed out.
    pub fn new_page(&self) -> Result<&Page> {
        let mut state = self.state.lock();

        // Checked before a frame is taken so failure leaves no frame behind.
        let Some(page_id) = state.next_page_id else {
            warn!("page ids exhausted");
            return Err(TidepoolError::PageIdsExhausted {
                last_page_id: i32::MAX,
            });
        };

        let frame_id = self.acquire_frame(&mut state)?;
        state.next_page_id = page_id.next();

        let page = &self.frames[frame_id.index()];
        page.set_page_id(page_id);
        page.pin();
        state.page_table.insert(page_id, frame_id);
        self.replacer.pin(frame_id);

        trace!(page_id = %page_id, frame_id = %frame_id, "new page");
        Ok(page)
    }

    /// Fetches a page, reading it from disk on a miss, and pins it.
    pub fn fetch_page(&self, page_id: PageId) -> Result<&Page> {
        if !page_id.is_valid() {
            return Err(TidepoolError::InvalidPageId { page_id: page_id.0 });
        }

        let mut state = self.state.lock();

        if let Some(frame_id) = state.page_table.get(page_id) {
            let page = &self.frames[frame_id.index()];
            page.pin();
            self.replacer.pin(frame_id);
            trace!(page_id = %page_id, frame_id = %frame_id, pin_count = page.pin_count(), "page hit");
            return Ok(page);
        }

        trace!(page_id = %page_id, "page miss");
        let frame_id = self.acquire_frame(&mut state)?;
        let page = &self.frames[frame_id.index()];

        let read = {
            let mut data = page.write_data();
            self.disk.read_page(page_id, &mut data)
        };
        if let Err(e) = read {
            warn!(page_id = %page_id, frame_id = %frame_id, error = %e, "failed to read page");
            page.reset();
            state.free_list.push_back(frame_id);
            return Err(e);
        }

        page.set_page_id(page_id);
        page.pin();
        state.page_table.insert(page_id, frame_id);
        self.replacer.pin(frame_id);

        Ok(page)
    }

    /// Takes a frame from the free list, or evicts a victim.
    ///
    /// A dirty victim is written back before its frame is reused. The
    /// returned frame is zeroed, unmapped, and unpinned.
    fn acquire_frame(&self, state: &mut PoolState) -> Result<FrameId> {
        // Try free list first
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(victim) = self.replacer.victim() else {
            warn!(pool_size = self.config.pool_size, "buffer pool full, every frame is pinned");
            return Err(TidepoolError::BufferPoolFull);
        };

        let page = &self.frames[victim.index()];
        let old_page_id = page.page_id();
        debug!(frame_id = %victim, page_id = %old_page_id, dirty = page.is_dirty(), "evicting page");

        if page.is_dirty() {
            let written = {
                let data = page.read_data();
                self.disk.write_page(old_page_id, &data)
            };
            if let Err(e) = written {
                warn!(page_id = %old_page_id, error = %e, "write-back of dirty victim failed");
                // Still resident and dirty; make it evictable again.
                self.replacer.unpin(victim);
                return Err(e);
            }
            debug!(page_id = %old_page_id, "wrote back dirty page");
        }

        state.page_table.remove(old_page_id);
        page.reset();
        assert_eq!(page.pin_count(), 0, "victim {victim} is still pinned");

        Ok(victim)
    }

    /// Unpins a page.
    ///
    /// `is_dirty` only ever sets the dirty flag; it is cleared by flushing.
    /// When the pin count reaches zero the page becomes evictable. Returns
    /// false if the page is not resident or not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let state = self.state.lock();

        let Some(frame_id) = state.page_table.get(page_id) else {
            warn!(page_id = %page_id, "unpin of non-resident page");
            return false;
        };
        let page = &self.frames[frame_id.index()];

        if page.pin_count() == 0 {
            warn!(page_id = %page_id, "unpin of page with pin count 0");
            return false;
        }

        if is_dirty {
            page.set_dirty(true);
        }

        let remaining = page.unpin();
        if remaining == 0 {
            self.replacer.unpin(frame_id);
        }
        trace!(page_id = %page_id, pin_count = remaining, "page unpinned");
        true
    }

    /// Writes a resident page to disk, dirty or not, and clears its dirty flag.
    ///
    /// The page is pinned for the duration of the write. Its data latch is
    /// only taken after the pool latch has been released, so a flush waits
    /// behind a write guard without stalling the rest of the pool.
    ///
    /// Returns false if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let page = {
            let state = self.state.lock();
            let Some(frame_id) = state.page_table.get(page_id) else {
                return Ok(false);
            };
            let page = &self.frames[frame_id.index()];
            page.pin();
            self.replacer.pin(frame_id);
            page
        };

        let written = {
            let data = page.read_data();
            // A writer that lands after this point marks the page dirty again.
            page.set_dirty(false);
            self.disk.write_page(page_id, &data)
        };

        let failed = written.is_err();
        self.unpin_page(page_id, failed);
        if let Err(e) = written {
            warn!(page_id = %page_id, error = %e, "flush failed");
            return Err(e);
        }

        trace!(page_id = %page_id, "page flushed");
        Ok(true)
    }

    /// Flushes every resident page.
    ///
    /// The pool latch is taken per page, not for the whole sweep: pages
    /// loaded or evicted concurrently may or may not be flushed, and a page
    /// may be written in a state newer than when the sweep began.
    ///
    /// Returns the number of pages flushed.
    pub fn flush_all_pages(&self) -> Result<usize> {
        let page_ids = self.state.lock().page_table.page_ids();

        let mut flushed = 0;
        for page_id in page_ids {
            if self.flush_page(page_id)? {
                flushed += 1;
            }
        }

        debug!(flushed, "flushed all pages");
        Ok(flushed)
    }

    /// Deletes a page from the buffer pool.
    ///
    /// Returns true if the page is gone afterwards, including when it was
    /// never resident. Returns false if the page is pinned. Dirty contents
    /// are discarded.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut state = self.state.lock();

        let Some(frame_id) = state.page_table.get(page_id) else {
            return true;
        };
        let page = &self.frames[frame_id.index()];

        // Cannot delete pinned page
        if page.is_pinned() {
            debug!(page_id = %page_id, pin_count = page.pin_count(), "refusing to delete pinned page");
            return false;
        }

        self.replacer.remove(frame_id);
        state.page_table.remove(page_id);
        page.reset();
        state.free_list.push_back(frame_id);
        self.deallocate_page(page_id);

        debug!(page_id = %page_id, frame_id = %frame_id, "page deleted");
        true
    }

    /// Releases the on-disk space of a deleted page.
    ///
    /// Page ids are never reused, so there is nothing to release yet.
    fn deallocate_page(&self, page_id: PageId) {
        trace!(page_id = %page_id, "page id retired");
    }

    /// Flushes all pages and shuts the disk down.
    pub fn shutdown(&self) -> Result<()> {
        self.flush_all_pages()?;
        self.disk.shutdown()
    }

    /// Fetches a page and returns a guard that unpins it on drop.
    pub fn fetch_page_basic(&self, page_id: PageId) -> Result<BasicPageGuard<'_>> {
        let page = self.fetch_page(page_id)?;
        Ok(BasicPageGuard::new(self, page))
    }

    /// Fetches a page and holds its data latch in shared mode.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<PageReadGuard<'_>> {
        Ok(self.fetch_page_basic(page_id)?.upgrade_read())
    }

    /// Fetches a page and holds its data latch in exclusive mode.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<PageWriteGuard<'_>> {
        Ok(self.fetch_page_basic(page_id)?.upgrade_write())
    }

    /// Allocates a new page and holds its data latch in exclusive mode.
    pub fn new_page_write(&self) -> Result<PageWriteGuard<'_>> {
        let page = self.new_page()?;
        Ok(BasicPageGuard::new(self, page).upgrade_write())
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let state = self.state.lock();
        let mut pinned_count = 0;
        let mut dirty_count = 0;

        state.page_table.for_each(|_, frame_id| {
            let page = &self.frames[frame_id.index()];
            if page.is_pinned() {
                pinned_count += 1;
            }
            if page.is_dirty() {
                dirty_count += 1;
            }
            true // continue iteration
        });

        BufferPoolStats {
            total_frames: self.config.pool_size,
            free_frames: state.free_list.len(),
            used_frames: state.page_table.len(),
            pinned_frames: pinned_count,
            dirty_frames: dirty_count,
            evictable_frames: self.replacer.size(),
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("config", &self.config)
            .field("replacer", &self.replacer)
            .finish_non_exhaustive()
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
    /// Number of frames the replacer can evict.
    pub evictable_frames: usize,
}

/// RAII guard holding one pin on a page.
pub struct BasicPageGuard<'a> {
    pool: &'a BufferPool,
    page: &'a Page,
    page_id: PageId,
    is_dirty: bool,
}

impl<'a> BasicPageGuard<'a> {
    fn new(pool: &'a BufferPool, page: &'a Page) -> Self {
        Self {
            pool,
            page,
            page_id: page.page_id(),
            is_dirty: false,
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the pinned page.
    pub fn page(&self) -> &'a Page {
        self.page
    }

    /// Reports the page as dirty when the pin is released.
    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    /// Acquires the shared data latch, keeping the pin.
    pub fn upgrade_read(self) -> PageReadGuard<'a> {
        PageReadGuard {
            data: self.page.read_data(),
            pin: self,
        }
    }

    /// Acquires the exclusive data latch, keeping the pin.
    pub fn upgrade_write(self) -> PageWriteGuard<'a> {
        PageWriteGuard {
            data: self.page.write_data(),
            pin: self,
        }
    }
}

impl Drop for BasicPageGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, self.is_dirty);
    }
}

/// RAII guard for reading a page.
///
/// Holds a pin and the shared data latch. The latch is released before the
/// pin.
pub struct PageReadGuard<'a> {
    // Field order is drop order.
    data: RwLockReadGuard<'a, Box<[u8]>>,
    pin: BasicPageGuard<'a>,
}

impl PageReadGuard<'_> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    /// Returns the page data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl std::ops::Deref for PageReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

/// RAII guard for writing a page.
///
/// Holds a pin and the exclusive data latch. Mutable access marks the page
/// dirty when the guard is dropped.
pub struct PageWriteGuard<'a> {
    // Field order is drop order.
    data: RwLockWriteGuard<'a, Box<[u8]>>,
    pin: BasicPageGuard<'a>,
}

impl PageWriteGuard<'_> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    /// Returns the page data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns mutable access to page data.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.pin.is_dirty = true;
        &mut self.data
    }
}

impl std::ops::Deref for PageWriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::ops::DerefMut for PageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tidepool_common::page::PageHeader;
    use tidepool_storage::MemoryDisk;

    const TEST_PAGE_SIZE: usize = 128;

    fn test_config(pool_size: usize, replacer: ReplacerKind) -> BufferConfig {
        BufferConfig {
            page_size: TEST_PAGE_SIZE,
            pool_size,
            replacer,
            first_page_id: 0,
        }
    }

    fn create_test_pool(pool_size: usize) -> (BufferPool, Arc<MemoryDisk>) {
        create_test_pool_with(pool_size, ReplacerKind::Clock)
    }

    fn create_test_pool_with(
        pool_size: usize,
        replacer: ReplacerKind,
    ) -> (BufferPool, Arc<MemoryDisk>) {
        let disk = Arc::new(MemoryDisk::new(TEST_PAGE_SIZE));
        let pool = BufferPool::new(test_config(pool_size, replacer), disk.clone()).unwrap();
        (pool, disk)
    }

    #[test]
    fn test_buffer_pool_new() {
        let (pool, _disk) = create_test_pool(10);

        assert_eq!(pool.pool_size(), 10);
        assert_eq!(pool.page_size(), TEST_PAGE_SIZE);
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.page_count(), 0);
        assert_eq!(pool.replacer_kind(), ReplacerKind::Clock);
    }

    #[test]
    fn test_buffer_pool_rejects_bad_config() {
        let disk = Arc::new(MemoryDisk::new(TEST_PAGE_SIZE));
        let err = BufferPool::new(test_config(0, ReplacerKind::Clock), disk).unwrap_err();
        assert!(matches!(err, TidepoolError::ConfigError(_)));

        let disk = Arc::new(MemoryDisk::new(256));
        let err = BufferPool::new(test_config(4, ReplacerKind::Clock), disk).unwrap_err();
        assert!(matches!(
            err,
            TidepoolError::PageSizeMismatch {
                expected: TEST_PAGE_SIZE,
                actual: 256
            }
        ));
    }

    #[test]
    fn test_buffer_pool_new_page() {
        let (pool, _disk) = create_test_pool(10);

        let page = pool.new_page().unwrap();

        assert_eq!(page.page_id(), PageId::new(0));
        assert_eq!(page.pin_count(), 1);
        assert!(!page.is_dirty());
        assert!(page.read_data().iter().all(|&b| b == 0));
        assert_eq!(pool.free_count(), 9);
        assert_eq!(pool.page_count(), 1);
        assert!(pool.contains(PageId::new(0)));
    }

    #[test]
    fn test_buffer_pool_new_page_ids_are_sequential() {
        let (pool, _disk) = create_test_pool(5);

        for i in 0..5 {
            let page = pool.new_page().unwrap();
            assert_eq!(page.page_id(), PageId::new(i));
            assert_eq!(page.pin_count(), 1);
        }

        // Failed allocation does not burn an id
        assert!(matches!(pool.new_page(), Err(TidepoolError::BufferPoolFull)));
        assert!(pool.unpin_page(PageId::new(2), false));
        assert_eq!(pool.new_page().unwrap().page_id(), PageId::new(5));
    }

    #[test]
    fn test_buffer_pool_first_page_id() {
        let disk = Arc::new(MemoryDisk::new(TEST_PAGE_SIZE));
        let config = BufferConfig {
            first_page_id: 40,
            ..test_config(4, ReplacerKind::Clock)
        };
        let pool = BufferPool::new(config, disk).unwrap();
        assert_eq!(pool.new_page().unwrap().page_id(), PageId::new(40));
        assert_eq!(pool.new_page().unwrap().page_id(), PageId::new(41));
    }

    #[test]
    fn test_buffer_pool_page_ids_exhausted() {
        let disk = Arc::new(MemoryDisk::new(TEST_PAGE_SIZE));
        let config = BufferConfig {
            first_page_id: i32::MAX,
            ..test_config(2, ReplacerKind::Clock)
        };
        let pool = BufferPool::new(config, disk).unwrap();

        // The last id is still usable
        let page = pool.new_page().unwrap();
        assert_eq!(page.page_id(), PageId::new(i32::MAX));
        assert_eq!(pool.free_count(), 1);

        assert!(matches!(
            pool.new_page(),
            Err(TidepoolError::PageIdsExhausted { last_page_id: i32::MAX })
        ));
        // No frame was consumed by the failed call
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.page_count(), 1);

        assert!(pool.unpin_page(PageId::new(i32::MAX), true));
        assert!(pool.new_page().is_err());
        let stats = pool.stats();
        assert_eq!(stats.free_frames + stats.used_frames, 2);
        assert_eq!(stats.evictable_frames, 1);
        assert!(pool.contains(PageId::new(i32::MAX)));
    }

    #[test]
    fn test_buffer_pool_fetch_hit() {
        let (pool, disk) = create_test_pool(10);
        let page_id = pool.new_page().unwrap().page_id();

        let page = pool.fetch_page(page_id).unwrap();
        assert_eq!(page.page_id(), page_id);
        assert_eq!(page.pin_count(), 2);
        assert_eq!(disk.read_count(), 0);
    }

    #[test]
    fn test_buffer_pool_fetch_miss_reads_disk() {
        let (pool, disk) = create_test_pool(10);
        let mut stored = vec![0u8; TEST_PAGE_SIZE];
        stored[0] = 0x42;
        disk.write_page(PageId::new(7), &stored).unwrap();

        let page = pool.fetch_page(PageId::new(7)).unwrap();
        assert_eq!(page.read_data()[0], 0x42);
        assert_eq!(page.pin_count(), 1);
        assert_eq!(disk.read_count(), 1);
        assert!(pool.contains(PageId::new(7)));
    }

    #[test]
    fn test_buffer_pool_fetch_past_end_is_zeroed() {
        let (pool, _disk) = create_test_pool(2);
        let page = pool.fetch_page(PageId::new(99)).unwrap();
        assert!(page.read_data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_buffer_pool_fetch_invalid_id() {
        let (pool, _disk) = create_test_pool(2);
        assert!(matches!(
            pool.fetch_page(PageId::INVALID),
            Err(TidepoolError::InvalidPageId { page_id: -1 })
        ));
    }

    #[test]
    fn test_buffer_pool_unpin() {
        let (pool, _disk) = create_test_pool(10);
        let page = pool.new_page().unwrap();
        let page_id = page.page_id();

        assert!(pool.unpin_page(page_id, false));
        assert!(!page.is_pinned());

        // Already at zero
        assert!(!pool.unpin_page(page_id, false));
        // Not resident
        assert!(!pool.unpin_page(PageId::new(55), false));
    }

    #[test]
    fn test_buffer_pool_dirty_flag_is_sticky() {
        let (pool, _disk) = create_test_pool(10);
        let page_id = pool.new_page().unwrap().page_id();
        pool.fetch_page(page_id).unwrap();

        assert!(pool.unpin_page(page_id, true));
        assert!(pool.unpin_page(page_id, false));

        let page = pool.fetch_page(page_id).unwrap();
        assert!(page.is_dirty());
    }

    #[test]
    fn test_buffer_pool_eviction_clean() {
        let (pool, disk) = create_test_pool(3);

        for _ in 0..3 {
            let page_id = pool.new_page().unwrap().page_id();
            pool.unpin_page(page_id, false);
        }
        assert_eq!(pool.free_count(), 0);

        let page = pool.new_page().unwrap();
        assert_eq!(page.page_id(), PageId::new(3));
        assert_eq!(pool.page_count(), 3);
        // Clean victim is not written
        assert_eq!(disk.write_count(), 0);
    }

    #[test]
    fn test_buffer_pool_eviction_writes_back_dirty() {
        let (pool, disk) = create_test_pool(1);

        let page = pool.new_page().unwrap();
        let page_id = page.page_id();
        page.write_data()[0] = 0xAB;
        pool.unpin_page(page_id, true);

        let next = pool.new_page().unwrap();
        assert_eq!(next.page_id(), PageId::new(1));
        assert!(next.read_data().iter().all(|&b| b == 0));
        assert!(!pool.contains(page_id));

        let stored = disk.stored_page(page_id).unwrap();
        assert_eq!(stored[0], 0xAB);
        assert_eq!(disk.write_count(), 1);
    }

    #[test]
    fn test_buffer_pool_reload_after_eviction() {
        let (pool, _disk) = create_test_pool(2);

        let body = PageHeader::SIZE..PageHeader::SIZE + 5;
        let page = pool.new_page().unwrap();
        let page_id = page.page_id();
        page.write_data()[body.clone()].copy_from_slice(b"Hello");
        page.set_lsn(12);
        pool.unpin_page(page_id, true);

        for _ in 0..2 {
            let id = pool.new_page().unwrap().page_id();
            pool.unpin_page(id, false);
        }
        assert!(!pool.contains(page_id));

        let page = pool.fetch_page(page_id).unwrap();
        assert_eq!(&page.read_data()[body], b"Hello");
        assert_eq!(page.lsn(), 12);
        assert!(!page.is_dirty());
    }

    #[test]
    fn test_buffer_pool_full_all_pinned() {
        let (pool, _disk) = create_test_pool(2);

        pool.new_page().unwrap();
        pool.new_page().unwrap();

        let result = pool.new_page();
        assert!(matches!(result, Err(TidepoolError::BufferPoolFull)));
        assert!(matches!(
            pool.fetch_page(PageId::new(9)),
            Err(TidepoolError::BufferPoolFull)
        ));
        assert!(TidepoolError::BufferPoolFull.is_recoverable());
    }

    #[test]
    fn test_buffer_pool_write_back_failure_keeps_page() {
        let (pool, disk) = create_test_pool(1);

        let page = pool.new_page().unwrap();
        let page_id = page.page_id();
        page.write_data()[3] = 9;
        pool.unpin_page(page_id, true);

        disk.set_fail_writes(true);
        let err = pool.new_page().unwrap_err();
        assert!(matches!(err, TidepoolError::Io(_)));

        // Victim is still resident, dirty, and evictable
        assert!(pool.contains(page_id));
        let stats = pool.stats();
        assert_eq!(stats.dirty_frames, 1);
        assert_eq!(stats.evictable_frames, 1);
        assert_eq!(pool.fetch_page(page_id).unwrap().read_data()[3], 9);
        pool.unpin_page(page_id, false);

        disk.set_fail_writes(false);
        let next = pool.new_page().unwrap();
        assert_eq!(next.page_id(), PageId::new(1));
        assert_eq!(disk.stored_page(page_id).unwrap()[3], 9);
    }

    #[test]
    fn test_buffer_pool_read_failure_returns_frame() {
        let (pool, disk) = create_test_pool(2);

        disk.set_fail_reads(true);
        assert!(matches!(
            pool.fetch_page(PageId::new(4)),
            Err(TidepoolError::Io(_))
        ));
        assert_eq!(pool.free_count(), 2);
        assert!(!pool.contains(PageId::new(4)));

        disk.set_fail_reads(false);
        assert!(pool.fetch_page(PageId::new(4)).is_ok());
    }

    #[test]
    fn test_buffer_pool_delete_page() {
        let (pool, disk) = create_test_pool(10);
        let page = pool.new_page().unwrap();
        let page_id = page.page_id();
        page.write_data()[0] = 1;
        pool.unpin_page(page_id, true);

        assert!(pool.delete_page(page_id));
        assert!(!pool.contains(page_id));
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.stats().evictable_frames, 0);
        // Dirty contents are discarded
        assert_eq!(disk.write_count(), 0);

        // The next fetch goes to disk
        let reads = disk.read_count();
        pool.fetch_page(page_id).unwrap();
        assert_eq!(disk.read_count(), reads + 1);
    }

    #[test]
    fn test_buffer_pool_delete_absent_page() {
        let (pool, _disk) = create_test_pool(10);
        assert!(pool.delete_page(PageId::new(3)));
        assert_eq!(pool.free_count(), 10);
    }

    #[test]
    fn test_buffer_pool_delete_pinned_page() {
        let (pool, _disk) = create_test_pool(10);
        let page_id = pool.new_page().unwrap().page_id();

        assert!(!pool.delete_page(page_id));
        assert!(pool.contains(page_id));
        assert_eq!(pool.pin_count(page_id), Some(1));
        assert_eq!(pool.free_count(), 9);
    }

    #[test]
    fn test_buffer_pool_deleted_ids_are_not_reused() {
        let (pool, _disk) = create_test_pool(4);
        let page_id = pool.new_page().unwrap().page_id();
        pool.unpin_page(page_id, false);
        assert!(pool.delete_page(page_id));

        assert_eq!(pool.new_page().unwrap().page_id(), PageId::new(1));
    }

    #[test]
    fn test_buffer_pool_flush_page() {
        let (pool, disk) = create_test_pool(10);
        let page = pool.new_page().unwrap();
        let page_id = page.page_id();
        page.write_data()[0] = 0x11;
        pool.unpin_page(page_id, true);

        assert!(pool.flush_page(page_id).unwrap());
        assert_eq!(disk.stored_page(page_id).unwrap()[0], 0x11);
        assert_eq!(pool.stats().dirty_frames, 0);

        // Clean pages are written too
        assert!(pool.flush_page(page_id).unwrap());
        assert_eq!(disk.write_count(), 2);

        assert!(!pool.flush_page(PageId::new(77)).unwrap());
    }

    #[test]
    fn test_buffer_pool_flush_failure_keeps_dirty() {
        let (pool, disk) = create_test_pool(4);
        let page_id = pool.new_page().unwrap().page_id();
        pool.unpin_page(page_id, true);

        disk.set_fail_writes(true);
        assert!(pool.flush_page(page_id).is_err());
        let stats = pool.stats();
        assert_eq!(stats.dirty_frames, 1);
        // The flush pin is released on failure
        assert_eq!(stats.pinned_frames, 0);
        assert_eq!(stats.evictable_frames, 1);
    }

    #[test]
    fn test_buffer_pool_flush_keeps_callers_pin() {
        let (pool, _disk) = create_test_pool(4);
        let page_id = pool.new_page().unwrap().page_id();

        assert!(pool.flush_page(page_id).unwrap());
        assert_eq!(pool.pin_count(page_id), Some(1));
        assert_eq!(pool.stats().evictable_frames, 0);

        assert!(pool.unpin_page(page_id, false));
        assert!(pool.flush_page(page_id).unwrap());
        assert_eq!(pool.pin_count(page_id), Some(0));
        assert_eq!(pool.stats().evictable_frames, 1);
    }

    #[test]
    fn test_buffer_pool_flush_waits_for_write_guard() {
        use std::sync::mpsc;
        use std::sync::Barrier;
        use std::time::Duration;

        let disk = Arc::new(MemoryDisk::new(TEST_PAGE_SIZE));
        let pool = Arc::new(
            BufferPool::new(test_config(4, ReplacerKind::Clock), disk.clone()).unwrap(),
        );
        let guarded = pool.new_page_write().unwrap().page_id();
        let other = pool.new_page_write().unwrap().page_id();

        let barrier = Arc::new(Barrier::new(2));
        let (done_tx, done_rx) = mpsc::channel();

        let holder = {
            let (pool, barrier, done_tx) = (pool.clone(), barrier.clone(), done_tx.clone());
            std::thread::spawn(move || {
                let mut guard = pool.fetch_page_write(guarded).unwrap();
                guard[0] = 0x5a;
                barrier.wait();
                // Give the flusher time to block on the data latch
                std::thread::sleep(Duration::from_millis(50));
                // Touching the pool while holding the latch must not hang
                let child = pool.fetch_page_basic(other).unwrap();
                drop(child);
                drop(guard);
                done_tx.send("holder").unwrap();
            })
        };
        let flusher = {
            let (pool, barrier) = (pool.clone(), barrier.clone());
            std::thread::spawn(move || {
                barrier.wait();
                assert!(pool.flush_page(guarded).unwrap());
                done_tx.send("flusher").unwrap();
            })
        };

        for _ in 0..2 {
            done_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("flush and guard holder deadlocked");
        }
        holder.join().unwrap();
        flusher.join().unwrap();

        // The flush ran after the writer released the latch
        assert_eq!(disk.stored_page(guarded).unwrap()[0], 0x5a);
        assert_eq!(pool.stats().pinned_frames, 0);
    }

    #[test]
    fn test_buffer_pool_flush_all() {
        let (pool, disk) = create_test_pool(10);

        for i in 0..5 {
            let page_id = pool.new_page().unwrap().page_id();
            pool.unpin_page(page_id, i % 2 == 0);
        }

        assert_eq!(pool.flush_all_pages().unwrap(), 5);
        assert_eq!(disk.write_count(), 5);
        assert_eq!(pool.stats().dirty_frames, 0);
    }

    #[test]
    fn test_buffer_pool_shutdown() {
        let (pool, disk) = create_test_pool(4);
        let page_id = pool.new_page().unwrap().page_id();
        pool.unpin_page(page_id, true);

        pool.shutdown().unwrap();
        assert_eq!(disk.write_count(), 1);
        assert!(matches!(pool.flush_page(page_id), Err(TidepoolError::DiskClosed)));
    }

    #[test]
    fn test_buffer_pool_stats() {
        let (pool, _disk) = create_test_pool(10);

        for i in 0..5 {
            let page_id = pool.new_page().unwrap().page_id();
            if i % 2 == 0 {
                pool.unpin_page(page_id, true); // Dirty
            }
            // Odd pages remain pinned
        }

        let stats = pool.stats();
        assert_eq!(stats.total_frames, 10);
        assert_eq!(stats.free_frames, 5);
        assert_eq!(stats.used_frames, 5);
        assert_eq!(stats.pinned_frames, 2); // Pages 1, 3
        assert_eq!(stats.dirty_frames, 3); // Pages 0, 2, 4
        assert_eq!(stats.evictable_frames, 3);
    }

    #[test]
    fn test_buffer_pool_lru_evicts_least_recently_unpinned() {
        let (pool, _disk) = create_test_pool_with(3, ReplacerKind::Lru);
        assert_eq!(pool.replacer_kind(), ReplacerKind::Lru);

        let ids: Vec<_> = (0..3).map(|_| pool.new_page().unwrap().page_id()).collect();
        for &id in [ids[1], ids[0], ids[2]].iter() {
            pool.unpin_page(id, false);
        }

        pool.new_page().unwrap();
        assert!(!pool.contains(ids[1]));
        pool.new_page().unwrap();
        assert!(!pool.contains(ids[0]));
        assert!(pool.contains(ids[2]));
    }

    #[test]
    fn test_buffer_pool_read_guard() {
        let (pool, _disk) = create_test_pool(10);
        let page_id = pool.new_page().unwrap().page_id();
        pool.unpin_page(page_id, false);

        {
            let guard = pool.fetch_page_read(page_id).unwrap();
            assert_eq!(guard.page_id(), page_id);
            assert_eq!(guard.len(), TEST_PAGE_SIZE);
            assert_eq!(pool.pin_count(page_id), Some(1));

            // Shared latch admits other readers
            let other = pool.fetch_page_read(page_id).unwrap();
            assert_eq!(other.data()[0], guard.data()[0]);
            assert_eq!(pool.pin_count(page_id), Some(2));
        }

        assert_eq!(pool.pin_count(page_id), Some(0));
        assert_eq!(pool.stats().dirty_frames, 0);
    }

    #[test]
    fn test_buffer_pool_write_guard() {
        let (pool, _disk) = create_test_pool(10);
        let page_id = pool.new_page().unwrap().page_id();
        pool.unpin_page(page_id, false);

        {
            let mut guard = pool.fetch_page_write(page_id).unwrap();
            guard.data_mut()[0] = 0xFF;
            guard[1] = 0xEE;
        }

        assert_eq!(pool.pin_count(page_id), Some(0));
        let page = pool.fetch_page(page_id).unwrap();
        assert!(page.is_dirty());
        assert_eq!(page.read_data()[0], 0xFF);
        assert_eq!(page.read_data()[1], 0xEE);
    }

    #[test]
    fn test_buffer_pool_write_guard_read_only_stays_clean() {
        let (pool, _disk) = create_test_pool(10);
        let page_id = pool.new_page().unwrap().page_id();
        pool.unpin_page(page_id, false);

        {
            let guard = pool.fetch_page_write(page_id).unwrap();
            assert_eq!(guard.data()[0], 0);
        }
        assert_eq!(pool.stats().dirty_frames, 0);
    }

    #[test]
    fn test_buffer_pool_new_page_write() {
        let (pool, _disk) = create_test_pool(2);
        let page_id = {
            let mut guard = pool.new_page_write().unwrap();
            guard[PageHeader::SIZE] = 5;
            guard.page_id()
        };

        assert_eq!(pool.pin_count(page_id), Some(0));
        let guard = pool.fetch_page_read(page_id).unwrap();
        assert_eq!(guard[PageHeader::SIZE], 5);
    }

    #[test]
    fn test_buffer_pool_basic_guard() {
        let (pool, _disk) = create_test_pool(4);
        let page_id = pool.new_page().unwrap().page_id();
        pool.unpin_page(page_id, false);

        {
            let mut guard = pool.fetch_page_basic(page_id).unwrap();
            assert_eq!(guard.page().pin_count(), 1);
            guard.page().set_lsn(3);
            guard.mark_dirty();
        }
        assert_eq!(pool.pin_count(page_id), Some(0));
        assert_eq!(pool.stats().dirty_frames, 1);
    }

    #[test]
    fn test_buffer_pool_guard_unpins_on_panic() {
        let (pool, _disk) = create_test_pool(4);
        let page_id = pool.new_page().unwrap().page_id();
        pool.unpin_page(page_id, false);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = pool.fetch_page_write(page_id).unwrap();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(pool.pin_count(page_id), Some(0));
        // The data latch was released too
        assert!(pool.fetch_page_write(page_id).is_ok());
    }

    #[test]
    fn test_buffer_pool_concurrent_workers() {
        let (pool, _disk) = create_test_pool(8);
        let ids: Vec<_> = (0..32)
            .map(|_| pool.new_page_write().unwrap().page_id())
            .collect();

        std::thread::scope(|s| {
            for t in 0..4usize {
                let (pool, ids) = (&pool, &ids);
                s.spawn(move || {
                    for round in 0..50 {
                        let page_id = ids[(t * 7 + round * 3) % ids.len()];
                        match pool.fetch_page_write(page_id) {
                            Ok(mut guard) => {
                                let counter = guard[PageHeader::SIZE];
                                guard[PageHeader::SIZE] = counter.wrapping_add(1);
                            }
                            Err(e) => assert!(e.is_recoverable()),
                        }
                    }
                });
            }
        });

        let stats = pool.stats();
        assert_eq!(stats.pinned_frames, 0);
        assert_eq!(stats.free_frames + stats.used_frames, 8);
        assert_eq!(stats.evictable_frames, stats.used_frames);
    }

    #[derive(Debug, Clone)]
    enum PoolOp {
        New,
        Fetch(i32),
        Unpin(i32, bool),
        Delete(i32),
        Flush(i32),
    }

    fn pool_op() -> impl Strategy<Value = PoolOp> {
        prop_oneof![
            Just(PoolOp::New),
            (0..12i32).prop_map(PoolOp::Fetch),
            (0..12i32, any::<bool>()).prop_map(|(id, dirty)| PoolOp::Unpin(id, dirty)),
            (0..12i32).prop_map(PoolOp::Delete),
            (0..12i32).prop_map(PoolOp::Flush),
        ]
    }

    proptest! {
        #[test]
        fn prop_every_frame_in_exactly_one_place(
            lru in any::<bool>(),
            ops in proptest::collection::vec(pool_op(), 0..120),
        ) {
            let kind = if lru { ReplacerKind::Lru } else { ReplacerKind::Clock };
            let (pool, _disk) = create_test_pool_with(4, kind);

            for op in ops {
                match op {
                    PoolOp::New => { let _ = pool.new_page(); }
                    PoolOp::Fetch(id) => { let _ = pool.fetch_page(PageId::new(id)); }
                    PoolOp::Unpin(id, dirty) => { pool.unpin_page(PageId::new(id), dirty); }
                    PoolOp::Delete(id) => { pool.delete_page(PageId::new(id)); }
                    PoolOp::Flush(id) => { pool.flush_page(PageId::new(id)).unwrap(); }
                }

                let stats = pool.stats();
                prop_assert_eq!(stats.free_frames + stats.used_frames, 4);
                prop_assert_eq!(stats.evictable_frames + stats.pinned_frames, stats.used_frames);
            }
        }
    }
}
