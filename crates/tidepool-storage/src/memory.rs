//! In-memory page store.
//!
//! Used by tests and benchmarks that want the disk contract without touching
//! the filesystem. Supports failure injection for the write path.

use crate::disk::{check_request, DiskIo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tidepool_common::page::PageId;
use tidepool_common::{Result, TidepoolError};

/// In-memory implementation of [`DiskIo`].
pub struct MemoryDisk {
    page_size: usize,
    pages: Mutex<Option<HashMap<PageId, Box<[u8]>>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryDisk {
    /// Creates an empty store.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: Mutex::new(Some(HashMap::new())),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Number of `read_page` calls that reached storage.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of successful `write_page` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Makes subsequent writes fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Makes subsequent reads fail with an I/O error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Returns a copy of the stored bytes for a page, if it was ever written.
    pub fn stored_page(&self, page_id: PageId) -> Option<Vec<u8>> {
        self.pages
            .lock()
            .as_ref()
            .and_then(|pages| pages.get(&page_id).map(|data| data.to_vec()))
    }

    /// Number of distinct pages written.
    pub fn page_count(&self) -> usize {
        self.pages.lock().as_ref().map_or(0, |pages| pages.len())
    }
}

impl DiskIo for MemoryDisk {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        check_request(page_id, buf.len(), self.page_size)?;
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(IoError::new(ErrorKind::Other, "injected read failure").into());
        }

        let pages = self.pages.lock();
        let pages = pages.as_ref().ok_or(TidepoolError::DiskClosed)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        if let Some(data) = pages.get(&page_id) {
            buf.copy_from_slice(data);
        }
        Ok(())
    }

    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        check_request(page_id, buf.len(), self.page_size)?;
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(IoError::new(ErrorKind::Other, "injected write failure").into());
        }

        let mut pages = self.pages.lock();
        let pages = pages.as_mut().ok_or(TidepoolError::DiskClosed)?;
        pages.insert(page_id, buf.to_vec().into_boxed_slice());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.pages
            .lock()
            .take()
            .map(|_| ())
            .ok_or(TidepoolError::DiskClosed)
    }
}
