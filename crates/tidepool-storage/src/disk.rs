//! Disk manager for page-level file I/O.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tidepool_common::page::PageId;
use tidepool_common::{DiskConfig, Result, TidepoolError};
use tracing::{debug, trace};

/// Block-level storage consumed by the buffer pool.
///
/// Implementations serialize all operations against each other. A page id
/// indexes a virtual array of `page_size` blocks that grows lazily as higher
/// ids are written.
pub trait DiskIo: Send + Sync {
    /// Bytes per page.
    fn page_size(&self) -> usize;

    /// Reads exactly one page into `buf`.
    ///
    /// Reading past the current end of storage is not an error: `buf` is
    /// left untouched.
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()>;

    /// Writes exactly one page and makes it durable before returning.
    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()>;

    /// Releases the underlying storage. Callers invoke this once.
    fn shutdown(&self) -> Result<()>;
}

/// Checks a caller buffer and page id against the page size.
pub(crate) fn check_request(page_id: PageId, len: usize, page_size: usize) -> Result<u64> {
    if len != page_size {
        return Err(TidepoolError::PageSizeMismatch {
            expected: page_size,
            actual: len,
        });
    }
    page_id
        .file_offset(page_size)
        .ok_or(TidepoolError::InvalidPageId { page_id: page_id.0 })
}

/// Reads and writes pages of a single database file.
pub struct DiskManager {
    /// Configuration.
    config: DiskConfig,
    /// Open file handle, None after shutdown.
    file: Mutex<Option<FileHandle>>,
}

/// Handle for the open data file.
struct FileHandle {
    /// The file handle.
    file: File,
    /// Current length of the file in bytes.
    len: u64,
}

impl DiskManager {
    /// Opens or creates the database file.
    pub fn new(config: DiskConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config.path)?;
        let len = file.metadata()?.len();

        debug!(path = %config.path.display(), len, "opened database file");

        Ok(Self {
            config,
            file: Mutex::new(Some(FileHandle { file, len })),
        })
    }

    /// Returns the database file path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Returns the number of whole pages currently stored in the file.
    pub fn num_pages(&self) -> Result<u64> {
        let files = self.file.lock();
        let handle = files.as_ref().ok_or(TidepoolError::DiskClosed)?;
        Ok(handle.len / self.config.page_size as u64)
    }

    /// Returns true once `shutdown` has released the file.
    pub fn is_closed(&self) -> bool {
        self.file.lock().is_none()
    }
}

impl DiskIo for DiskManager {
    fn page_size(&self) -> usize {
        self.config.page_size
    }

    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        let offset = check_request(page_id, buf.len(), self.config.page_size)?;

        let mut files = self.file.lock();
        let handle = files.as_mut().ok_or(TidepoolError::DiskClosed)?;

        if offset >= handle.len {
            trace!(page_id = %page_id, offset, len = handle.len, "read past end of file");
            return Ok(());
        }

        handle.file.seek(SeekFrom::Start(offset))?;

        // A trailing partial page reads what exists and leaves the rest as is.
        let mut filled = 0;
        while filled < buf.len() {
            match handle.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        let offset = check_request(page_id, buf.len(), self.config.page_size)?;

        let mut files = self.file.lock();
        let handle = files.as_mut().ok_or(TidepoolError::DiskClosed)?;

        handle.file.seek(SeekFrom::Start(offset))?;
        handle.file.write_all(buf)?;

        if self.config.fsync_enabled {
            handle.file.sync_all()?;
        }

        let end = offset + buf.len() as u64;
        if end > handle.len {
            debug!(page_id = %page_id, old_len = handle.len, new_len = end, "extended database file");
            handle.len = end;
        }

        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        let handle = self.file.lock().take().ok_or(TidepoolError::DiskClosed)?;
        handle.file.sync_all()?;
        debug!(path = %self.config.path.display(), "disk manager shut down");
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        if let Some(handle) = self.file.get_mut().take() {
            let _ = handle.file.sync_all();
        }
    }
}
