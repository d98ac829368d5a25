//! Contracts between the page consumers, the page cache and the backing store.

use crate::storage::error::StorageResult;
use crate::storage::page::{PageHeader, PageId, PageReadGuard, PageWriteGuard};

/// Page-level access used by the tree index and the object context.
///
/// Every page access goes through a read or write lock. Guards returned by
/// [`read_lock`](PageProvider::read_lock) and [`write_lock`](PageProvider::write_lock)
/// call the matching unlock when dropped.
pub trait PageProvider: Send + Sync {
    fn page_size(&self) -> usize;

    /// Bytes at the start of each page reserved for the page header.
    fn page_header_size(&self) -> usize;

    fn read_lock(&self, page_id: PageId) -> StorageResult<PageReadGuard<'_>>;

    fn write_lock(&self, page_id: PageId) -> StorageResult<PageWriteGuard<'_>>;

    fn read_unlock(&self, page_id: PageId) -> StorageResult<()>;

    /// Release a write lock. `modified` marks the page dirty.
    fn write_unlock(&self, page_id: PageId, modified: bool) -> StorageResult<()>;

    /// Create a new initialized page and return its number.
    fn allocate(&self) -> StorageResult<PageId>;

    fn flush(&self) -> StorageResult<()>;

    /// Flush and release the backing store. Calling it twice is a no-op.
    fn close(&self) -> StorageResult<()>;

    fn get_page_header(&self, page: &[u8]) -> StorageResult<PageHeader>;

    fn set_page_header(&self, page_id: PageId, page: &mut [u8], header: &PageHeader);

    /// Unique identifier of the underlying storage.
    fn uid(&self) -> String;
}

/// Raw page I/O against a backing store.
pub trait PageStorage: Send {
    fn page_size(&self) -> usize;

    fn page_header_size(&self) -> usize;

    fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> StorageResult<()>;

    fn write_page(&mut self, page_id: PageId, buf: &[u8]) -> StorageResult<()>;

    /// Reserve the next page number.
    fn new_page(&mut self) -> StorageResult<PageId>;

    /// Format an in-memory page image for `page_id`.
    fn initialize(&self, page_id: PageId, buf: &mut [u8]) {
        PageHeader::initialize(page_id, buf);
    }

    fn flush(&mut self) -> StorageResult<()>;

    fn close(&mut self) -> StorageResult<()>;

    fn uid(&self) -> String;

    /// Number of pages in the store, including free ones.
    fn page_count(&self) -> u32;
}
