use crate::storage::error::StorageResult;
use crate::storage::page::{PageHeader, PageId};
use crate::storage::provider::PageProvider;
use log::error;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Shared page image owned by a cache slot.
pub type PageBuffer = Arc<RwLock<Box<[u8]>>>;

pub fn new_page_buffer(page_size: usize) -> PageBuffer {
    Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice()))
}

/// Shared access to a locked page. Dropping the guard releases the page lock.
pub struct PageReadGuard<'a> {
    provider: &'a dyn PageProvider,
    page_id: PageId,
    data: Option<ArcRwLockReadGuard<RawRwLock, Box<[u8]>>>,
}

impl<'a> PageReadGuard<'a> {
    /// Wrap a page the provider has already read-locked.
    pub fn new(provider: &'a dyn PageProvider, page_id: PageId, buffer: &PageBuffer) -> Self {
        Self {
            provider,
            page_id,
            data: Some(buffer.read_arc()),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn header(&self) -> StorageResult<PageHeader> {
        self.provider.get_page_header(self)
    }
}

impl Deref for PageReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().map_or(&[][..], |data| &data[..])
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        self.data.take();
        if let Err(e) = self.provider.read_unlock(self.page_id) {
            error!("Failed to release read lock on page {}: {}", self.page_id, e);
        }
    }
}

/// Exclusive access to a locked page.
///
/// Mutable access marks the page modified; the flag is handed back to the
/// provider when the guard drops so clean pages skip the write-back.
pub struct PageWriteGuard<'a> {
    provider: &'a dyn PageProvider,
    page_id: PageId,
    data: Option<ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>>,
    modified: bool,
}

impl<'a> PageWriteGuard<'a> {
    /// Wrap a page the provider has already write-locked.
    pub fn new(provider: &'a dyn PageProvider, page_id: PageId, buffer: &PageBuffer) -> Self {
        Self {
            provider,
            page_id,
            data: Some(buffer.write_arc()),
            modified: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn header(&self) -> StorageResult<PageHeader> {
        self.provider.get_page_header(self)
    }

    pub fn set_header(&mut self, header: &PageHeader) {
        let provider = self.provider;
        let page_id = self.page_id;
        provider.set_page_header(page_id, &mut self[..], header);
    }
}

impl Deref for PageWriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().map_or(&[][..], |data| &data[..])
    }
}

impl DerefMut for PageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.modified = true;
        match self.data.as_deref_mut() {
            Some(data) => &mut data[..],
            None => &mut [],
        }
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        self.data.take();
        if let Err(e) = self.provider.write_unlock(self.page_id, self.modified) {
            error!("Failed to release write lock on page {}: {}", self.page_id, e);
        }
    }
}
