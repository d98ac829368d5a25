//! Object context: id allocation, object streams, the free-page list and
//! application-level locks on top of a [`PageProvider`].
//!
//! Page 0 holds the [`ControlInfo`]. Objects are located through a
//! [`PageTree`] mapping ids to the first page of their stream.
//!
//! Lock order is page before root page. Deleting an object frees its
//! continuation pages first and pushes the still-locked first page last.

pub mod control;
pub mod stream;

use crate::access::{IdIndexCodec, PageTree};
use crate::concurrency::{
    IdLockTable, ReadLockGuard, ReadWriteLock, SemaphoreRegistry, WriteLockGuard,
};
use crate::record::{Record, RECORD_HEADER_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageHeader, PageId, PageWriteGuard};
use crate::storage::provider::PageProvider;
use crate::storage::stats::{Statistics, StatisticsCounter};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use stream::{ChainReader, ChainWriter, FIRST_PAGE_SIGNATURE, NEXT_PAGE_SIGNATURE};

pub use control::{ControlInfo, CONTROL_SIGNATURE, FIRST_OBJECT_ID, ROOT_PAGE};

pub const FREE_PAGE_SIGNATURE: u64 = 0x6567_6150_6565_7246;

/// Index value for one object: first stream page and version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub page: PageId,
    pub version: u32,
}

impl IndexEntry {
    pub fn pack(&self) -> u64 {
        self.page.0 as u64 | (self.version as u64) << 32
    }

    /// Zero marks an empty slot.
    pub fn unpack(raw: u64) -> Option<IndexEntry> {
        (raw != 0).then(|| IndexEntry {
            page: PageId(raw as u32),
            version: (raw >> 32) as u32,
        })
    }
}

pub struct ObjectContext {
    provider: Arc<dyn PageProvider>,
    index: PageTree<IdIndexCodec>,
    control: Mutex<ControlInfo>,
    description: Option<String>,
    lock_timeout: Duration,
    id_locks: IdLockTable,
    object_latches: IdLockTable,
    semaphores: SemaphoreRegistry,
    root_lock: Mutex<()>,
    stats: StatisticsCounter,
}

impl ObjectContext {
    /// Format an empty provider: control page, then the index root.
    pub fn create(
        provider: Arc<dyn PageProvider>,
        description: Option<&str>,
        lock_timeout: Duration,
    ) -> StorageResult<Self> {
        let root = provider.allocate()?;
        if root != ROOT_PAGE {
            return Err(StorageError::InvalidArgument(format!(
                "object storage must start empty, first page is {}",
                root
            )));
        }

        let index = PageTree::create(Arc::clone(&provider), IdIndexCodec, lock_timeout)?;
        let control = ControlInfo::new(index.root_page());
        drop(index);
        {
            let header_size = provider.page_header_size();
            let mut page = provider.write_lock(ROOT_PAGE)?;
            control.write(&mut page, header_size)?;
            ControlInfo::write_description(&mut page, header_size, description)?;
        }
        provider.flush()?;
        info!("Created object context {}", provider.uid());

        Self::open(provider, lock_timeout)
    }

    pub fn open(provider: Arc<dyn PageProvider>, lock_timeout: Duration) -> StorageResult<Self> {
        let header_size = provider.page_header_size();
        let (control, description) = {
            let page = provider.read_lock(ROOT_PAGE)?;
            (
                ControlInfo::read(&page, header_size)?,
                ControlInfo::read_description(&page, header_size)?,
            )
        };
        let index = PageTree::open(
            Arc::clone(&provider),
            IdIndexCodec,
            control.index_page,
            lock_timeout,
        )?;
        debug!(
            "Opened object context {} with {} objects, next id {}",
            provider.uid(),
            index.len(),
            control.next_id
        );

        Ok(Self {
            provider,
            index,
            control: Mutex::new(control),
            description,
            lock_timeout,
            id_locks: IdLockTable::new("id"),
            object_latches: IdLockTable::new("object"),
            semaphores: SemaphoreRegistry::new(),
            root_lock: Mutex::new(()),
            stats: StatisticsCounter::new(),
        })
    }

    pub fn provider(&self) -> &dyn PageProvider {
        &*self.provider
    }

    pub fn index(&self) -> &PageTree<IdIndexCodec> {
        &self.index
    }

    pub fn uid(&self) -> String {
        self.provider.uid()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn control(&self) -> ControlInfo {
        self.control.lock().clone()
    }

    pub fn object_count(&self) -> u64 {
        self.index.len()
    }

    /// All stored ids in ascending order.
    pub fn ids(&self) -> StorageResult<Vec<i64>> {
        Ok(self.index.entries()?.into_iter().map(|(id, _)| id).collect())
    }

    pub fn statistics(&self) -> Statistics {
        self.stats.snapshot()
    }

    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    /// Store a new object and assign its id.
    pub fn add(&self, record: &mut Record) -> StorageResult<i64> {
        let id = self.next_id()?;
        let _latch = self.object_latches.write(id, self.lock_timeout)?;

        let (page, pages) = self.write_object(None, id, record)?;
        self.index.insert(id, IndexEntry { page, version: 1 }.pack())?;
        record.id = Some(id);

        self.record_operation(0, pages);
        debug!("Added object {} at page {} ({} pages)", id, page, pages);
        Ok(id)
    }

    pub fn get(&self, id: i64) -> StorageResult<Option<Record>> {
        let _latch = self.object_latches.read(id, self.lock_timeout)?;
        let Some(entry) = self.seek(id)? else {
            return Ok(None);
        };

        let (record, pages) = self.read_object(entry.page, id)?;
        self.record_operation(pages, 0);
        Ok(Some(record))
    }

    /// Replace a stored object. Returns the new version, or `None` if the id
    /// is unknown.
    pub fn update(&self, record: &Record) -> StorageResult<Option<u32>> {
        let id = record
            .id
            .ok_or_else(|| StorageError::InvalidArgument("record has no id".to_string()))?;
        let _latch = self.object_latches.write(id, self.lock_timeout)?;
        let Some(entry) = self.seek(id)? else {
            return Ok(None);
        };

        let (page, pages) = self.write_object(Some(entry.page), id, record)?;
        let version = entry.version.wrapping_add(1);
        self.index.insert(id, IndexEntry { page, version }.pack())?;

        self.record_operation(0, pages);
        debug!("Updated object {} to version {}", id, version);
        Ok(Some(version))
    }

    pub fn delete(&self, id: i64) -> StorageResult<bool> {
        let _latch = self.object_latches.write(id, self.lock_timeout)?;
        let Some(entry) = self.seek(id)? else {
            return Ok(false);
        };

        self.index.remove(&id)?;
        let pages = self.free_chain(entry.page)?;

        self.record_operation(0, pages);
        debug!("Deleted object {} ({} pages freed)", id, pages);
        Ok(true)
    }

    pub fn get_version(&self, id: i64) -> StorageResult<Option<u32>> {
        Ok(self.seek(id)?.map(|entry| entry.version))
    }

    /// The root object has no id and lives outside the index.
    pub fn get_root(&self) -> StorageResult<Option<Record>> {
        let _guard = self.root_lock.lock();
        let Some(page) = self.control.lock().root_object else {
            return Ok(None);
        };

        let (mut record, pages) = self.read_object(page, 0)?;
        record.id = None;
        self.record_operation(pages, 0);
        Ok(Some(record))
    }

    pub fn update_root(&self, record: &Record) -> StorageResult<()> {
        let _guard = self.root_lock.lock();
        let current = self.control.lock().root_object;

        let (page, pages) = self.write_object(current, 0, record)?;
        if current != Some(page) {
            let mut root = self.provider.write_lock(ROOT_PAGE)?;
            let mut control = self.control.lock();
            control.root_object = Some(page);
            control.write(&mut root, self.provider.page_header_size())?;
        }

        self.record_operation(0, pages);
        Ok(())
    }

    /// Take a page off the free list, or grow the store. Both happen under
    /// the root page write lock.
    pub fn allocate_page(&self) -> StorageResult<PageId> {
        let mut root = self.provider.write_lock(ROOT_PAGE)?;
        let free_page = self.control.lock().free_page;
        let Some(page_id) = free_page else {
            let page_id = self.provider.allocate()?;
            drop(root);
            return Ok(page_id);
        };

        let header = {
            let page = self.provider.read_lock(page_id)?;
            page.header()?
        };
        if header.data[0] != FREE_PAGE_SIGNATURE {
            return Err(StorageError::InvalidSignature {
                what: "free page",
                expected: FREE_PAGE_SIGNATURE,
                found: header.data[0],
            });
        }

        let mut control = self.control.lock();
        control.free_page = header.prev_page;
        control.write(&mut root, self.provider.page_header_size())?;
        debug!("Reused free page {}", page_id);
        Ok(page_id)
    }

    /// Push a page onto the free list, returning its previous header.
    ///
    /// With `keep_locked` the page stays write-locked in the returned guard;
    /// drop it before the next call that touches the root page.
    pub fn free_page(
        &self,
        page_id: PageId,
        keep_locked: bool,
    ) -> StorageResult<(PageHeader, Option<PageWriteGuard<'_>>)> {
        if page_id == ROOT_PAGE {
            return Err(StorageError::InvalidArgument(
                "the root page cannot be freed".to_string(),
            ));
        }

        let mut page = self.provider.write_lock(page_id)?;
        let prior = {
            let mut root = self.provider.write_lock(ROOT_PAGE)?;
            self.push_free(&mut root, &mut page)?
        };
        Ok((prior, keep_locked.then_some(page)))
    }

    /// Pages on the free list, most recently freed first.
    pub fn free_pages(&self) -> StorageResult<Vec<PageId>> {
        let _root = self.provider.read_lock(ROOT_PAGE)?;
        let mut pages = Vec::new();
        let mut next = self.control.lock().free_page;
        while let Some(page_id) = next {
            let header = {
                let page = self.provider.read_lock(page_id)?;
                page.header()?
            };
            if header.data[0] != FREE_PAGE_SIGNATURE {
                return Err(StorageError::Corruption(format!(
                    "page {} on the free list is not free",
                    page_id
                )));
            }
            pages.push(page_id);
            next = header.prev_page;
        }
        Ok(pages)
    }

    pub fn read_lock(&self, id: i64, timeout: Duration) -> StorageResult<()> {
        self.id_locks.read_lock(id, timeout)
    }

    pub fn read_unlock(&self, id: i64) -> StorageResult<()> {
        self.id_locks.read_unlock(id)
    }

    pub fn write_lock(&self, id: i64, timeout: Duration) -> StorageResult<()> {
        self.id_locks.write_lock(id, timeout)
    }

    pub fn write_unlock(&self, id: i64, downgrade: bool) -> StorageResult<()> {
        self.id_locks.write_unlock(id, downgrade)
    }

    /// Shared id lock released when the guard drops.
    pub fn lock_id_read(&self, id: i64, timeout: Duration) -> StorageResult<ReadLockGuard<'_>> {
        self.id_locks.read(id, timeout)
    }

    pub fn lock_id_write(&self, id: i64, timeout: Duration) -> StorageResult<WriteLockGuard<'_>> {
        self.id_locks.write(id, timeout)
    }

    /// Bucketed application locks. Ids sharing a bucket share a lock.
    pub fn id_locks(&self) -> &IdLockTable {
        &self.id_locks
    }

    /// Named lock, created on first use. Names are case-insensitive.
    pub fn semaphore(&self, name: &str) -> Arc<ReadWriteLock> {
        self.semaphores.get(name)
    }

    pub fn semaphore_read_lock(&self, name: &str, timeout: Duration) -> StorageResult<()> {
        self.semaphores.get(name).read_lock(timeout)
    }

    pub fn semaphore_read_unlock(&self, name: &str) -> StorageResult<()> {
        self.semaphores.get(name).read_unlock()
    }

    pub fn semaphore_write_lock(&self, name: &str, timeout: Duration) -> StorageResult<()> {
        self.semaphores.get(name).write_lock(timeout)
    }

    pub fn semaphore_write_unlock(&self, name: &str, downgrade: bool) -> StorageResult<()> {
        self.semaphores.get(name).write_unlock(downgrade)
    }

    /// Verify the index and return its black height.
    pub fn check(&self) -> StorageResult<u32> {
        self.index.check()
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.provider.flush()
    }

    pub fn close(&self) -> StorageResult<()> {
        self.provider.close()
    }

    pub(crate) fn free_chain_page(&self, page_id: PageId, signature: u64) -> StorageResult<PageHeader> {
        let page = self.provider.write_lock(page_id)?;
        let header = page.header()?;
        if header.data[0] != signature {
            return Err(StorageError::InvalidSignature {
                what: "object stream page",
                expected: signature,
                found: header.data[0],
            });
        }
        self.free_locked_page(page)
    }

    fn free_locked_page(&self, mut page: PageWriteGuard<'_>) -> StorageResult<PageHeader> {
        if page.page_id() == ROOT_PAGE {
            return Err(StorageError::InvalidArgument(
                "the root page cannot be freed".to_string(),
            ));
        }
        let mut root = self.provider.write_lock(ROOT_PAGE)?;
        self.push_free(&mut root, &mut page)
    }

    fn push_free(
        &self,
        root: &mut PageWriteGuard<'_>,
        page: &mut PageWriteGuard<'_>,
    ) -> StorageResult<PageHeader> {
        let prior = page.header()?;
        if prior.data[0] == FREE_PAGE_SIGNATURE {
            return Err(StorageError::Corruption(format!(
                "page {} is already free",
                page.page_id()
            )));
        }

        let mut control = self.control.lock();
        page.set_header(&PageHeader {
            prev_page: control.free_page,
            next_page: None,
            data: [FREE_PAGE_SIGNATURE, 0, 0, 0],
        });
        control.free_page = Some(page.page_id());
        control.write(root, self.provider.page_header_size())?;
        Ok(prior)
    }

    fn next_id(&self) -> StorageResult<i64> {
        let mut root = self.provider.write_lock(ROOT_PAGE)?;
        let mut control = self.control.lock();
        let id = control.next_id;
        control.next_id += 1;
        control.write(&mut root, self.provider.page_header_size())?;
        Ok(id)
    }

    fn seek(&self, id: i64) -> StorageResult<Option<IndexEntry>> {
        Ok(self.index.get(&id)?.and_then(IndexEntry::unpack))
    }

    fn write_object(
        &self,
        existing: Option<PageId>,
        id: i64,
        record: &Record,
    ) -> StorageResult<(PageId, u64)> {
        let bytes = record.encode(id)?;
        let mut writer = ChainWriter::new(self, existing);
        writer.write(&bytes)?;
        writer.finish()
    }

    fn read_object(&self, page: PageId, id: i64) -> StorageResult<(Record, u64)> {
        let mut reader = ChainReader::new(&*self.provider, page);
        let mut header = [0u8; RECORD_HEADER_SIZE];
        reader.read_exact(&mut header)?;

        let (stored_id, len) = Record::decode_header(&header)?;
        if stored_id != id {
            return Err(StorageError::Corruption(format!(
                "page {} holds object {}, expected {}",
                page, stored_id, id
            )));
        }
        let body = reader.read_vec(len)?;
        let record = Record::decode_body(id, &body)?;
        Ok((record, reader.pages_read()))
    }

    fn free_chain(&self, start: PageId) -> StorageResult<u64> {
        let first = self.provider.write_lock(start)?;
        let header = first.header()?;
        if header.data[0] != FIRST_PAGE_SIGNATURE {
            return Err(StorageError::InvalidSignature {
                what: "object stream page",
                expected: FIRST_PAGE_SIGNATURE,
                found: header.data[0],
            });
        }

        let mut freed = 1;
        let mut next = header.next_page;
        while let Some(page_id) = next {
            next = self.free_chain_page(page_id, NEXT_PAGE_SIGNATURE)?.next_page;
            freed += 1;
        }
        self.free_locked_page(first)?;
        Ok(freed)
    }

    fn record_operation(&self, pages_read: u64, pages_written: u64) {
        self.stats
            .record_operation(pages_read, pages_written, self.provider.page_size() as u64);
    }
}
