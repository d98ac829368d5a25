pub mod replacer;

use crate::concurrency::backoff::ProgressiveWait;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::guard::new_page_buffer;
use crate::storage::page::{PageBuffer, PageHeader, PageId, PageReadGuard, PageWriteGuard};
use crate::storage::provider::{PageProvider, PageStorage};
use crate::storage::stats::{Statistics, StatisticsCounter};
use log::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex};
use replacer::{Replacer, Residency, SlotId};
use std::time::Duration;

pub const MIN_CACHE_SLOTS: usize = 0x80;
pub const MAX_CACHE_SLOTS: usize = 0x20_0000;

/// Page cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache size in bytes; divided by the page size and clamped to the slot limits.
    pub cache_size: usize,
    /// How long a lock or slot request may wait. Zero waits forever.
    pub lock_timeout: Duration,
    /// Write a page back as soon as its last lock is released.
    pub write_through: bool,
    /// Flush the backing store after every page write-back.
    pub flush_writes: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            cache_size: 8 * 1024 * 1024, // 8MB
            lock_timeout: Duration::from_secs(30),
            write_through: false,
            flush_writes: false,
        }
    }
}

impl CacheConfig {
    pub fn slot_count(&self, page_size: usize) -> usize {
        (self.cache_size / page_size.max(1)).clamp(MIN_CACHE_SLOTS, MAX_CACHE_SLOTS)
    }
}

/// Lock state of a cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Free,
    ReadLocked(u32),
    /// A writer is waiting; no new readers are admitted. Holds the remaining reader count.
    WriteLockRequested(u32),
    WriteLocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Read,
    Write,
}

struct Slot {
    page_id: Option<PageId>,
    lock: LockState,
    dirty: bool,
    buffer: PageBuffer,
}

impl Slot {
    fn new(page_size: usize) -> Self {
        Self {
            page_id: None,
            lock: LockState::Free,
            dirty: false,
            buffer: new_page_buffer(page_size),
        }
    }

    fn try_lock(&mut self, mode: LockMode) -> bool {
        match (mode, self.lock) {
            (LockMode::Read, LockState::Free) => {
                self.lock = LockState::ReadLocked(1);
                true
            }
            (LockMode::Read, LockState::ReadLocked(n)) => {
                self.lock = LockState::ReadLocked(n + 1);
                true
            }
            (LockMode::Write, LockState::Free) | (LockMode::Write, LockState::WriteLockRequested(0)) => {
                self.lock = LockState::WriteLocked;
                true
            }
            (LockMode::Write, LockState::ReadLocked(n)) => {
                self.lock = LockState::WriteLockRequested(n);
                false
            }
            _ => false,
        }
    }

    fn cancel_write_request(&mut self) {
        if let LockState::WriteLockRequested(n) = self.lock {
            self.lock = if n == 0 {
                LockState::Free
            } else {
                LockState::ReadLocked(n)
            };
        }
    }

    /// Returns true once the slot has no holders and no pending writer.
    fn read_unlock(&mut self, page_id: PageId) -> StorageResult<bool> {
        match self.lock {
            LockState::ReadLocked(1) => {
                self.lock = LockState::Free;
                Ok(true)
            }
            LockState::ReadLocked(n) if n > 1 => {
                self.lock = LockState::ReadLocked(n - 1);
                Ok(false)
            }
            LockState::WriteLockRequested(n) if n > 0 => {
                self.lock = LockState::WriteLockRequested(n - 1);
                Ok(false)
            }
            state => Err(StorageError::LockState(format!(
                "read unlock of page {} in state {:?}",
                page_id, state
            ))),
        }
    }

    fn write_unlock(&mut self, page_id: PageId) -> StorageResult<()> {
        match self.lock {
            LockState::WriteLocked => {
                self.lock = LockState::Free;
                Ok(())
            }
            state => Err(StorageError::LockState(format!(
                "write unlock of page {} in state {:?}",
                page_id, state
            ))),
        }
    }

    fn residency(&self) -> Residency {
        if self.dirty {
            Residency::Dirty
        } else {
            Residency::Clean
        }
    }
}

struct CacheState {
    storage: Option<Box<dyn PageStorage>>,
    slots: Vec<Slot>,
    spare: Vec<SlotId>,
    replacer: Replacer,
}

/// Fixed-capacity page cache with per-page reader/writer locks.
///
/// All slot bookkeeping happens under one mutex; page contents are accessed
/// through the guards outside of it. Waiters block on a condition variable
/// that is signalled on every unlock.
pub struct PageCache {
    state: Mutex<CacheState>,
    released: Condvar,
    config: CacheConfig,
    capacity: usize,
    page_size: usize,
    header_size: usize,
    uid: String,
    stats: StatisticsCounter,
}

impl PageCache {
    pub fn new(storage: Box<dyn PageStorage>, config: CacheConfig) -> Self {
        let page_size = storage.page_size();
        let header_size = storage.page_header_size();
        let uid = storage.uid();
        let capacity = config.slot_count(page_size);
        debug!(
            "Page cache for {} with {} slots of {} bytes",
            uid, capacity, page_size
        );

        Self {
            state: Mutex::new(CacheState {
                storage: Some(storage),
                slots: Vec::new(),
                spare: Vec::new(),
                replacer: Replacer::new(),
            }),
            released: Condvar::new(),
            config,
            capacity,
            page_size,
            header_size,
            uid,
            stats: StatisticsCounter::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Maximum number of resident pages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn resident_pages(&self) -> usize {
        self.state.lock().replacer.len()
    }

    pub fn dirty_pages(&self) -> usize {
        self.state.lock().replacer.dirty_len()
    }

    pub fn is_resident(&self, page_id: PageId) -> bool {
        self.state.lock().replacer.find(page_id).is_some()
    }

    pub fn lock_state(&self, page_id: PageId) -> Option<LockState> {
        let state = self.state.lock();
        state
            .replacer
            .find(page_id)
            .map(|(slot_id, _)| state.slots[slot_id].lock)
    }

    /// Pages in the backing store, or zero once closed.
    pub fn page_count(&self) -> u32 {
        self.state
            .lock()
            .storage
            .as_ref()
            .map_or(0, |storage| storage.page_count())
    }

    pub fn statistics(&self) -> Statistics {
        self.stats.snapshot()
    }

    fn acquire(&self, page_id: PageId, mode: LockMode) -> StorageResult<PageBuffer> {
        let mut state = self.state.lock();
        let mut wait = ProgressiveWait::new(self.config.lock_timeout);
        let mut missed = false;

        loop {
            if let Some(buffer) = self.try_acquire(&mut state, page_id, mode, &mut missed)? {
                if missed {
                    self.stats.record_miss();
                } else {
                    self.stats.record_hit();
                }
                return Ok(buffer);
            }

            let waited = wait.wait(&self.released, &mut state, || {
                format!("{:?} lock on page {}", mode, page_id)
            });
            if let Err(e) = waited {
                if mode == LockMode::Write {
                    self.cancel_write_request(&mut state, page_id);
                }
                warn!("{}", e);
                return Err(e);
            }
        }
    }

    fn try_acquire(
        &self,
        state: &mut CacheState,
        page_id: PageId,
        mode: LockMode,
        missed: &mut bool,
    ) -> StorageResult<Option<PageBuffer>> {
        if state.storage.is_none() {
            return Err(StorageError::Closed);
        }

        let slot_id = match state.replacer.find(page_id) {
            Some((slot_id, Residency::Locked)) => slot_id,
            Some((slot_id, _)) => {
                state.replacer.move_to(page_id, Residency::Locked);
                slot_id
            }
            None => match self.load(state, page_id)? {
                Some(slot_id) => {
                    *missed = true;
                    slot_id
                }
                None => return Ok(None),
            },
        };

        let slot = &mut state.slots[slot_id];
        if slot.try_lock(mode) {
            Ok(Some(slot.buffer.clone()))
        } else {
            Ok(None)
        }
    }

    /// Bring `page_id` into a slot, registered as locked. `None` when every slot is locked.
    fn load(&self, state: &mut CacheState, page_id: PageId) -> StorageResult<Option<SlotId>> {
        let Some(slot_id) = self.claim_slot(state)? else {
            return Ok(None);
        };

        let CacheState {
            storage,
            slots,
            spare,
            replacer,
        } = state;
        let slot = &mut slots[slot_id];
        let result = match storage.as_mut() {
            Some(storage) => storage.read_page(page_id, &mut slot.buffer.write()[..]),
            None => Err(StorageError::Closed),
        };
        if let Err(e) = result {
            slot.page_id = None;
            spare.push(slot_id);
            return Err(e);
        }

        slot.page_id = Some(page_id);
        slot.dirty = false;
        slot.lock = LockState::Free;
        replacer.insert(page_id, slot_id, Residency::Locked);
        self.stats.record_read(1, self.page_size as u64);
        trace!("Loaded page {} into slot {}", page_id, slot_id);

        Ok(Some(slot_id))
    }

    /// Find an unbound slot: a spare one, a new one below capacity, or an evicted one.
    fn claim_slot(&self, state: &mut CacheState) -> StorageResult<Option<SlotId>> {
        if state.storage.is_none() {
            return Err(StorageError::Closed);
        }
        if let Some(slot_id) = state.spare.pop() {
            return Ok(Some(slot_id));
        }
        if state.slots.len() < self.capacity {
            state.slots.push(Slot::new(self.page_size));
            return Ok(Some(state.slots.len() - 1));
        }

        let Some((victim, slot_id, residency)) = state.replacer.evict() else {
            return Ok(None);
        };
        if residency == Residency::Dirty {
            if let Err(e) = self.write_back(state, victim, slot_id) {
                state.replacer.insert(victim, slot_id, Residency::Dirty);
                return Err(e);
            }
        }
        trace!("Evicted page {} from slot {}", victim, slot_id);
        state.slots[slot_id].page_id = None;

        Ok(Some(slot_id))
    }

    fn write_back(&self, state: &mut CacheState, page_id: PageId, slot_id: SlotId) -> StorageResult<()> {
        let CacheState { storage, slots, .. } = state;
        let storage = storage.as_mut().ok_or(StorageError::Closed)?;
        let slot = &mut slots[slot_id];
        debug_assert_eq!(slot.page_id, Some(page_id));

        storage.write_page(page_id, &slot.buffer.read())?;
        if self.config.flush_writes {
            storage.flush()?;
        }
        slot.dirty = false;
        self.stats.record_write(1, self.page_size as u64);

        Ok(())
    }

    fn cancel_write_request(&self, state: &mut CacheState, page_id: PageId) {
        if let Some((slot_id, Residency::Locked)) = state.replacer.find(page_id) {
            let slot = &mut state.slots[slot_id];
            slot.cancel_write_request();
            if slot.lock == LockState::Free {
                let residency = slot.residency();
                state.replacer.move_to(page_id, residency);
            }
            self.released.notify_all();
        }
    }

    fn release(&self, page_id: PageId, mode: LockMode, modified: bool) -> StorageResult<()> {
        let mut state = self.state.lock();
        let Some((slot_id, Residency::Locked)) = state.replacer.find(page_id) else {
            return Err(StorageError::PageNotLocked(page_id));
        };

        let slot = &mut state.slots[slot_id];
        let drained = match mode {
            LockMode::Read => slot.read_unlock(page_id)?,
            LockMode::Write => {
                slot.write_unlock(page_id)?;
                slot.dirty |= modified;
                true
            }
        };

        let mut result = Ok(());
        if drained {
            if state.slots[slot_id].dirty && self.config.write_through {
                result = self.write_back(&mut state, page_id, slot_id);
            }
            let residency = state.slots[slot_id].residency();
            state.replacer.move_to(page_id, residency);
        }
        drop(state);

        self.released.notify_all();
        result
    }

    fn flush_locked(&self, state: &mut CacheState) -> StorageResult<()> {
        if state.storage.is_none() {
            return Err(StorageError::Closed);
        }

        let dirty = state.replacer.drain_dirty();
        let count = dirty.len();
        let mut pending = dirty.into_iter();
        while let Some((page_id, slot_id)) = pending.next() {
            if let Err(e) = self.write_back(state, page_id, slot_id) {
                state.replacer.move_to(page_id, Residency::Dirty);
                for (page_id, _) in pending.by_ref() {
                    state.replacer.move_to(page_id, Residency::Dirty);
                }
                return Err(e);
            }
        }

        if let Some(storage) = state.storage.as_mut() {
            storage.flush()?;
        }
        debug!("Flushed {} dirty pages", count);

        Ok(())
    }
}

impl PageProvider for PageCache {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_header_size(&self) -> usize {
        self.header_size
    }

    fn read_lock(&self, page_id: PageId) -> StorageResult<PageReadGuard<'_>> {
        let buffer = self.acquire(page_id, LockMode::Read)?;
        Ok(PageReadGuard::new(self, page_id, &buffer))
    }

    fn write_lock(&self, page_id: PageId) -> StorageResult<PageWriteGuard<'_>> {
        let buffer = self.acquire(page_id, LockMode::Write)?;
        Ok(PageWriteGuard::new(self, page_id, &buffer))
    }

    fn read_unlock(&self, page_id: PageId) -> StorageResult<()> {
        self.release(page_id, LockMode::Read, false)
    }

    fn write_unlock(&self, page_id: PageId, modified: bool) -> StorageResult<()> {
        self.release(page_id, LockMode::Write, modified)
    }

    fn allocate(&self) -> StorageResult<PageId> {
        let mut state = self.state.lock();
        let page_id = state
            .storage
            .as_mut()
            .ok_or(StorageError::Closed)?
            .new_page()?;
        let mut wait = ProgressiveWait::new(self.config.lock_timeout);

        loop {
            if let Some(slot_id) = self.claim_slot(&mut state)? {
                let CacheState {
                    storage,
                    slots,
                    replacer,
                    ..
                } = &mut *state;
                let storage = storage.as_ref().ok_or(StorageError::Closed)?;
                let slot = &mut slots[slot_id];

                storage.initialize(page_id, &mut slot.buffer.write()[..]);
                slot.page_id = Some(page_id);
                slot.dirty = true;
                slot.lock = LockState::Free;
                replacer.insert(page_id, slot_id, Residency::Dirty);
                trace!("Allocated page {} in slot {}", page_id, slot_id);

                return Ok(page_id);
            }

            wait.wait(&self.released, &mut state, || {
                format!("cache slot for new page {}", page_id)
            })?;
        }
    }

    fn flush(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    fn close(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.storage.is_none() {
            return Ok(());
        }
        if state.replacer.locked_len() > 0 {
            warn!(
                "Closing page cache with {} locked pages",
                state.replacer.locked_len()
            );
        }

        self.flush_locked(&mut state)?;
        if let Some(mut storage) = state.storage.take() {
            storage.close()?;
        }
        debug!("Closed page cache for {}", self.uid);

        Ok(())
    }

    fn get_page_header(&self, page: &[u8]) -> StorageResult<PageHeader> {
        PageHeader::read(page)
    }

    fn set_page_header(&self, page_id: PageId, page: &mut [u8], header: &PageHeader) {
        header.write(page_id, page);
    }

    fn uid(&self) -> String {
        self.uid.clone()
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close page cache: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::PageManager;
    use crate::storage::page::PAGE_HEADER_SIZE;
    use anyhow::Result;
    use std::path::Path;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 256;

    fn create_test_cache(path: &Path, config: CacheConfig) -> Result<PageCache> {
        let page_manager = PageManager::create(path, PAGE_SIZE)?;
        Ok(PageCache::new(Box::new(page_manager), config))
    }

    fn small_config() -> CacheConfig {
        CacheConfig {
            cache_size: 0,
            lock_timeout: Duration::from_secs(5),
            ..CacheConfig::default()
        }
    }

    #[test]
    fn test_slot_count_clamped() {
        let config = CacheConfig::default();
        assert_eq!(config.slot_count(4096), 2048);
        assert_eq!(small_config().slot_count(4096), MIN_CACHE_SLOTS);

        let huge = CacheConfig {
            cache_size: usize::MAX,
            ..CacheConfig::default()
        };
        assert_eq!(huge.slot_count(256), MAX_CACHE_SLOTS);
    }

    #[test]
    fn test_allocate_and_read() -> Result<()> {
        let dir = tempdir()?;
        let cache = create_test_cache(&dir.path().join("test.db"), small_config())?;

        let page_id = cache.allocate()?;
        assert_eq!(page_id, PageId(0));
        assert_eq!(cache.dirty_pages(), 1);
        assert_eq!(cache.page_count(), 1);

        {
            let mut guard = cache.write_lock(page_id)?;
            guard[PAGE_HEADER_SIZE] = 42;
            guard[PAGE_HEADER_SIZE + 1] = 43;
        }

        let guard = cache.read_lock(page_id)?;
        assert_eq!(guard[PAGE_HEADER_SIZE], 42);
        assert_eq!(guard[PAGE_HEADER_SIZE + 1], 43);
        assert_eq!(guard.header()?, PageHeader::default());

        Ok(())
    }

    #[test]
    fn test_page_header_through_guard() -> Result<()> {
        let dir = tempdir()?;
        let cache = create_test_cache(&dir.path().join("test.db"), small_config())?;
        let page_id = cache.allocate()?;

        let header = PageHeader {
            prev_page: None,
            next_page: Some(PageId(7)),
            data: [9, 8, 7, 6],
        };
        {
            let mut guard = cache.write_lock(page_id)?;
            guard.set_header(&header);
            assert!(guard.is_modified());
        }

        assert_eq!(cache.read_lock(page_id)?.header()?, header);

        Ok(())
    }

    #[test]
    fn test_eviction_persists_pages() -> Result<()> {
        let dir = tempdir()?;
        let cache = create_test_cache(&dir.path().join("test.db"), small_config())?;
        let total = cache.capacity() as u32 + 72;

        for i in 0..total {
            let page_id = cache.allocate()?;
            let mut guard = cache.write_lock(page_id)?;
            guard[PAGE_HEADER_SIZE] = (i % 251) as u8;
        }

        assert_eq!(cache.resident_pages(), cache.capacity());
        assert!(!cache.is_resident(PageId(0)));
        assert!(cache.is_resident(PageId(total - 1)));

        for i in 0..total {
            let guard = cache.read_lock(PageId(i))?;
            assert_eq!(guard[PAGE_HEADER_SIZE], (i % 251) as u8);
        }

        let stats = cache.statistics();
        assert!(stats.pages_written >= 72);
        assert!(stats.miss_count >= 72);

        Ok(())
    }

    #[test]
    fn test_eviction_prefers_clean_pages() -> Result<()> {
        let dir = tempdir()?;
        let cache = create_test_cache(&dir.path().join("test.db"), small_config())?;

        for _ in 0..cache.capacity() {
            cache.allocate()?;
        }
        cache.flush()?;
        assert_eq!(cache.dirty_pages(), 0);

        {
            let mut guard = cache.write_lock(PageId(0))?;
            guard[PAGE_HEADER_SIZE] = 1;
        }
        assert_eq!(cache.dirty_pages(), 1);

        cache.allocate()?;
        assert!(cache.is_resident(PageId(0)));
        assert!(!cache.is_resident(PageId(1)));

        Ok(())
    }

    #[test]
    fn test_unmodified_write_lock_stays_clean() -> Result<()> {
        let dir = tempdir()?;
        let cache = create_test_cache(&dir.path().join("test.db"), small_config())?;
        let page_id = cache.allocate()?;
        cache.flush()?;

        {
            let guard = cache.write_lock(page_id)?;
            assert_eq!(guard.page_id(), page_id);
        }
        assert_eq!(cache.dirty_pages(), 0);

        Ok(())
    }

    #[test]
    fn test_shared_readers() -> Result<()> {
        let dir = tempdir()?;
        let cache = create_test_cache(&dir.path().join("test.db"), small_config())?;
        let page_id = cache.allocate()?;

        let first = cache.read_lock(page_id)?;
        let second = cache.read_lock(page_id)?;
        assert_eq!(cache.lock_state(page_id), Some(LockState::ReadLocked(2)));

        drop(first);
        drop(second);
        assert_eq!(cache.lock_state(page_id), Some(LockState::Free));

        Ok(())
    }

    #[test]
    fn test_write_lock_timeout() -> Result<()> {
        let dir = tempdir()?;
        let config = CacheConfig {
            lock_timeout: Duration::from_millis(50),
            ..small_config()
        };
        let cache = Arc::new(create_test_cache(&dir.path().join("test.db"), config)?);
        let page_id = cache.allocate()?;

        let guard = cache.write_lock(page_id)?;

        let cache_clone = Arc::clone(&cache);
        let handle = thread::spawn(move || cache_clone.read_lock(page_id).map(|_| ()));
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(ref e) if e.is_timeout()));

        drop(guard);
        assert!(cache.read_lock(page_id).is_ok());

        Ok(())
    }

    #[test]
    fn test_writer_waits_for_readers() -> Result<()> {
        let dir = tempdir()?;
        let cache = Arc::new(create_test_cache(&dir.path().join("test.db"), small_config())?);
        let page_id = cache.allocate()?;

        let reader = cache.read_lock(page_id)?;

        let cache_clone = Arc::clone(&cache);
        let handle = thread::spawn(move || -> StorageResult<()> {
            let mut guard = cache_clone.write_lock(page_id)?;
            guard[PAGE_HEADER_SIZE] = 7;
            Ok(())
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(
            cache.lock_state(page_id),
            Some(LockState::WriteLockRequested(1))
        );
        drop(reader);

        handle.join().unwrap()?;
        assert_eq!(cache.read_lock(page_id)?[PAGE_HEADER_SIZE], 7);

        Ok(())
    }

    #[test]
    fn test_cancelled_write_request_readmits_readers() -> Result<()> {
        let dir = tempdir()?;
        let config = CacheConfig {
            lock_timeout: Duration::from_millis(50),
            ..small_config()
        };
        let cache = Arc::new(create_test_cache(&dir.path().join("test.db"), config)?);
        let page_id = cache.allocate()?;

        let reader = cache.read_lock(page_id)?;
        let cache_clone = Arc::clone(&cache);
        let handle = thread::spawn(move || cache_clone.write_lock(page_id).map(|_| ()));
        assert!(handle.join().unwrap().is_err());

        assert_eq!(cache.lock_state(page_id), Some(LockState::ReadLocked(1)));
        let second = cache.read_lock(page_id)?;
        drop(second);
        drop(reader);

        Ok(())
    }

    #[test]
    fn test_unlock_without_lock() -> Result<()> {
        let dir = tempdir()?;
        let cache = create_test_cache(&dir.path().join("test.db"), small_config())?;
        let page_id = cache.allocate()?;

        assert!(matches!(
            cache.read_unlock(page_id),
            Err(StorageError::PageNotLocked(_))
        ));
        assert!(matches!(
            cache.write_unlock(PageId(99), true),
            Err(StorageError::PageNotLocked(_))
        ));

        let guard = cache.read_lock(page_id)?;
        assert!(matches!(
            cache.write_unlock(page_id, false),
            Err(StorageError::LockState(_))
        ));
        drop(guard);

        Ok(())
    }

    #[test]
    fn test_write_through() -> Result<()> {
        let dir = tempdir()?;
        let config = CacheConfig {
            write_through: true,
            ..small_config()
        };
        let cache = create_test_cache(&dir.path().join("test.db"), config)?;
        let page_id = cache.allocate()?;

        {
            let mut guard = cache.write_lock(page_id)?;
            guard[PAGE_HEADER_SIZE] = 5;
        }

        assert_eq!(cache.dirty_pages(), 0);
        assert_eq!(cache.statistics().pages_written, 1);

        Ok(())
    }

    #[test]
    fn test_flush_skips_locked_pages() -> Result<()> {
        let dir = tempdir()?;
        let cache = create_test_cache(&dir.path().join("test.db"), small_config())?;
        let first = cache.allocate()?;
        let second = cache.allocate()?;
        cache.flush()?;

        let mut locked = cache.write_lock(first)?;
        locked[PAGE_HEADER_SIZE] = 1;
        {
            let mut guard = cache.write_lock(second)?;
            guard[PAGE_HEADER_SIZE] = 2;
        }

        cache.flush()?;
        assert_eq!(cache.dirty_pages(), 0);
        drop(locked);
        assert_eq!(cache.dirty_pages(), 1);

        Ok(())
    }

    #[test]
    fn test_persistence_across_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");

        {
            let cache = create_test_cache(&path, small_config())?;
            for i in 0..10u8 {
                let page_id = cache.allocate()?;
                let mut guard = cache.write_lock(page_id)?;
                guard[PAGE_HEADER_SIZE] = i;
            }
            cache.close()?;
        }

        let cache = PageCache::new(Box::new(PageManager::open(&path)?), small_config());
        for i in 0..10u8 {
            assert_eq!(cache.read_lock(PageId(i as u32))?[PAGE_HEADER_SIZE], i);
        }

        Ok(())
    }

    #[test]
    fn test_close_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let cache = create_test_cache(&dir.path().join("test.db"), small_config())?;
        cache.allocate()?;

        cache.close()?;
        cache.close()?;
        assert!(matches!(cache.allocate(), Err(StorageError::Closed)));
        assert!(matches!(cache.read_lock(PageId(0)), Err(StorageError::Closed)));

        Ok(())
    }
}
