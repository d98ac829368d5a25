//! Application-level lock tables.
//!
//! Object ids hash into a fixed set of reader/writer lock buckets, so two ids
//! may share a lock. Named semaphores are created on first use and live for
//! the lifetime of the table.

use crate::concurrency::rwlock::{ReadLockGuard, ReadWriteLock, WriteLockGuard};
use crate::storage::error::StorageResult;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Number of id lock buckets.
pub const ID_LOCK_BUCKETS: usize = 256;

/// Fixed table of reader/writer locks selected by `id & (ID_LOCK_BUCKETS - 1)`.
#[derive(Debug)]
pub struct IdLockTable {
    buckets: Vec<ReadWriteLock>,
}

impl IdLockTable {
    pub fn new(prefix: &str) -> Self {
        Self {
            buckets: (0..ID_LOCK_BUCKETS)
                .map(|i| ReadWriteLock::new(format!("{}[{}]", prefix, i)))
                .collect(),
        }
    }

    pub fn bucket_index(id: i64) -> usize {
        (id as u64 & (ID_LOCK_BUCKETS as u64 - 1)) as usize
    }

    pub fn bucket(&self, id: i64) -> &ReadWriteLock {
        &self.buckets[Self::bucket_index(id)]
    }

    pub fn read_lock(&self, id: i64, timeout: Duration) -> StorageResult<()> {
        self.bucket(id).read_lock(timeout)
    }

    pub fn read_unlock(&self, id: i64) -> StorageResult<()> {
        self.bucket(id).read_unlock()
    }

    pub fn write_lock(&self, id: i64, timeout: Duration) -> StorageResult<()> {
        self.bucket(id).write_lock(timeout)
    }

    pub fn write_unlock(&self, id: i64, downgrade: bool) -> StorageResult<()> {
        self.bucket(id).write_unlock(downgrade)
    }

    pub fn read(&self, id: i64, timeout: Duration) -> StorageResult<ReadLockGuard<'_>> {
        self.bucket(id).read(timeout)
    }

    pub fn write(&self, id: i64, timeout: Duration) -> StorageResult<WriteLockGuard<'_>> {
        self.bucket(id).write(timeout)
    }
}

/// Named reader/writer semaphores. Names are case-insensitive.
#[derive(Debug, Default)]
pub struct SemaphoreRegistry {
    locks: DashMap<String, Arc<ReadWriteLock>>,
}

impl SemaphoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The semaphore for `name`, created on first use.
    pub fn get(&self, name: &str) -> Arc<ReadWriteLock> {
        let key = name.to_lowercase();
        self.locks
            .entry(key)
            .or_insert_with(|| Arc::new(ReadWriteLock::new(format!("semaphore '{}'", name))))
            .value()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
