//! I/O and cache counters.

use parking_lot::Mutex;

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Logical operations served (lookups for a cache, objects for a context).
    pub count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub pages_read: u64,
    pub pages_written: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl Statistics {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

/// Counters guarded by their own mutex, independent of any page lock.
#[derive(Debug, Default)]
pub struct StatisticsCounter {
    inner: Mutex<Statistics>,
}

impl StatisticsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        let mut stats = self.inner.lock();
        stats.count += 1;
        stats.hit_count += 1;
    }

    pub fn record_miss(&self) {
        let mut stats = self.inner.lock();
        stats.count += 1;
        stats.miss_count += 1;
    }

    pub fn record_read(&self, pages: u64, bytes: u64) {
        let mut stats = self.inner.lock();
        stats.pages_read += pages;
        stats.bytes_read += bytes;
    }

    pub fn record_write(&self, pages: u64, bytes: u64) {
        let mut stats = self.inner.lock();
        stats.pages_written += pages;
        stats.bytes_written += bytes;
    }

    /// Count one logical operation that touched `pages_read`/`pages_written` pages.
    pub fn record_operation(&self, pages_read: u64, pages_written: u64, page_size: u64) {
        let mut stats = self.inner.lock();
        stats.count += 1;
        stats.pages_read += pages_read;
        stats.pages_written += pages_written;
        stats.bytes_read += pages_read * page_size;
        stats.bytes_written += pages_written * page_size;
    }

    pub fn snapshot(&self) -> Statistics {
        *self.inner.lock()
    }

    pub fn reset(&self) {
        *self.inner.lock() = Statistics::default();
    }
}
