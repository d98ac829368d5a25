//! Timed reader/writer lock with writer preference and downgrade.

use crate::concurrency::backoff::ProgressiveWait;
use crate::storage::error::{StorageError, StorageResult};
use log::warn;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Shared,
    /// A writer is waiting for the remaining readers to leave.
    WriteRequested,
    Exclusive,
}

#[derive(Debug)]
struct LockInner {
    mode: Mode,
    readers: u32,
    lock_count: u64,
    unlock_count: u64,
    wait_time: Duration,
}

/// Reader/writer lock whose acquisitions wait at most a timeout.
///
/// Once a writer asks for the lock no new readers are admitted; the writer
/// gets it when the current readers drain. Locks are not tied to a thread,
/// so a lock taken on one thread may be released on another.
#[derive(Debug)]
pub struct ReadWriteLock {
    name: String,
    inner: Mutex<LockInner>,
    released: Condvar,
}

/// Lock counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStatistics {
    pub lock_count: u64,
    pub unlock_count: u64,
    pub wait_time: Duration,
}

impl ReadWriteLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(LockInner {
                mode: Mode::Shared,
                readers: 0,
                lock_count: 0,
                unlock_count: 0,
                wait_time: Duration::ZERO,
            }),
            released: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take a shared lock. A zero `timeout` waits forever.
    pub fn read_lock(&self, timeout: Duration) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let mut wait = ProgressiveWait::new(timeout);

        loop {
            if inner.mode == Mode::Shared {
                inner.readers += 1;
                inner.lock_count += 1;
                inner.wait_time += wait.waited();
                return Ok(());
            }
            wait.wait(&self.released, &mut inner, || format!("read lock {}", self.name))?;
        }
    }

    /// Take the exclusive lock. A zero `timeout` waits forever.
    pub fn write_lock(&self, timeout: Duration) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let mut wait = ProgressiveWait::new(timeout);

        loop {
            if inner.mode == Mode::Shared {
                inner.mode = Mode::WriteRequested;
            }
            if inner.mode == Mode::WriteRequested && inner.readers == 0 {
                inner.mode = Mode::Exclusive;
                inner.lock_count += 1;
                inner.wait_time += wait.waited();
                return Ok(());
            }

            let waited = wait.wait(&self.released, &mut inner, || {
                format!("write lock {}", self.name)
            });
            if let Err(e) = waited {
                if inner.mode == Mode::WriteRequested {
                    inner.mode = Mode::Shared;
                    self.released.notify_all();
                }
                warn!("{}", e);
                return Err(e);
            }
        }
    }

    pub fn read_unlock(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if inner.mode == Mode::Exclusive || inner.readers == 0 {
            return Err(StorageError::LockState(format!(
                "{} is not read locked",
                self.name
            )));
        }

        inner.readers -= 1;
        inner.unlock_count += 1;
        drop(inner);

        self.released.notify_all();
        Ok(())
    }

    /// Release the exclusive lock. With `downgrade` the caller keeps a shared lock.
    pub fn write_unlock(&self, downgrade: bool) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if inner.mode != Mode::Exclusive {
            return Err(StorageError::LockState(format!(
                "{} is not write locked",
                self.name
            )));
        }

        inner.mode = Mode::Shared;
        inner.unlock_count += 1;
        if downgrade {
            inner.readers += 1;
            inner.lock_count += 1;
        }
        drop(inner);

        self.released.notify_all();
        Ok(())
    }

    pub fn read(&self, timeout: Duration) -> StorageResult<ReadLockGuard<'_>> {
        self.read_lock(timeout)?;
        Ok(ReadLockGuard { lock: self })
    }

    pub fn write(&self, timeout: Duration) -> StorageResult<WriteLockGuard<'_>> {
        self.write_lock(timeout)?;
        Ok(WriteLockGuard {
            lock: self,
            released: false,
        })
    }

    pub fn is_locked(&self) -> bool {
        let inner = self.inner.lock();
        inner.mode == Mode::Exclusive || inner.readers > 0
    }

    pub fn statistics(&self) -> LockStatistics {
        let inner = self.inner.lock();
        LockStatistics {
            lock_count: inner.lock_count,
            unlock_count: inner.unlock_count,
            wait_time: inner.wait_time,
        }
    }
}

/// Shared lock released on drop.
pub struct ReadLockGuard<'a> {
    lock: &'a ReadWriteLock,
}

impl Drop for ReadLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.read_unlock() {
            warn!("Failed to release {}: {}", self.lock.name, e);
        }
    }
}

/// Exclusive lock released on drop.
pub struct WriteLockGuard<'a> {
    lock: &'a ReadWriteLock,
    released: bool,
}

impl<'a> WriteLockGuard<'a> {
    /// Trade the exclusive lock for a shared one without letting a writer in between.
    pub fn downgrade(mut self) -> StorageResult<ReadLockGuard<'a>> {
        self.released = true;
        self.lock.write_unlock(true)?;
        Ok(ReadLockGuard { lock: self.lock })
    }
}

impl Drop for WriteLockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.lock.write_unlock(false) {
            warn!("Failed to release {}: {}", self.lock.name, e);
        }
    }
}
