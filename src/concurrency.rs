//! Concurrency control module.
//!
//! This module implements the lock primitives shared by the storage and
//! object layers:
//! - Progressive backoff for condition-variable waits with a timeout
//! - A timed reader/writer lock with writer preference and downgrade
//! - Bucketed id locks and named semaphores for applications

pub mod backoff;
pub mod lock;
pub mod rwlock;

pub use lock::{IdLockTable, SemaphoreRegistry, ID_LOCK_BUCKETS};
pub use rwlock::{LockStatistics, ReadLockGuard, ReadWriteLock, WriteLockGuard};
