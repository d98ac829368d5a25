//! Storage layer implementation for pagedb.
//!
//! This module provides page-based persistence. Key components:
//!
//! - **PageManager**: Fixed-size page file with a small file header
//! - **PageCache**: Bounded page cache with per-page reader/writer locks,
//!   evicting the lowest-numbered unlocked page
//! - **PageProvider**: The page-level contract the index and object layers are written against
//! - **PageHeader**: Linked-list header stamped on every page

pub mod buffer;
pub mod disk;
pub mod error;
pub mod page;
pub mod provider;
pub mod stats;

pub use buffer::{CacheConfig, LockState, PageCache};
pub use disk::{PageManager, DEFAULT_PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use page::{PageHeader, PageId, PageReadGuard, PageWriteGuard, PAGE_HEADER_SIZE};
pub use provider::{PageProvider, PageStorage};
pub use stats::{Statistics, StatisticsCounter};
