//! Access layer for the persistent index.
//!
//! - **PageTree**: Left-leaning red-black tree whose nodes live in page items
//! - **ItemCodec**: Fixed-size key/value encoding for tree items
//! - **IdIndexCodec**: The object index codec, mapping ids to packed entries

pub mod tree;

pub use tree::codec::{IdIndexCodec, ItemCodec};
pub use tree::item::{FreeListEntry, ItemHeader, ItemRef};
pub use tree::{NodeInfo, PageTree, INDEX_PAGE_SIGNATURE};
