//! Persistent left-leaning red-black tree stored in fixed-size page items.
//!
//! Each tree page holds an array of equally sized items after the page
//! header. An item is a 16-byte header (color and child links) followed by
//! the codec-encoded key and value. Unused items are chained into a free
//! list through their left link. The root page's header words carry the
//! tree metadata:
//!
//! - data[0]: index page signature (on every tree page)
//! - data[1]: packed root item reference
//! - data[2]: packed free-list head
//! - data[3]: live item count
//!
//! All node reads and writes go through the page provider's page locks; a
//! tree-wide reader/writer lock serializes mutations against readers.

pub mod codec;
pub mod item;

use self::codec::ItemCodec;
use self::item::{FreeListEntry, ItemHeader, ItemRef, ITEM_HEADER_SIZE};
use crate::concurrency::ReadWriteLock;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use crate::storage::provider::PageProvider;
use log::{debug, trace};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub const INDEX_PAGE_SIGNATURE: u64 = 0x6567_6150_7864_6e49;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TreeState {
    root: Option<ItemRef>,
    free: Option<ItemRef>,
    count: u64,
}

struct Node<K, V> {
    header: ItemHeader,
    key: K,
    value: V,
}

/// Snapshot of one node, with child keys in place of child links.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo<K, V> {
    pub item: ItemRef,
    pub key: K,
    pub value: V,
    pub black: bool,
    pub left: Option<K>,
    pub right: Option<K>,
}

struct CheckCursor<K> {
    seen: HashSet<ItemRef>,
    last: Option<K>,
}

pub struct PageTree<C: ItemCodec> {
    provider: Arc<dyn PageProvider>,
    codec: C,
    root_page: PageId,
    items_per_page: u16,
    header_size: usize,
    lock_timeout: Duration,
    sync: ReadWriteLock,
    state: Mutex<TreeState>,
}

fn missing_child(item: ItemRef, side: &str) -> StorageError {
    StorageError::Corruption(format!("index item {:?} has no {} child", item, side))
}

impl<C: ItemCodec> PageTree<C> {
    /// Create an empty tree. Its root page is allocated from `provider`.
    pub fn create(
        provider: Arc<dyn PageProvider>,
        codec: C,
        lock_timeout: Duration,
    ) -> StorageResult<Self> {
        let items_per_page = Self::items_per_page(&*provider, &codec)?;
        let header_size = provider.page_header_size();
        let mut tree = Self {
            provider,
            codec,
            root_page: PageId(0),
            items_per_page,
            header_size,
            lock_timeout,
            sync: ReadWriteLock::new("index tree"),
            state: Mutex::new(TreeState {
                root: None,
                free: None,
                count: 0,
            }),
        };

        let mut state = *tree.state.get_mut();
        tree.root_page = tree.format_page(&mut state)?;
        tree.store_state(&state)?;
        *tree.state.get_mut() = state;
        debug!(
            "Created index tree at page {} ({} items per page)",
            tree.root_page, items_per_page
        );

        Ok(tree)
    }

    /// Attach to an existing tree rooted at `root_page`.
    pub fn open(
        provider: Arc<dyn PageProvider>,
        codec: C,
        root_page: PageId,
        lock_timeout: Duration,
    ) -> StorageResult<Self> {
        let items_per_page = Self::items_per_page(&*provider, &codec)?;
        let header = {
            let page = provider.read_lock(root_page)?;
            page.header()?
        };
        if header.data[0] != INDEX_PAGE_SIGNATURE {
            return Err(StorageError::InvalidSignature {
                what: "index page",
                expected: INDEX_PAGE_SIGNATURE,
                found: header.data[0],
            });
        }

        let state = TreeState {
            root: ItemRef::unpack(header.data[1]),
            free: ItemRef::unpack(header.data[2]),
            count: header.data[3],
        };
        debug!(
            "Opened index tree at page {} with {} items",
            root_page, state.count
        );

        Ok(Self {
            header_size: provider.page_header_size(),
            provider,
            codec,
            root_page,
            items_per_page,
            lock_timeout,
            sync: ReadWriteLock::new("index tree"),
            state: Mutex::new(state),
        })
    }

    fn items_per_page(provider: &dyn PageProvider, codec: &C) -> StorageResult<u16> {
        let item_size = codec.item_size();
        let usable = provider
            .page_size()
            .saturating_sub(provider.page_header_size());
        if item_size <= ITEM_HEADER_SIZE || usable / item_size == 0 {
            return Err(StorageError::InvalidArgument(format!(
                "item size {} does not fit a page with {} usable bytes",
                item_size, usable
            )));
        }
        Ok((usable / item_size).min(u16::MAX as usize - 1) as u16)
    }

    pub fn root_page(&self) -> PageId {
        self.root_page
    }

    pub fn len(&self) -> u64 {
        self.state.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `key`, replacing the value if the key is already present.
    pub fn insert(&self, key: C::Key, value: C::Value) -> StorageResult<()> {
        let _guard = self.sync.write(self.lock_timeout)?;
        let mut state = self.state.lock();

        let root = state.root;
        let root = self.add(&mut state, root, &key, &value)?;
        self.set_black(root)?;
        state.root = Some(root);
        self.store_state(&state)?;
        trace!("Inserted {:?} ({} items)", key, state.count);

        Ok(())
    }

    /// Remove `key`. Returns false if it was not present.
    pub fn remove(&self, key: &C::Key) -> StorageResult<bool> {
        let _guard = self.sync.write(self.lock_timeout)?;
        let mut state = self.state.lock();

        let Some(root) = state.root else {
            return Ok(false);
        };
        if self.find(root, key)?.is_none() {
            return Ok(false);
        }

        let mut header = self.header(root)?;
        if !self.is_red(header.left)? && !self.is_red(header.right)? {
            header.black = false;
            self.set_header(root, &header)?;
        }

        let root = self.delete(&mut state, root, key)?;
        if let Some(root) = root {
            self.set_black(root)?;
        }
        state.root = root;
        self.store_state(&state)?;
        trace!("Removed {:?} ({} items)", key, state.count);

        Ok(true)
    }

    pub fn get(&self, key: &C::Key) -> StorageResult<Option<C::Value>> {
        let _guard = self.sync.read(self.lock_timeout)?;
        let root = self.state.lock().root;
        match root {
            Some(root) => Ok(self.find(root, key)?.map(|node| node.value)),
            None => Ok(None),
        }
    }

    pub fn contains_key(&self, key: &C::Key) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// All entries in key order.
    pub fn entries(&self) -> StorageResult<Vec<(C::Key, C::Value)>> {
        let _guard = self.sync.read(self.lock_timeout)?;
        let state = *self.state.lock();
        let mut entries = Vec::with_capacity(state.count as usize);
        self.walk(&state, |_, node| {
            entries.push((node.key, node.value));
            Ok(())
        })?;
        Ok(entries)
    }

    /// All nodes in key order with their colors and child keys.
    pub fn nodes(&self) -> StorageResult<Vec<NodeInfo<C::Key, C::Value>>> {
        let _guard = self.sync.read(self.lock_timeout)?;
        let state = *self.state.lock();
        let mut nodes = Vec::with_capacity(state.count as usize);
        self.walk(&state, |item, node| {
            let left = node.header.left.map(|l| self.node(l)).transpose()?;
            let right = node.header.right.map(|r| self.node(r)).transpose()?;
            nodes.push(NodeInfo {
                item,
                key: node.key,
                value: node.value,
                black: node.header.black,
                left: left.map(|n| n.key),
                right: right.map(|n| n.key),
            });
            Ok(())
        })?;
        Ok(nodes)
    }

    /// References of every item on the free list, head first.
    pub fn free_items(&self) -> StorageResult<Vec<ItemRef>> {
        let _guard = self.sync.read(self.lock_timeout)?;
        let state = *self.state.lock();
        self.collect_free(&state)
    }

    /// Verify the red-black invariants, key order, item count and free-list
    /// disjointness. Returns the black height.
    pub fn check(&self) -> StorageResult<u32> {
        let _guard = self.sync.read(self.lock_timeout)?;
        let state = *self.state.lock();

        let mut cursor = CheckCursor {
            seen: HashSet::new(),
            last: None,
        };
        let height = match state.root {
            Some(root) => {
                if !self.header(root)?.black {
                    return Err(StorageError::Corruption("index root is red".to_string()));
                }
                self.check_node(root, &mut cursor)?
            }
            None => 0,
        };

        if cursor.seen.len() as u64 != state.count {
            return Err(StorageError::Corruption(format!(
                "index holds {} reachable items but records {}",
                cursor.seen.len(),
                state.count
            )));
        }
        for item in self.collect_free(&state)? {
            if cursor.seen.contains(&item) {
                return Err(StorageError::Corruption(format!(
                    "index item {:?} is both live and free",
                    item
                )));
            }
        }

        Ok(height)
    }

    fn check_node(&self, item: ItemRef, cursor: &mut CheckCursor<C::Key>) -> StorageResult<u32> {
        if !cursor.seen.insert(item) {
            return Err(StorageError::Corruption(format!(
                "index item {:?} is reachable twice",
                item
            )));
        }

        let node = self.node(item)?;
        let header = node.header;
        if self.is_red(header.right)? {
            return Err(StorageError::Corruption(format!(
                "index item {:?} has a red right link",
                item
            )));
        }
        if !header.black && self.is_red(header.left)? {
            return Err(StorageError::Corruption(format!(
                "index item {:?} has consecutive red links",
                item
            )));
        }

        let left_height = match header.left {
            Some(left) => self.check_node(left, cursor)?,
            None => 0,
        };

        if let Some(last) = &cursor.last {
            if self.codec.compare(last, &node.key) != Ordering::Less {
                return Err(StorageError::Corruption(format!(
                    "index keys out of order at {:?}",
                    item
                )));
            }
        }
        cursor.last = Some(node.key);

        let right_height = match header.right {
            Some(right) => self.check_node(right, cursor)?,
            None => 0,
        };

        if left_height != right_height {
            return Err(StorageError::Corruption(format!(
                "black height mismatch below {:?}: {} vs {}",
                item, left_height, right_height
            )));
        }

        Ok(left_height + header.black as u32)
    }

    fn collect_free(&self, state: &TreeState) -> StorageResult<Vec<ItemRef>> {
        let mut items = Vec::new();
        let mut seen = HashSet::new();
        let mut current = state.free;

        while let Some(item) = current {
            if !seen.insert(item) {
                return Err(StorageError::Corruption(format!(
                    "index free list loops at {:?}",
                    item
                )));
            }
            current = match self.read_entry(item)? {
                FreeListEntry::Free(next) => next,
                FreeListEntry::Live(_) => {
                    return Err(StorageError::Corruption(format!(
                        "live index item {:?} on the free list",
                        item
                    )))
                }
            };
            items.push(item);
        }

        Ok(items)
    }

    fn walk<F>(&self, state: &TreeState, mut visit: F) -> StorageResult<()>
    where
        F: FnMut(ItemRef, Node<C::Key, C::Value>) -> StorageResult<()>,
    {
        let mut stack = Vec::new();
        let mut current = state.root;
        let mut visited = 0u64;

        loop {
            while let Some(item) = current {
                let node = self.node(item)?;
                current = node.header.left;
                stack.push((item, node));
            }
            let Some((item, node)) = stack.pop() else {
                break;
            };

            visited += 1;
            if visited > state.count {
                return Err(StorageError::Corruption(format!(
                    "index walk exceeded {} items",
                    state.count
                )));
            }
            current = node.header.right;
            visit(item, node)?;
        }

        Ok(())
    }

    fn find(&self, mut item: ItemRef, key: &C::Key) -> StorageResult<Option<Node<C::Key, C::Value>>> {
        loop {
            let node = self.node(item)?;
            let next = match self.codec.compare(key, &node.key) {
                Ordering::Less => node.header.left,
                Ordering::Greater => node.header.right,
                Ordering::Equal => return Ok(Some(node)),
            };
            match next {
                Some(next) => item = next,
                None => return Ok(None),
            }
        }
    }

    fn add(
        &self,
        state: &mut TreeState,
        item: Option<ItemRef>,
        key: &C::Key,
        value: &C::Value,
    ) -> StorageResult<ItemRef> {
        let Some(item) = item else {
            state.count += 1;
            return self.new_item(state, key, value);
        };

        let node = self.node(item)?;
        let mut header = node.header;
        match self.codec.compare(key, &node.key) {
            Ordering::Less => {
                header.left = Some(self.add(state, header.left, key, value)?);
                self.set_header(item, &header)?;
            }
            Ordering::Greater => {
                header.right = Some(self.add(state, header.right, key, value)?);
                self.set_header(item, &header)?;
            }
            Ordering::Equal => self.set_item(item, &header, key, value)?,
        }

        self.balance(item)
    }

    fn delete(
        &self,
        state: &mut TreeState,
        item: ItemRef,
        key: &C::Key,
    ) -> StorageResult<Option<ItemRef>> {
        let mut item = item;

        if self.codec.compare(key, &self.node(item)?.key) == Ordering::Less {
            let left = self
                .header(item)?
                .left
                .ok_or_else(|| missing_child(item, "left"))?;
            if !self.is_red(Some(left))? && !self.is_red(self.header(left)?.left)? {
                item = self.move_red_left(item)?;
            }

            let mut header = self.header(item)?;
            let left = header.left.ok_or_else(|| missing_child(item, "left"))?;
            header.left = self.delete(state, left, key)?;
            self.set_header(item, &header)?;
        } else {
            if self.is_red(self.header(item)?.left)? {
                item = self.rotate_right(item)?;
            }

            let node = self.node(item)?;
            if self.codec.compare(key, &node.key) == Ordering::Equal && node.header.right.is_none() {
                self.free_item(state, item)?;
                state.count -= 1;
                return Ok(None);
            }

            let right = node
                .header
                .right
                .ok_or_else(|| missing_child(item, "right"))?;
            if !self.is_red(Some(right))? && !self.is_red(self.header(right)?.left)? {
                item = self.move_red_right(item)?;
            }

            let node = self.node(item)?;
            let mut header = node.header;
            let right = header.right.ok_or_else(|| missing_child(item, "right"))?;
            if self.codec.compare(key, &node.key) == Ordering::Equal {
                let successor = self.minimum(right)?;
                let replacement = self.node(successor)?;
                header.right = self.delete_minimum(right)?;
                self.set_item(item, &header, &replacement.key, &replacement.value)?;
                self.free_item(state, successor)?;
                state.count -= 1;
            } else {
                header.right = self.delete(state, right, key)?;
                self.set_header(item, &header)?;
            }
        }

        self.balance(item).map(Some)
    }

    /// Unlink the minimum item below `item`. The item itself is not freed.
    fn delete_minimum(&self, item: ItemRef) -> StorageResult<Option<ItemRef>> {
        let Some(left) = self.header(item)?.left else {
            return Ok(None);
        };

        let mut item = item;
        if !self.is_red(Some(left))? && !self.is_red(self.header(left)?.left)? {
            item = self.move_red_left(item)?;
        }

        let mut header = self.header(item)?;
        let left = header.left.ok_or_else(|| missing_child(item, "left"))?;
        header.left = self.delete_minimum(left)?;
        self.set_header(item, &header)?;

        self.balance(item).map(Some)
    }

    fn minimum(&self, mut item: ItemRef) -> StorageResult<ItemRef> {
        while let Some(left) = self.header(item)?.left {
            item = left;
        }
        Ok(item)
    }

    fn rotate_left(&self, item: ItemRef) -> StorageResult<ItemRef> {
        let mut header = self.header(item)?;
        let pivot = header.right.ok_or_else(|| missing_child(item, "right"))?;
        let mut pivot_header = self.header(pivot)?;

        header.right = pivot_header.left;
        pivot_header.left = Some(item);
        pivot_header.black = header.black;
        header.black = false;

        self.set_header(item, &header)?;
        self.set_header(pivot, &pivot_header)?;
        Ok(pivot)
    }

    fn rotate_right(&self, item: ItemRef) -> StorageResult<ItemRef> {
        let mut header = self.header(item)?;
        let pivot = header.left.ok_or_else(|| missing_child(item, "left"))?;
        let mut pivot_header = self.header(pivot)?;

        header.left = pivot_header.right;
        pivot_header.right = Some(item);
        pivot_header.black = header.black;
        header.black = false;

        self.set_header(item, &header)?;
        self.set_header(pivot, &pivot_header)?;
        Ok(pivot)
    }

    fn flip_colors(&self, item: ItemRef) -> StorageResult<()> {
        let mut header = self.header(item)?;
        header.black = !header.black;
        self.set_header(item, &header)?;

        for child in [header.left, header.right].into_iter().flatten() {
            let mut child_header = self.header(child)?;
            child_header.black = !child_header.black;
            self.set_header(child, &child_header)?;
        }
        Ok(())
    }

    fn move_red_left(&self, item: ItemRef) -> StorageResult<ItemRef> {
        self.flip_colors(item)?;

        let mut header = self.header(item)?;
        let right = header.right.ok_or_else(|| missing_child(item, "right"))?;
        if self.is_red(self.header(right)?.left)? {
            header.right = Some(self.rotate_right(right)?);
            self.set_header(item, &header)?;
            let item = self.rotate_left(item)?;
            self.flip_colors(item)?;
            return Ok(item);
        }
        Ok(item)
    }

    fn move_red_right(&self, item: ItemRef) -> StorageResult<ItemRef> {
        self.flip_colors(item)?;

        let left = self
            .header(item)?
            .left
            .ok_or_else(|| missing_child(item, "left"))?;
        if self.is_red(self.header(left)?.left)? {
            let item = self.rotate_right(item)?;
            self.flip_colors(item)?;
            return Ok(item);
        }
        Ok(item)
    }

    /// Restore left-leaning shape on the way back up.
    fn balance(&self, item: ItemRef) -> StorageResult<ItemRef> {
        let mut item = item;

        let header = self.header(item)?;
        if self.is_red(header.right)? && !self.is_red(header.left)? {
            item = self.rotate_left(item)?;
        }

        let header = self.header(item)?;
        if let Some(left) = header.left {
            if self.is_red(Some(left))? && self.is_red(self.header(left)?.left)? {
                item = self.rotate_right(item)?;
            }
        }

        let header = self.header(item)?;
        if self.is_red(header.left)? && self.is_red(header.right)? {
            self.flip_colors(item)?;
        }

        Ok(item)
    }

    fn set_black(&self, item: ItemRef) -> StorageResult<()> {
        let mut header = self.header(item)?;
        if !header.black {
            header.black = true;
            self.set_header(item, &header)?;
        }
        Ok(())
    }

    fn is_red(&self, item: Option<ItemRef>) -> StorageResult<bool> {
        match item {
            Some(item) => Ok(!self.header(item)?.black),
            None => Ok(false),
        }
    }

    fn new_item(&self, state: &mut TreeState, key: &C::Key, value: &C::Value) -> StorageResult<ItemRef> {
        if state.free.is_none() {
            self.format_page(state)?;
        }
        let item = state
            .free
            .ok_or_else(|| StorageError::Exhausted("index free list".to_string()))?;

        match self.read_entry(item)? {
            FreeListEntry::Free(next) => state.free = next,
            FreeListEntry::Live(_) => {
                return Err(StorageError::Corruption(format!(
                    "free list head {:?} is a live item",
                    item
                )))
            }
        }

        self.set_item(item, &ItemHeader::red(), key, value)?;
        Ok(item)
    }

    fn free_item(&self, state: &mut TreeState, item: ItemRef) -> StorageResult<()> {
        self.write_entry(item, &FreeListEntry::Free(state.free), None)?;
        state.free = Some(item);
        Ok(())
    }

    /// Allocate a tree page and thread all of its items onto the free list.
    fn format_page(&self, state: &mut TreeState) -> StorageResult<PageId> {
        let page_id = self.provider.allocate()?;
        let mut page = self.provider.write_lock(page_id)?;

        let mut header = page.header()?;
        header.data = [INDEX_PAGE_SIGNATURE, 0, 0, 0];
        page.set_header(&header);

        for index in 0..self.items_per_page {
            let offset = self.item_offset(index);
            FreeListEntry::Free(state.free).encode(&mut page[offset..offset + ITEM_HEADER_SIZE]);
            state.free = Some(ItemRef::new(page_id, index));
        }
        debug!(
            "Formatted index page {} with {} free items",
            page_id, self.items_per_page
        );

        Ok(page_id)
    }

    fn store_state(&self, state: &TreeState) -> StorageResult<()> {
        let mut page = self.provider.write_lock(self.root_page)?;
        let mut header = page.header()?;
        if header.data[0] != INDEX_PAGE_SIGNATURE {
            return Err(StorageError::InvalidSignature {
                what: "index page",
                expected: INDEX_PAGE_SIGNATURE,
                found: header.data[0],
            });
        }

        header.data[1] = ItemRef::pack(state.root);
        header.data[2] = ItemRef::pack(state.free);
        header.data[3] = state.count;
        page.set_header(&header);
        Ok(())
    }

    fn item_offset(&self, index: u16) -> usize {
        self.header_size + index as usize * self.codec.item_size()
    }

    fn check_page(&self, item: ItemRef, page: &[u8]) -> StorageResult<()> {
        if item.item >= self.items_per_page {
            return Err(StorageError::Corruption(format!(
                "index item {:?} is outside its page",
                item
            )));
        }
        let header = self.provider.get_page_header(page)?;
        if header.data[0] != INDEX_PAGE_SIGNATURE {
            return Err(StorageError::InvalidSignature {
                what: "index page",
                expected: INDEX_PAGE_SIGNATURE,
                found: header.data[0],
            });
        }
        Ok(())
    }

    fn read_entry(&self, item: ItemRef) -> StorageResult<FreeListEntry> {
        let page = self.provider.read_lock(item.page)?;
        self.check_page(item, &page)?;
        let offset = self.item_offset(item.item);
        FreeListEntry::decode(&page[offset..offset + ITEM_HEADER_SIZE])
    }

    fn header(&self, item: ItemRef) -> StorageResult<ItemHeader> {
        match self.read_entry(item)? {
            FreeListEntry::Live(header) => Ok(header),
            FreeListEntry::Free(_) => Err(StorageError::Corruption(format!(
                "index item {:?} is on the free list",
                item
            ))),
        }
    }

    fn node(&self, item: ItemRef) -> StorageResult<Node<C::Key, C::Value>> {
        let page = self.provider.read_lock(item.page)?;
        self.check_page(item, &page)?;
        let offset = self.item_offset(item.item);
        let bytes = &page[offset..offset + self.codec.item_size()];

        match FreeListEntry::decode(&bytes[..ITEM_HEADER_SIZE])? {
            FreeListEntry::Live(header) => Ok(Node {
                header,
                key: self.codec.decode_key(&bytes[ITEM_HEADER_SIZE..]),
                value: self.codec.decode_value(&bytes[ITEM_HEADER_SIZE..]),
            }),
            FreeListEntry::Free(_) => Err(StorageError::Corruption(format!(
                "index item {:?} is on the free list",
                item
            ))),
        }
    }

    fn write_entry(
        &self,
        item: ItemRef,
        entry: &FreeListEntry,
        body: Option<(&C::Key, &C::Value)>,
    ) -> StorageResult<()> {
        let mut page = self.provider.write_lock(item.page)?;
        self.check_page(item, &page)?;
        let offset = self.item_offset(item.item);
        let bytes = &mut page[offset..offset + self.codec.item_size()];

        entry.encode(&mut bytes[..ITEM_HEADER_SIZE]);
        if let Some((key, value)) = body {
            self.codec.encode(&mut bytes[ITEM_HEADER_SIZE..], key, value);
        }
        Ok(())
    }

    fn set_header(&self, item: ItemRef, header: &ItemHeader) -> StorageResult<()> {
        self.write_entry(item, &FreeListEntry::Live(*header), None)
    }

    fn set_item(
        &self,
        item: ItemRef,
        header: &ItemHeader,
        key: &C::Key,
        value: &C::Value,
    ) -> StorageResult<()> {
        self.write_entry(item, &FreeListEntry::Live(*header), Some((key, value)))
    }
}
