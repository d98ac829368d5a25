use crate::storage::page::PageId;
use std::collections::BTreeMap;

pub type SlotId = usize;

/// Which residency set a cached page currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Locked,
    Clean,
    Dirty,
}

/// Residency bookkeeping for the page cache.
///
/// Every resident page is in exactly one of three sets, each ordered by page
/// number. Eviction takes the lowest-numbered clean page, falling back to the
/// lowest-numbered dirty page. Locked pages are never evicted.
#[derive(Debug, Default)]
pub struct Replacer {
    locked: BTreeMap<PageId, SlotId>,
    clean: BTreeMap<PageId, SlotId>,
    dirty: BTreeMap<PageId, SlotId>,
}

impl Replacer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, page_id: PageId) -> Option<(SlotId, Residency)> {
        if let Some(&slot) = self.locked.get(&page_id) {
            return Some((slot, Residency::Locked));
        }
        if let Some(&slot) = self.clean.get(&page_id) {
            return Some((slot, Residency::Clean));
        }
        self.dirty
            .get(&page_id)
            .map(|&slot| (slot, Residency::Dirty))
    }

    pub fn insert(&mut self, page_id: PageId, slot: SlotId, residency: Residency) {
        debug_assert!(self.find(page_id).is_none(), "page {} already resident", page_id);
        self.set_mut(residency).insert(page_id, slot);
    }

    pub fn remove(&mut self, page_id: PageId) -> Option<(SlotId, Residency)> {
        let (slot, residency) = self.find(page_id)?;
        self.set_mut(residency).remove(&page_id);
        Some((slot, residency))
    }

    /// Move a resident page into `residency`.
    pub fn move_to(&mut self, page_id: PageId, residency: Residency) -> Option<SlotId> {
        let (slot, _) = self.remove(page_id)?;
        self.set_mut(residency).insert(page_id, slot);
        Some(slot)
    }

    /// Pick and remove a victim: the lowest clean page, else the lowest dirty page.
    pub fn evict(&mut self) -> Option<(PageId, SlotId, Residency)> {
        if let Some((page_id, slot)) = self.clean.pop_first() {
            return Some((page_id, slot, Residency::Clean));
        }
        self.dirty
            .pop_first()
            .map(|(page_id, slot)| (page_id, slot, Residency::Dirty))
    }

    /// Take every unlocked dirty page, moving it to the clean set.
    pub fn drain_dirty(&mut self) -> Vec<(PageId, SlotId)> {
        let dirty = std::mem::take(&mut self.dirty);
        let drained: Vec<_> = dirty.into_iter().collect();
        self.clean.extend(drained.iter().copied());
        drained
    }

    pub fn len(&self) -> usize {
        self.locked.len() + self.clean.len() + self.dirty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn locked_len(&self) -> usize {
        self.locked.len()
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    fn set_mut(&mut self, residency: Residency) -> &mut BTreeMap<PageId, SlotId> {
        match residency {
            Residency::Locked => &mut self.locked,
            Residency::Clean => &mut self.clean,
            Residency::Dirty => &mut self.dirty,
        }
    }
}
