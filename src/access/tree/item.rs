use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, NO_PAGE};
use byteorder::{ByteOrder, LittleEndian};

/// Bytes of the per-item header: flags, left link, right link.
pub const ITEM_HEADER_SIZE: usize = 16;
/// Marker written in the right link of a free item.
pub const FREE_ITEM_MARKER: u32 = 0x6d65_7449;

const NO_ITEM: u16 = u16::MAX;
const FLAG_BLACK: u32 = 0x1;
const FLAG_FREE: u32 = 0x2;

/// Location of an item: page number plus index within the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemRef {
    pub page: PageId,
    pub item: u16,
}

impl ItemRef {
    pub fn new(page: PageId, item: u16) -> Self {
        Self { page, item }
    }

    /// Pack into a page-header word: page in bits 0..32, item in bits 32..48.
    pub fn pack(item: Option<ItemRef>) -> u64 {
        match item {
            Some(r) => r.page.0 as u64 | (r.item as u64) << 32,
            None => NO_PAGE as u64 | (NO_ITEM as u64) << 32,
        }
    }

    pub fn unpack(raw: u64) -> Option<ItemRef> {
        let page = raw as u32;
        let item = (raw >> 32) as u16;
        (page != NO_PAGE).then_some(ItemRef::new(PageId(page), item))
    }

    fn read(buf: &[u8]) -> Option<ItemRef> {
        let page = LittleEndian::read_u32(&buf[0..]);
        let item = LittleEndian::read_u16(&buf[4..]);
        (page != NO_PAGE).then_some(ItemRef::new(PageId(page), item))
    }

    fn write(item: Option<ItemRef>, buf: &mut [u8]) {
        let (page, index) = item.map_or((NO_PAGE, NO_ITEM), |r| (r.page.0, r.item));
        LittleEndian::write_u32(&mut buf[0..], page);
        LittleEndian::write_u16(&mut buf[4..], index);
    }
}

/// Tree links and color of a live item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemHeader {
    pub black: bool,
    pub left: Option<ItemRef>,
    pub right: Option<ItemRef>,
}

impl ItemHeader {
    pub fn red() -> Self {
        Self {
            black: false,
            left: None,
            right: None,
        }
    }
}

/// Decoded item header: a live tree node or a free-list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeListEntry {
    Live(ItemHeader),
    /// Unused item linking to the next free item.
    Free(Option<ItemRef>),
}

impl FreeListEntry {
    pub fn decode(buf: &[u8]) -> StorageResult<FreeListEntry> {
        let flags = LittleEndian::read_u32(&buf[0..]);
        let left = ItemRef::read(&buf[4..]);

        if flags & FLAG_FREE != 0 {
            let marker = LittleEndian::read_u32(&buf[10..]);
            if marker != FREE_ITEM_MARKER {
                return Err(StorageError::InvalidSignature {
                    what: "free index item",
                    expected: FREE_ITEM_MARKER as u64,
                    found: marker as u64,
                });
            }
            return Ok(FreeListEntry::Free(left));
        }

        Ok(FreeListEntry::Live(ItemHeader {
            black: flags & FLAG_BLACK != 0,
            left,
            right: ItemRef::read(&buf[10..]),
        }))
    }

    pub fn encode(&self, buf: &mut [u8]) {
        match self {
            FreeListEntry::Live(header) => {
                let flags = if header.black { FLAG_BLACK } else { 0 };
                LittleEndian::write_u32(&mut buf[0..], flags);
                ItemRef::write(header.left, &mut buf[4..]);
                ItemRef::write(header.right, &mut buf[10..]);
            }
            FreeListEntry::Free(next) => {
                LittleEndian::write_u32(&mut buf[0..], FLAG_FREE);
                ItemRef::write(*next, &mut buf[4..]);
                LittleEndian::write_u32(&mut buf[10..], FREE_ITEM_MARKER);
                LittleEndian::write_u16(&mut buf[14..], NO_ITEM);
            }
        }
    }
}
