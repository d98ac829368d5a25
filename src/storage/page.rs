pub mod guard;

use crate::storage::error::{StorageError, StorageResult};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// Signature stamped at offset 0 of every physical page.
pub const PAGE_SIGNATURE: u64 = 0x6567_6150_6174_6144;
/// Bytes reserved at the start of every page for the physical header.
pub const PAGE_HEADER_SIZE: usize = 64;
/// On-disk encoding of an absent page link.
pub const NO_PAGE: u32 = u32::MAX;

const PAGE_CHECK_MASK: u32 = 0x7fff_ffff;

const SIGNATURE_OFFSET: usize = 0;
const PAGE_NO_OFFSET: usize = 8;
const PAGE_CHECK_OFFSET: usize = 12;
const PREV_OFFSET: usize = 16;
const NEXT_OFFSET: usize = 20;
const DATA_OFFSET: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u32);

impl PageId {
    pub fn encode(page: Option<PageId>) -> u32 {
        page.map_or(NO_PAGE, |p| p.0)
    }

    pub fn decode(raw: u32) -> Option<PageId> {
        (raw != NO_PAGE).then_some(PageId(raw))
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical page header: a doubly linked page list plus four free-use words.
///
/// The physical encoding also carries the page signature, the page number and
/// its complement check; those are validated on read and never exposed here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageHeader {
    pub prev_page: Option<PageId>,
    pub next_page: Option<PageId>,
    pub data: [u64; 4],
}

impl PageHeader {
    /// Decode the header of `page`, validating the physical signature and page check.
    pub fn read(page: &[u8]) -> StorageResult<PageHeader> {
        Self::read_physical(page).map(|(_, header)| header)
    }

    /// Decode the header together with the page number recorded in it.
    pub fn read_physical(page: &[u8]) -> StorageResult<(PageId, PageHeader)> {
        if page.len() < PAGE_HEADER_SIZE {
            return Err(StorageError::Corruption(format!(
                "page buffer of {} bytes cannot hold a header",
                page.len()
            )));
        }

        let signature = LittleEndian::read_u64(&page[SIGNATURE_OFFSET..]);
        if signature != PAGE_SIGNATURE {
            return Err(StorageError::InvalidSignature {
                what: "page",
                expected: PAGE_SIGNATURE,
                found: signature,
            });
        }

        let page_no = LittleEndian::read_u32(&page[PAGE_NO_OFFSET..]);
        let check = LittleEndian::read_u32(&page[PAGE_CHECK_OFFSET..]);
        if page_no ^ PAGE_CHECK_MASK != check {
            return Err(StorageError::Corruption(format!(
                "page number check failed for page {}",
                page_no
            )));
        }

        let mut data = [0u64; 4];
        for (i, word) in data.iter_mut().enumerate() {
            *word = LittleEndian::read_u64(&page[DATA_OFFSET + i * 8..]);
        }

        Ok((
            PageId(page_no),
            PageHeader {
                prev_page: PageId::decode(LittleEndian::read_u32(&page[PREV_OFFSET..])),
                next_page: PageId::decode(LittleEndian::read_u32(&page[NEXT_OFFSET..])),
                data,
            },
        ))
    }

    /// Encode the header into `page`, stamping signature and page number.
    pub fn write(&self, page_id: PageId, page: &mut [u8]) {
        LittleEndian::write_u64(&mut page[SIGNATURE_OFFSET..], PAGE_SIGNATURE);
        LittleEndian::write_u32(&mut page[PAGE_NO_OFFSET..], page_id.0);
        LittleEndian::write_u32(&mut page[PAGE_CHECK_OFFSET..], page_id.0 ^ PAGE_CHECK_MASK);
        LittleEndian::write_u32(&mut page[PREV_OFFSET..], PageId::encode(self.prev_page));
        LittleEndian::write_u32(&mut page[NEXT_OFFSET..], PageId::encode(self.next_page));
        for (i, word) in self.data.iter().enumerate() {
            LittleEndian::write_u64(&mut page[DATA_OFFSET + i * 8..], *word);
        }
    }

    /// Zero `page` and give it an empty header.
    pub fn initialize(page_id: PageId, page: &mut [u8]) {
        page.fill(0);
        PageHeader::default().write(page_id, page);
    }
}

pub use guard::{PageBuffer, PageReadGuard, PageWriteGuard};
