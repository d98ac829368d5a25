use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

pub const CONTROL_SIGNATURE: u64 = 0x6c72_7443_6174_6144;
/// Page holding the control record.
pub const ROOT_PAGE: PageId = PageId(0);
/// First id handed out by a new context.
pub const FIRST_OBJECT_ID: i64 = 1000;

// signature, four page links, next id, description length
const CONTROL_FIXED_SIZE: usize = 8 + 4 * 4 + 8 + 4;
const NO_DESCRIPTION: u32 = u32::MAX;

/// Context bookkeeping persisted on the root page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlInfo {
    pub free_page: Option<PageId>,
    pub index_page: PageId,
    /// Reserved for a symbol table; never set by this crate.
    pub symbol_page: Option<PageId>,
    pub root_object: Option<PageId>,
    pub next_id: i64,
}

impl ControlInfo {
    pub fn new(index_page: PageId) -> Self {
        Self {
            free_page: None,
            index_page,
            symbol_page: None,
            root_object: None,
            next_id: FIRST_OBJECT_ID,
        }
    }

    pub fn read(page: &[u8], header_size: usize) -> StorageResult<Self> {
        let mut cursor = Cursor::new(&page[header_size..]);

        let signature = cursor.read_u64::<LittleEndian>()?;
        if signature != CONTROL_SIGNATURE {
            return Err(StorageError::InvalidSignature {
                what: "control page",
                expected: CONTROL_SIGNATURE,
                found: signature,
            });
        }

        let free_page = PageId::decode(cursor.read_u32::<LittleEndian>()?);
        let index_page = PageId::decode(cursor.read_u32::<LittleEndian>()?)
            .ok_or_else(|| StorageError::Corruption("control page has no index page".to_string()))?;
        let symbol_page = PageId::decode(cursor.read_u32::<LittleEndian>()?);
        let root_object = PageId::decode(cursor.read_u32::<LittleEndian>()?);
        let next_id = cursor.read_i64::<LittleEndian>()?;

        Ok(Self {
            free_page,
            index_page,
            symbol_page,
            root_object,
            next_id,
        })
    }

    /// Write the fixed fields. The description area is left untouched.
    pub fn write(&self, page: &mut [u8], header_size: usize) -> StorageResult<()> {
        let mut cursor = Cursor::new(&mut page[header_size..]);
        cursor.write_u64::<LittleEndian>(CONTROL_SIGNATURE)?;
        cursor.write_u32::<LittleEndian>(PageId::encode(self.free_page))?;
        cursor.write_u32::<LittleEndian>(self.index_page.0)?;
        cursor.write_u32::<LittleEndian>(PageId::encode(self.symbol_page))?;
        cursor.write_u32::<LittleEndian>(PageId::encode(self.root_object))?;
        cursor.write_i64::<LittleEndian>(self.next_id)?;
        Ok(())
    }

    pub fn read_description(page: &[u8], header_size: usize) -> StorageResult<Option<String>> {
        let offset = header_size + CONTROL_FIXED_SIZE - 4;
        let mut cursor = Cursor::new(&page[offset..]);

        let len = cursor.read_u32::<LittleEndian>()?;
        if len == NO_DESCRIPTION {
            return Ok(None);
        }

        let mut bytes = vec![0u8; len as usize];
        cursor.read_exact(&mut bytes)?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| StorageError::Corruption("control description is not UTF-8".to_string()))
    }

    /// Store the description, truncated to the space left on the page.
    pub fn write_description(
        page: &mut [u8],
        header_size: usize,
        description: Option<&str>,
    ) -> StorageResult<()> {
        let offset = header_size + CONTROL_FIXED_SIZE - 4;
        let capacity = page.len().saturating_sub(header_size + CONTROL_FIXED_SIZE);
        let mut cursor = Cursor::new(&mut page[offset..]);

        match description {
            Some(text) => {
                let mut end = text.len().min(capacity);
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                cursor.write_u32::<LittleEndian>(end as u32)?;
                cursor.write_all(&text.as_bytes()[..end])?;
            }
            None => cursor.write_u32::<LittleEndian>(NO_DESCRIPTION)?,
        }
        Ok(())
    }
}
