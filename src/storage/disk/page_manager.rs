use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageHeader, PageId, PAGE_HEADER_SIZE};
use crate::storage::provider::PageStorage;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Signature at the start of a page file.
pub const FILE_SIGNATURE: u64 = 0x656c_6946_6174_6144;
/// Bytes before page 0 in the file.
pub const FILE_HEADER_SIZE: u64 = 64;

pub const MIN_PAGE_SIZE: usize = 256;
pub const MAX_PAGE_SIZE: usize = 32768;
pub const DEFAULT_PAGE_SIZE: usize = 4096;

fn is_valid_page_size(page_size: usize) -> bool {
    (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) && page_size % MIN_PAGE_SIZE == 0
}

/// Single-file page store.
///
/// Layout: a 64-byte file header (signature, 128-bit uid, page size, page
/// count) followed by fixed-size pages.
pub struct PageManager {
    file: File,
    page_size: usize,
    page_count: u32,
    uid: (u64, u64),
    closed: bool,
}

impl PageManager {
    pub fn create(path: &Path, page_size: usize) -> StorageResult<Self> {
        if !is_valid_page_size(page_size) {
            return Err(StorageError::InvalidArgument(format!(
                "page size {} must be a multiple of {} between {} and {}",
                page_size, MIN_PAGE_SIZE, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let mut manager = Self {
            file,
            page_size,
            page_count: 0,
            uid: (rand::random(), rand::random()),
            closed: false,
        };
        manager.write_file_header()?;
        info!("Created page file {:?} with {} byte pages", path, page_size);

        Ok(manager)
    }

    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = [0u8; FILE_HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;

        let signature = LittleEndian::read_u64(&header[0..]);
        if signature != FILE_SIGNATURE {
            return Err(StorageError::InvalidSignature {
                what: "page file",
                expected: FILE_SIGNATURE,
                found: signature,
            });
        }

        let uid = (
            LittleEndian::read_u64(&header[8..]),
            LittleEndian::read_u64(&header[16..]),
        );
        let page_size = LittleEndian::read_u32(&header[24..]) as usize;
        let page_count = LittleEndian::read_u32(&header[28..]);
        if !is_valid_page_size(page_size) {
            return Err(StorageError::Corruption(format!(
                "page file records invalid page size {}",
                page_size
            )));
        }

        info!(
            "Opened page file {:?}: {} pages of {} bytes",
            path, page_count, page_size
        );

        Ok(Self {
            file,
            page_size,
            page_count,
            uid,
            closed: false,
        })
    }

    fn write_file_header(&mut self) -> StorageResult<()> {
        let mut header = [0u8; FILE_HEADER_SIZE as usize];
        LittleEndian::write_u64(&mut header[0..], FILE_SIGNATURE);
        LittleEndian::write_u64(&mut header[8..], self.uid.0);
        LittleEndian::write_u64(&mut header[16..], self.uid.1);
        LittleEndian::write_u32(&mut header[24..], self.page_size as u32);
        LittleEndian::write_u32(&mut header[28..], self.page_count);

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        Ok(())
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn check_buffer(&self, len: usize) -> StorageResult<()> {
        if len != self.page_size {
            return Err(StorageError::InvalidArgument(format!(
                "buffer size must be the page size ({}), got {}",
                self.page_size, len
            )));
        }
        Ok(())
    }

    fn check_page(&self, page_id: PageId) -> StorageResult<()> {
        if page_id.0 >= self.page_count {
            return Err(StorageError::InvalidArgument(format!(
                "page {} does not exist ({} pages)",
                page_id, self.page_count
            )));
        }
        Ok(())
    }

    fn page_offset(&self, page_id: PageId) -> u64 {
        FILE_HEADER_SIZE + page_id.0 as u64 * self.page_size as u64
    }
}

impl PageStorage for PageManager {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_header_size(&self) -> usize {
        PAGE_HEADER_SIZE
    }

    fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> StorageResult<()> {
        self.check_open()?;
        self.check_buffer(buf.len())?;
        self.check_page(page_id)?;

        let offset = self.page_offset(page_id);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;

        let (found, _) = PageHeader::read_physical(buf)?;
        if found != page_id {
            return Err(StorageError::PageMismatch {
                expected: page_id,
                found,
            });
        }

        Ok(())
    }

    fn write_page(&mut self, page_id: PageId, buf: &[u8]) -> StorageResult<()> {
        self.check_open()?;
        self.check_buffer(buf.len())?;
        self.check_page(page_id)?;

        let (found, _) = PageHeader::read_physical(buf)?;
        if found != page_id {
            return Err(StorageError::PageMismatch {
                expected: page_id,
                found,
            });
        }

        let offset = self.page_offset(page_id);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;

        Ok(())
    }

    fn new_page(&mut self) -> StorageResult<PageId> {
        self.check_open()?;
        if self.page_count == u32::MAX - 1 {
            return Err(StorageError::Exhausted("page numbers".to_string()));
        }

        let page_id = PageId(self.page_count);
        self.page_count += 1;

        let new_size = self.page_offset(PageId(self.page_count));
        self.file.set_len(new_size)?;
        self.write_file_header()?;
        debug!("Allocated page {}", page_id);

        Ok(page_id)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.check_open()?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn close(&mut self) -> StorageResult<()> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        debug!("Closed page file {}", self.uid());
        Ok(())
    }

    fn uid(&self) -> String {
        format!("{:016x}{:016x}", self.uid.0, self.uid.1)
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 512;

    fn page_image(pm: &PageManager, page_id: PageId, fill: u8) -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        pm.initialize(page_id, &mut buf);
        buf[PAGE_HEADER_SIZE..].fill(fill);
        buf
    }

    #[test]
    fn test_create_and_open() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        let uid = {
            let pm = PageManager::create(&file_path, PAGE_SIZE)?;
            assert_eq!(pm.page_count(), 0);
            pm.uid()
        };

        {
            let pm = PageManager::open(&file_path)?;
            assert_eq!(pm.page_count(), 0);
            assert_eq!(pm.page_size(), PAGE_SIZE);
            assert_eq!(pm.uid(), uid);
        }

        Ok(())
    }

    #[test]
    fn test_write_and_read_page() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let mut pm = PageManager::create(&file_path, PAGE_SIZE)?;

        let page_id = pm.new_page()?;
        let mut write_buf = page_image(&pm, page_id, 0);
        write_buf[PAGE_HEADER_SIZE] = 42;
        write_buf[PAGE_SIZE - 1] = 24;
        pm.write_page(page_id, &write_buf)?;

        let mut read_buf = vec![0u8; PAGE_SIZE];
        pm.read_page(page_id, &mut read_buf)?;

        assert_eq!(read_buf[PAGE_HEADER_SIZE], 42);
        assert_eq!(read_buf[PAGE_SIZE - 1], 24);

        Ok(())
    }

    #[test]
    fn test_multiple_pages() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let mut pm = PageManager::create(&file_path, PAGE_SIZE)?;

        for i in 0..5 {
            let page_id = pm.new_page()?;
            assert_eq!(page_id, PageId(i));
            let buf = page_image(&pm, page_id, i as u8);
            pm.write_page(page_id, &buf)?;
        }

        assert_eq!(pm.page_count(), 5);

        for i in 0..5 {
            let mut buf = vec![0u8; PAGE_SIZE];
            pm.read_page(PageId(i), &mut buf)?;
            assert!(buf[PAGE_HEADER_SIZE..].iter().all(|&b| b == i as u8));
        }

        Ok(())
    }

    #[test]
    fn test_read_nonexistent_page() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let mut pm = PageManager::create(&file_path, PAGE_SIZE)?;

        let mut buf = vec![0u8; PAGE_SIZE];
        let result = pm.read_page(PageId(10), &mut buf);
        assert!(matches!(result, Err(StorageError::InvalidArgument(_))));

        Ok(())
    }

    #[test]
    fn test_unwritten_page_is_corrupt() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let mut pm = PageManager::create(&file_path, PAGE_SIZE)?;

        let page_id = pm.new_page()?;
        let mut buf = vec![0u8; PAGE_SIZE];
        let err = pm.read_page(page_id, &mut buf).unwrap_err();
        assert!(err.is_corruption());

        Ok(())
    }

    #[test]
    fn test_page_number_mismatch() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let mut pm = PageManager::create(&file_path, PAGE_SIZE)?;

        pm.new_page()?;
        let second = pm.new_page()?;
        let buf = page_image(&pm, PageId(0), 1);

        let err = pm.write_page(second, &buf).unwrap_err();
        assert!(matches!(
            err,
            StorageError::PageMismatch {
                expected: PageId(1),
                found: PageId(0)
            }
        ));

        Ok(())
    }

    #[test]
    fn test_invalid_buffer_size() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let mut pm = PageManager::create(&file_path, PAGE_SIZE)?;
        pm.new_page()?;

        let mut small_buf = vec![0u8; 100];
        assert!(pm.read_page(PageId(0), &mut small_buf).is_err());

        let small_data = vec![0u8; 100];
        assert!(pm.write_page(PageId(0), &small_data).is_err());

        Ok(())
    }

    #[test]
    fn test_invalid_page_size() -> Result<()> {
        let dir = tempdir()?;

        for size in [128, 300, 65536] {
            let file_path = dir.path().join(format!("test_{}.db", size));
            let result = PageManager::create(&file_path, size);
            assert!(matches!(result, Err(StorageError::InvalidArgument(_))));
        }

        Ok(())
    }

    #[test]
    fn test_open_rejects_odd_page_size() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        PageManager::create(&file_path, PAGE_SIZE)?.close()?;

        let mut bytes = std::fs::read(&file_path)?;
        LittleEndian::write_u32(&mut bytes[24..], 300);
        std::fs::write(&file_path, &bytes)?;

        let result = PageManager::open(&file_path);
        assert!(matches!(result, Err(StorageError::Corruption(_))));
        Ok(())
    }

    #[test]
    fn test_open_nonexistent_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("nonexistent.db");

        let result = PageManager::open(&file_path);
        assert!(result.is_err());

        Ok(())
    }

    #[test]
    fn test_open_foreign_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("foreign.db");
        std::fs::write(&file_path, vec![7u8; 128])?;

        let result = PageManager::open(&file_path);
        assert!(matches!(result, Err(StorageError::InvalidSignature { .. })));

        Ok(())
    }

    #[test]
    fn test_persistence() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        {
            let mut pm = PageManager::create(&file_path, PAGE_SIZE)?;
            let page_id = pm.new_page()?;
            let buf = page_image(&pm, page_id, 99);
            pm.write_page(page_id, &buf)?;
            pm.close()?;
        }

        {
            let mut pm = PageManager::open(&file_path)?;
            assert_eq!(pm.page_count(), 1);
            let mut buf = vec![0u8; PAGE_SIZE];
            pm.read_page(PageId(0), &mut buf)?;
            assert_eq!(buf[PAGE_HEADER_SIZE], 99);
        }

        Ok(())
    }

    #[test]
    fn test_close_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let mut pm = PageManager::create(&file_path, PAGE_SIZE)?;

        pm.close()?;
        pm.close()?;
        assert!(matches!(pm.new_page(), Err(StorageError::Closed)));

        Ok(())
    }
}
