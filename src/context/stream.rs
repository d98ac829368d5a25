//! Object streams stored as doubly linked page chains.
//!
//! The first page of a chain identifies the object and stays locked for the
//! whole read or write, so continuation pages are only ever touched by the
//! holder of the first page.

use super::ObjectContext;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageHeader, PageId, PageReadGuard, PageWriteGuard};
use crate::storage::provider::PageProvider;
use bytes::BytesMut;
use log::trace;

pub const FIRST_PAGE_SIGNATURE: u64 = 0x3065_6761_506a_624f;
pub const NEXT_PAGE_SIGNATURE: u64 = 0x3165_6761_506a_624f;

fn expect_signature(page_id: PageId, header: &PageHeader, expected: u64) -> StorageResult<()> {
    if header.data[0] != expected {
        trace!("Page {} is not an object stream page", page_id);
        return Err(StorageError::InvalidSignature {
            what: "object stream page",
            expected,
            found: header.data[0],
        });
    }
    Ok(())
}

/// Writes an object stream, reusing the pages of an existing chain.
pub struct ChainWriter<'a> {
    context: &'a ObjectContext,
    provider: &'a dyn PageProvider,
    first: Option<PageWriteGuard<'a>>,
    start: Option<PageId>,
    last_page: Option<PageId>,
    /// Old chain pages not reused yet.
    leftover: Option<PageId>,
    pending: BytesMut,
    payload_size: usize,
    header_size: usize,
    pages_written: u64,
}

impl<'a> ChainWriter<'a> {
    /// `existing` is the first page of the chain being replaced, if any.
    pub fn new(context: &'a ObjectContext, existing: Option<PageId>) -> Self {
        let provider = context.provider();
        let header_size = provider.page_header_size();
        let payload_size = provider.page_size() - header_size;
        Self {
            context,
            provider,
            first: None,
            start: None,
            last_page: None,
            leftover: existing,
            pending: BytesMut::with_capacity(payload_size * 2),
            payload_size,
            header_size,
            pages_written: 0,
        }
    }

    pub fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        self.pending.extend_from_slice(data);
        while self.pending.len() > self.payload_size {
            let chunk = self.pending.split_to(self.payload_size);
            self.write_page(&chunk)?;
        }
        Ok(())
    }

    /// Write the tail, release the chain and free unused old pages.
    /// Returns the first page and the number of pages written.
    pub fn finish(mut self) -> StorageResult<(PageId, u64)> {
        if self.pages_written == 0 || !self.pending.is_empty() {
            let chunk = self.pending.split();
            self.write_page(&chunk)?;
        }

        let start = self
            .start
            .ok_or_else(|| StorageError::Corruption("object stream has no first page".to_string()))?;
        drop(self.first.take());

        while let Some(page_id) = self.leftover {
            let prior = self.context.free_chain_page(page_id, NEXT_PAGE_SIGNATURE)?;
            self.leftover = prior.next_page;
        }

        Ok((start, self.pages_written))
    }

    fn write_page(&mut self, payload: &[u8]) -> StorageResult<()> {
        let signature = if self.pages_written == 0 {
            FIRST_PAGE_SIGNATURE
        } else {
            NEXT_PAGE_SIGNATURE
        };

        let mut page = match self.leftover {
            Some(page_id) => {
                let page = self.provider.write_lock(page_id)?;
                let header = page.header()?;
                expect_signature(page_id, &header, signature)?;
                self.leftover = header.next_page;
                page
            }
            None => {
                let page_id = self.context.allocate_page()?;
                self.provider.write_lock(page_id)?
            }
        };
        let page_id = page.page_id();

        page.set_header(&PageHeader {
            prev_page: self.last_page,
            next_page: None,
            data: [signature, payload.len() as u64, 0, 0],
        });
        let body = &mut page[self.header_size..];
        body[..payload.len()].copy_from_slice(payload);
        body[payload.len()..].fill(0);

        if let Some(prev) = self.last_page {
            self.link(prev, page_id)?;
        }

        if self.pages_written == 0 {
            self.start = Some(page_id);
            self.first = Some(page);
        }
        self.last_page = Some(page_id);
        self.pages_written += 1;
        Ok(())
    }

    fn link(&mut self, prev: PageId, next: PageId) -> StorageResult<()> {
        match self.first.as_mut() {
            Some(first) if first.page_id() == prev => {
                let mut header = first.header()?;
                header.next_page = Some(next);
                first.set_header(&header);
            }
            _ => {
                let mut page = self.provider.write_lock(prev)?;
                let mut header = page.header()?;
                header.next_page = Some(next);
                page.set_header(&header);
            }
        }
        Ok(())
    }
}

/// Reads an object stream, holding its first page read-locked.
pub struct ChainReader<'a> {
    provider: &'a dyn PageProvider,
    start: PageId,
    first: Option<PageReadGuard<'a>>,
    next_page: Option<PageId>,
    page: Vec<u8>,
    position: usize,
    header_size: usize,
    pages_read: u64,
}

impl<'a> ChainReader<'a> {
    pub fn new(provider: &'a dyn PageProvider, start: PageId) -> Self {
        Self {
            provider,
            start,
            first: None,
            next_page: None,
            page: Vec::new(),
            position: 0,
            header_size: provider.page_header_size(),
            pages_read: 0,
        }
    }

    pub fn pages_read(&self) -> u64 {
        self.pages_read
    }

    /// Fill `out` completely. Running off the end of the chain is corruption.
    pub fn read_exact(&mut self, out: &mut [u8]) -> StorageResult<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.pages_read == 0 || self.position == self.page.len() {
                self.load_next()?;
            }
            let n = (out.len() - filled).min(self.page.len() - self.position);
            out[filled..filled + n].copy_from_slice(&self.page[self.position..self.position + n]);
            filled += n;
            self.position += n;
        }
        Ok(())
    }

    /// Read `len` bytes, growing the buffer page by page.
    pub fn read_vec(&mut self, len: usize) -> StorageResult<Vec<u8>> {
        let mut out = Vec::new();
        let step = self.provider.page_size();
        while out.len() < len {
            let start = out.len();
            let n = (len - start).min(step);
            out.resize(start + n, 0);
            self.read_exact(&mut out[start..])?;
        }
        Ok(out)
    }

    fn load_next(&mut self) -> StorageResult<()> {
        if self.pages_read == 0 {
            let page = self.provider.read_lock(self.start)?;
            let header = page.header()?;
            expect_signature(self.start, &header, FIRST_PAGE_SIGNATURE)?;
            self.fill(&page, &header);
            self.next_page = header.next_page;
            self.first = Some(page);
        } else {
            let page_id = self.next_page.ok_or_else(|| {
                StorageError::Corruption(format!(
                    "object stream at page {} ends after {} pages",
                    self.start, self.pages_read
                ))
            })?;
            let page = self.provider.read_lock(page_id)?;
            let header = page.header()?;
            expect_signature(page_id, &header, NEXT_PAGE_SIGNATURE)?;
            self.fill(&page, &header);
            self.next_page = header.next_page;
        }
        self.pages_read += 1;
        Ok(())
    }

    fn fill(&mut self, page: &[u8], header: &PageHeader) {
        let body = &page[self.header_size..];
        let used = (header.data[1] as usize).min(body.len());
        self.page.clear();
        self.page.extend_from_slice(&body[..used]);
        self.position = 0;
    }
}
