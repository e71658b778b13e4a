//! Page-aligned write buffering.
//!
//! Loaders program whole pages only. [`PageBuffer`] turns a stream of
//! arbitrarily addressed records into full pages:
//!
//! - records are split at page boundaries first, so a record may span any
//!   number of pages;
//! - consecutive chunks on the same page are merged into one buffer, and a
//!   chunk on a different page flushes the current one;
//! - unwritten bytes are filled with the fill value (`0x00` by default);
//! - pages that end up all `0xFF` are never emitted, the preceding chip erase
//!   already left them in that state.

use crate::error::{Error, Result};
use crate::image::srec::FlashRecord;
use log::trace;

/// Page size of both supported loaders.
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Value of an erased flash byte.
pub const ERASED: u8 = 0xFF;

/// A full, page-aligned write unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Address of the first byte; a multiple of the page size.
    pub base_address: u32,
    /// Exactly one page of data.
    pub bytes: Vec<u8>,
}

impl Page {
    /// Whether every byte is in the erased state.
    pub fn is_erased(&self) -> bool {
        self.bytes.iter().all(|&b| b == ERASED)
    }
}

/// Accumulates records into pages.
#[derive(Debug)]
pub struct PageBuffer {
    page_size: usize,
    fill: u8,
    current: Option<Page>,
    elided: usize,
}

impl PageBuffer {
    /// Create a buffer for `page_size`-byte pages.
    ///
    /// The page size must be a power of two no larger than 64 KiB.
    pub fn new(page_size: usize) -> Result<Self> {
        if !page_size.is_power_of_two() || page_size > 0x1_0000 {
            return Err(Error::Config(format!(
                "page size must be a power of two up to 64 KiB, got {page_size}"
            )));
        }
        Ok(Self {
            page_size,
            fill: 0x00,
            current: None,
            elided: 0,
        })
    }

    /// Use `fill` for bytes no record covers.
    #[must_use]
    pub fn with_fill(mut self, fill: u8) -> Self {
        self.fill = fill;
        self
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of all-erased pages dropped so far.
    pub fn elided(&self) -> usize {
        self.elided
    }

    /// Feed one record; returns the pages it completed.
    #[allow(clippy::cast_possible_truncation)]
    pub fn push(&mut self, record: &FlashRecord) -> Vec<Page> {
        let mut out = Vec::new();
        let (page_len, fill) = (self.page_size, self.fill);
        let page_size = page_len as u64;
        let mut addr = u64::from(record.address());
        let mut data = record.data();

        while !data.is_empty() {
            let offset = (addr % page_size) as usize;
            let base = (addr - offset as u64) as u32;
            let take = data.len().min(page_len - offset);

            if self.current.as_ref().is_some_and(|p| p.base_address != base) {
                out.extend(self.flush());
            }
            let page = self.current.get_or_insert_with(|| Page {
                base_address: base,
                bytes: vec![fill; page_len],
            });
            page.bytes[offset..offset + take].copy_from_slice(&data[..take]);

            data = &data[take..];
            addr += take as u64;
        }

        out
    }

    /// Flush the page in progress, if any.
    pub fn finish(&mut self) -> Option<Page> {
        self.flush()
    }

    fn flush(&mut self) -> Option<Page> {
        let page = self.current.take()?;
        if page.is_erased() {
            trace!("Eliding erased page 0x{:08X}", page.base_address);
            self.elided += 1;
            None
        } else {
            Some(page)
        }
    }
}

/// Result of paginating a whole image.
#[derive(Debug, Clone, Default)]
pub struct Paginated {
    /// Pages to program, in record order.
    pub pages: Vec<Page>,
    /// All-erased pages that were dropped.
    pub elided: usize,
}

/// Run every record through a fresh [`PageBuffer`].
pub fn paginate<'a, I>(records: I, page_size: usize) -> Result<Paginated>
where
    I: IntoIterator<Item = &'a FlashRecord>,
{
    let mut buffer = PageBuffer::new(page_size)?;
    let mut pages = Vec::new();
    for record in records {
        pages.extend(buffer.push(record));
    }
    pages.extend(buffer.finish());
    Ok(Paginated {
        pages,
        elided: buffer.elided(),
    })
}
