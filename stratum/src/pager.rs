//! Durable page storage.
//!
//! [`PageStore`] is the capability the buffer pool needs from a table's
//! storage: page I/O plus the slot-level tuple mutations of its page format.
//! [`HeapFile`] stores a table as one file of fixed-size pages, each holding
//! fixed-width tuples behind a slot-occupancy bitmap.
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Result, StratumError};
use crate::page::{Page, PageId, RecordId, TableId, Tuple};

pub trait PageStore: Send + Sync {
    fn table_id(&self) -> TableId;

    fn page_size(&self) -> usize;

    /// Width in bytes of every tuple stored in this table.
    fn tuple_size(&self) -> usize;

    fn num_pages(&self) -> u32;

    fn read_page(&self, page_id: PageId) -> Result<Page>;

    fn write_page(&self, page: &Page) -> Result<()>;

    /// Durably appends an empty page and returns its id.
    fn allocate_page(&self) -> Result<PageId>;

    /// Stores `tuple` in a free slot of `page`. Returns `None` if the page is
    /// full.
    fn insert_into(&self, page: &mut Page, tuple: &[u8]) -> Result<Option<u16>>;

    fn delete_from(&self, page: &mut Page, slot: u16) -> Result<()>;

    fn free_slots(&self, page: &Page) -> Result<usize>;

    /// Live tuples on `page`, in slot order.
    fn tuples(&self, page: &Page) -> Result<Vec<Tuple>>;
}

/// Slot layout of a heap page: an occupancy bitmap header followed by
/// `slots` fixed-width tuple slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapLayout {
    page_size: usize,
    tuple_size: usize,
    slots: usize,
}

impl HeapLayout {
    pub fn new(page_size: usize, tuple_size: usize) -> Result<Self> {
        if tuple_size == 0 {
            return Err(StratumError::InvalidConfig(
                "tuple size must be positive".to_string(),
            ));
        }
        // Each tuple costs its bytes plus one header bit.
        let slots = (page_size * 8) / (tuple_size * 8 + 1);
        if slots == 0 {
            return Err(StratumError::InvalidConfig(format!(
                "a {tuple_size}-byte tuple does not fit in a {page_size}-byte page"
            )));
        }
        let slots = slots.min(u16::MAX as usize);
        Ok(Self {
            page_size,
            tuple_size,
            slots,
        })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    fn header_len(&self) -> usize {
        self.slots.div_ceil(8)
    }

    fn slot_range(&self, slot: usize) -> std::ops::Range<usize> {
        let start = self.header_len() + slot * self.tuple_size;
        start..start + self.tuple_size
    }

    pub fn is_used(&self, data: &[u8], slot: usize) -> bool {
        slot < self.slots && data[slot / 8] & (1 << (slot % 8)) != 0
    }

    fn set_used(&self, data: &mut [u8], slot: usize, used: bool) {
        if used {
            data[slot / 8] |= 1 << (slot % 8);
        } else {
            data[slot / 8] &= !(1 << (slot % 8));
        }
    }

    pub fn free_slots(&self, data: &[u8]) -> usize {
        (0..self.slots).filter(|&slot| !self.is_used(data, slot)).count()
    }
}

struct FileState {
    file: File,
    num_pages: u32,
}

/// A table stored as a single file of pages.
pub struct HeapFile {
    table_id: TableId,
    path: PathBuf,
    layout: HeapLayout,
    state: Mutex<FileState>,
}

impl HeapFile {
    /// Opens the table file, creating it and its parent directories if they
    /// don't exist.
    pub fn open<P: AsRef<Path>>(
        path: P,
        table_id: TableId,
        page_size: usize,
        tuple_size: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let layout = HeapLayout::new(page_size, tuple_size)?;
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / page_size as u64) as u32;
        debug!(table_id, path = ?path, num_pages, "opened heap file");

        Ok(Self {
            table_id,
            path,
            layout,
            state: Mutex::new(FileState { file, num_pages }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> HeapLayout {
        self.layout
    }

    fn check_page(&self, page: &Page) -> Result<()> {
        if page.len() != self.layout.page_size {
            return Err(StratumError::PageSizeMismatch {
                expected: self.layout.page_size,
                actual: page.len(),
            });
        }
        Ok(())
    }
}

impl PageStore for HeapFile {
    fn table_id(&self) -> TableId {
        self.table_id
    }

    fn page_size(&self) -> usize {
        self.layout.page_size
    }

    fn tuple_size(&self) -> usize {
        self.layout.tuple_size
    }

    fn num_pages(&self) -> u32 {
        self.state.lock().num_pages
    }

    fn read_page(&self, page_id: PageId) -> Result<Page> {
        let mut state = self.state.lock();
        if page_id.table_id != self.table_id || page_id.page_no >= state.num_pages {
            return Err(StratumError::PageOutOfRange {
                page_id,
                num_pages: state.num_pages,
            });
        }
        let mut buf = vec![0; self.layout.page_size];
        let offset = page_id.page_no as u64 * self.layout.page_size as u64;
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.read_exact(&mut buf)?;
        trace!(%page_id, "read page");
        Ok(Page::from_bytes(page_id, &buf))
    }

    fn write_page(&self, page: &Page) -> Result<()> {
        self.check_page(page)?;
        let page_id = page.id();
        let mut state = self.state.lock();
        if page_id.table_id != self.table_id || page_id.page_no > state.num_pages {
            return Err(StratumError::PageOutOfRange {
                page_id,
                num_pages: state.num_pages,
            });
        }
        let offset = page_id.page_no as u64 * self.layout.page_size as u64;
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(page.data())?;
        state.file.sync_data()?;
        if page_id.page_no == state.num_pages {
            state.num_pages += 1;
        }
        trace!(%page_id, "wrote page");
        Ok(())
    }

    fn allocate_page(&self) -> Result<PageId> {
        let mut state = self.state.lock();
        let page_id = PageId::new(self.table_id, state.num_pages);
        let offset = page_id.page_no as u64 * self.layout.page_size as u64;
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(&vec![0; self.layout.page_size])?;
        state.file.sync_data()?;
        state.num_pages += 1;
        debug!(%page_id, "allocated page");
        Ok(page_id)
    }

    fn insert_into(&self, page: &mut Page, tuple: &[u8]) -> Result<Option<u16>> {
        self.check_page(page)?;
        if tuple.len() != self.layout.tuple_size {
            return Err(StratumError::TupleSizeMismatch {
                expected: self.layout.tuple_size,
                actual: tuple.len(),
            });
        }
        let layout = self.layout;
        let data = page.data_mut();
        let Some(slot) = (0..layout.slots).find(|&slot| !layout.is_used(data, slot)) else {
            return Ok(None);
        };
        layout.set_used(data, slot, true);
        data[layout.slot_range(slot)].copy_from_slice(tuple);
        Ok(Some(slot as u16))
    }

    fn delete_from(&self, page: &mut Page, slot: u16) -> Result<()> {
        self.check_page(page)?;
        let layout = self.layout;
        let record_id = RecordId::new(page.id(), slot);
        let data = page.data_mut();
        if !layout.is_used(data, slot as usize) {
            return Err(StratumError::TupleNotFound(record_id));
        }
        layout.set_used(data, slot as usize, false);
        data[layout.slot_range(slot as usize)].fill(0);
        Ok(())
    }

    fn free_slots(&self, page: &Page) -> Result<usize> {
        self.check_page(page)?;
        Ok(self.layout.free_slots(page.data()))
    }

    fn tuples(&self, page: &Page) -> Result<Vec<Tuple>> {
        self.check_page(page)?;
        let layout = self.layout;
        let data = page.data();
        Ok((0..layout.slots)
            .filter(|&slot| layout.is_used(data, slot))
            .map(|slot| {
                Tuple::new(&data[layout.slot_range(slot)])
                    .with_record_id(RecordId::new(page.id(), slot as u16))
            })
            .collect())
    }
}
