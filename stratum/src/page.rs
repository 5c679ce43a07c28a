//! Identities and the in-memory representation of a page.
use std::fmt;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Identifier of a table, assigned by its page store.
pub type TableId = u32;

/// Identity of a transaction, unique for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// Identity of a page: the owning table plus the page number within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId {
    pub table_id: TableId,
    pub page_no: u32,
}

impl PageId {
    pub const fn new(table_id: TableId, page_no: u32) -> Self {
        Self { table_id, page_no }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table_id, self.page_no)
    }
}

/// Location of a stored tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot: u16,
}

impl RecordId {
    pub const fn new(page_id: PageId, slot: u16) -> Self {
        Self { page_id, slot }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.page_id, self.slot)
    }
}

/// A fixed-width row. Carries its [`RecordId`] once it has been stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    data: Vec<u8>,
    record_id: Option<RecordId>,
}

impl Tuple {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            record_id: None,
        }
    }

    pub fn with_record_id(mut self, record_id: RecordId) -> Self {
        self.record_id = Some(record_id);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.record_id
    }
}

/// In-memory copy of one on-disk page.
///
/// Besides the raw bytes a page remembers which transaction last modified it
/// (its dirty marker) and its content as of the last load or flush (the
/// before-image).
#[derive(Debug, Clone)]
pub struct Page {
    id: PageId,
    data: BytesMut,
    dirtied_by: Option<TransactionId>,
    before_image: Bytes,
}

impl Page {
    /// A zero-filled page of `page_size` bytes.
    pub fn new(id: PageId, page_size: usize) -> Self {
        Self::from_bytes(id, &vec![0; page_size])
    }

    /// A clean page holding a copy of `bytes`; the before-image starts out
    /// equal to the content.
    pub fn from_bytes(id: PageId, bytes: &[u8]) -> Self {
        Self {
            id,
            data: BytesMut::from(bytes),
            dirtied_by: None,
            before_image: Bytes::copy_from_slice(bytes),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The transaction that last modified this page, or `None` if clean.
    pub fn dirtied_by(&self) -> Option<TransactionId> {
        self.dirtied_by
    }

    pub fn is_dirty(&self) -> bool {
        self.dirtied_by.is_some()
    }

    pub fn mark_dirty(&mut self, tx_id: TransactionId) {
        self.dirtied_by = Some(tx_id);
    }

    pub fn mark_clean(&mut self) {
        self.dirtied_by = None;
    }

    pub fn before_image(&self) -> &[u8] {
        &self.before_image
    }

    /// Records the current content as the new before-image.
    pub fn set_before_image(&mut self) {
        self.before_image = Bytes::copy_from_slice(&self.data);
    }

    /// Whether the content differs from the before-image.
    pub fn is_modified(&self) -> bool {
        self.data[..] != self.before_image[..]
    }
}
