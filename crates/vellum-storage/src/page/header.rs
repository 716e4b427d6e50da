//! Header page layout.
//!
//! The header page is the durable anchor of the index: its only mutable
//! field is the root page id, and the root is reached exclusively through
//! it. The root pointer is updated only while holding the header page's
//! write latch.

use super::{page_kind, write_u32, PageKind, KIND_OFFSET};
use vellum_common::page::PageId;

const ROOT_OFFSET: usize = 4;

/// Read view of a header page.
pub struct HeaderRef<'a> {
    data: &'a [u8],
}

impl<'a> HeaderRef<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        debug_assert_eq!(page_kind(data), PageKind::Header);
        Self { data }
    }

    /// The current root page id; `PageId::INVALID` means the tree is empty.
    pub fn root_page_id(&self) -> PageId {
        PageId(super::read_u32(self.data, ROOT_OFFSET))
    }
}

/// Write view of a header page.
pub struct HeaderMut<'a> {
    data: &'a mut [u8],
}

impl<'a> HeaderMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    /// Formats a fresh header page with no root.
    pub fn init(&mut self) {
        write_u32(self.data, KIND_OFFSET, PageKind::Header as u32);
        write_u32(self.data, ROOT_OFFSET, PageId::INVALID.0);
    }

    pub fn root_page_id(&self) -> PageId {
        PageId(super::read_u32(self.data, ROOT_OFFSET))
    }

    pub fn set_root_page_id(&mut self, root: PageId) {
        write_u32(self.data, ROOT_OFFSET, root.0);
    }
}
