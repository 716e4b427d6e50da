//! Page identifiers and sizing for Vellum storage.

use serde::{Deserialize, Serialize};

/// Page size in bytes (4 KB).
pub const PAGE_SIZE: usize = 4096;

/// Unique identifier for a page within the index file.
///
/// Page 0 is reserved for the header page; data pages are allocated
/// monotonically from there. Deallocated ids are not reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// Sentinel for "no page".
    pub const INVALID: PageId = PageId(u32::MAX);

    /// Page id of the index header page.
    pub const HEADER: PageId = PageId(0);

    /// Returns true if this is a valid page id.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Byte offset of this page within the index file.
    pub fn file_offset(&self) -> u64 {
        self.0 as u64 * PAGE_SIZE as u64
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_constant() {
        assert_eq!(PAGE_SIZE, 4096);
    }

    #[test]
    fn test_page_id_validity() {
        assert!(PageId(0).is_valid());
        assert!(PageId(12345).is_valid());
        assert!(!PageId::INVALID.is_valid());
    }

    #[test]
    fn test_page_id_header_is_page_zero() {
        assert_eq!(PageId::HEADER, PageId(0));
        assert_eq!(PageId::HEADER.file_offset(), 0);
    }

    #[test]
    fn test_page_id_file_offset() {
        assert_eq!(PageId(1).file_offset(), PAGE_SIZE as u64);
        assert_eq!(PageId(10).file_offset(), 10 * PAGE_SIZE as u64);
    }

    #[test]
    fn test_page_id_display() {
        assert_eq!(PageId(5).to_string(), "5");
    }

    #[test]
    fn test_page_id_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(PageId(1));
        set.insert(PageId(2));
        set.insert(PageId(1));

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_page_id_serde_roundtrip() {
        let original = PageId(500);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: PageId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }
}
