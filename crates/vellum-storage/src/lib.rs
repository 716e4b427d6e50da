//! Paged B+ tree index for Vellum.
//!
//! This crate provides:
//! - Fixed-size key/value codecs and key comparators
//! - On-page layouts for header, internal, and leaf pages
//! - A concurrent B+ tree driven by latch crabbing over buffer-pool guards
//! - A forward iterator over the leaf chain
//! - A durable index wrapper that formats and recovers the backing file

pub mod index;
pub mod iter;
pub mod key;
pub mod page;
pub mod tree;

pub use index::BPlusTreeIndex;
pub use iter::TreeIter;
pub use key::{
    GenericComparator, GenericKey, IndexKey, IndexValue, KeyComparator, OrdComparator, Rid,
};
pub use page::PageKind;
pub use tree::{bootstrap_index, BPlusTree};
