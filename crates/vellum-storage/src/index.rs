//! Durable index wrapper.
//!
//! [`BPlusTreeIndex`] owns the disk manager, buffer pool, and tree for one
//! index file. Opening a fresh file formats the header page; reopening an
//! existing file restores the page allocator from the allocation log, so
//! new pages never collide with pages written by a previous run. Flushing
//! writes all dirty pages plus the allocation log; dropping the index does
//! a best-effort flush.

use crate::iter::TreeIter;
use crate::key::{IndexKey, IndexValue, KeyComparator};
use crate::page::{internal_default_max_size, leaf_default_max_size};
use crate::tree::{bootstrap_index, BPlusTree};
use std::path::Path;
use std::sync::Arc;
use vellum_buffer::{BufferPool, BufferPoolConfig, DiskManager};
use vellum_common::page::PageId;
use vellum_common::{Result, StorageConfig};

/// A B+ tree index bound to a file on disk.
pub struct BPlusTreeIndex<K, V, C> {
    tree: BPlusTree<K, V, C>,
    bpm: Arc<BufferPool>,
    disk: Arc<DiskManager>,
}

impl<K, V, C> BPlusTreeIndex<K, V, C>
where
    K: IndexKey,
    V: IndexValue,
    C: KeyComparator<K>,
{
    /// Opens (or creates) an index file with default page fanout.
    pub fn open(path: impl AsRef<Path>, config: StorageConfig, comparator: C) -> Result<Self> {
        Self::open_with_fanout(
            path,
            config,
            comparator,
            leaf_default_max_size::<K, V>(),
            internal_default_max_size::<K>(),
        )
    }

    /// Opens (or creates) an index file with explicit page fanout; small
    /// fanouts force deep trees and are mainly useful in tests.
    pub fn open_with_fanout(
        path: impl AsRef<Path>,
        config: StorageConfig,
        comparator: C,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        let disk = Arc::new(DiskManager::open(path, config.fsync_enabled)?);
        let bpm = Arc::new(BufferPool::new(
            BufferPoolConfig {
                num_frames: config.buffer_pool_frames,
                replacer_k: config.replacer_k,
            },
            disk.clone(),
        ));

        if disk.was_initialized() {
            let next_page_id = disk.read_log()?.unwrap_or(1);
            bpm.set_next_page_id(next_page_id);
            tracing::info!(next_page_id, "recovered index allocation state");
        } else {
            bootstrap_index(&bpm)?;
            tracing::info!("formatted fresh index file");
        }

        let tree = BPlusTree::new(bpm.clone(), comparator, leaf_max_size, internal_max_size);
        Ok(Self { tree, bpm, disk })
    }

    /// The underlying tree, for operations not mirrored on the wrapper.
    pub fn tree(&self) -> &BPlusTree<K, V, C> {
        &self.tree
    }

    /// Inserts a key/value pair. Returns false iff the key already exists.
    pub fn insert(&self, key: &K, value: &V) -> Result<bool> {
        self.tree.insert(key, value)
    }

    /// Removes a key. Returns false iff the key is absent.
    pub fn remove(&self, key: &K) -> Result<bool> {
        self.tree.remove(key)
    }

    /// Returns every value matching `key` under the tree's comparator.
    pub fn get_value(&self, key: &K) -> Result<Vec<V>> {
        self.tree.get_value(key)
    }

    /// Iterator over all entries in key order.
    pub fn iter(&self) -> Result<TreeIter<'_, K, V>> {
        self.tree.iter()
    }

    /// Iterator over entries with keys `>= key`.
    pub fn iter_from(&self, key: &K) -> Result<TreeIter<'_, K, V>> {
        self.tree.iter_from(key)
    }

    /// Current root page id (observational).
    pub fn root_page_id(&self) -> Result<PageId> {
        self.tree.root_page_id()
    }

    /// Writes all dirty pages and the allocation log to disk.
    pub fn flush(&self) -> Result<()> {
        self.bpm.flush_all()?;
        self.disk.write_log(self.bpm.next_page_id())?;
        self.disk.sync()?;
        Ok(())
    }
}

impl<K, V, C> Drop for BPlusTreeIndex<K, V, C> {
    fn drop(&mut self) {
        if let Err(e) = self.bpm.flush_all() {
            tracing::warn!(error = %e, "flush on close failed");
            return;
        }
        if let Err(e) = self.disk.write_log(self.bpm.next_page_id()) {
            tracing::warn!(error = %e, "allocation log write on close failed");
        }
    }
}
