//! Concurrent B+ tree over the buffer pool.
//!
//! All durable state lives in pages fetched through the buffer pool; the
//! tree itself is a thin object holding the comparator and fanout limits.
//! Concurrency follows latch crabbing over page guards:
//!
//! - Lookups descend with read guards, releasing the parent as soon as the
//!   child latch is held.
//! - Mutations first try an optimistic pass that write-latches only the
//!   target leaf (holding the parent's read latch across the upgrade), and
//!   fall back to a pessimistic pass holding a write set of ancestors from
//!   the root down. An ancestor set is released early as soon as the
//!   current page is known to absorb any split or merge below it.
//! - The header page guard is retained for exactly as long as the root
//!   might change; the root pointer is only ever written under it.
//!
//! Structural mutations allocate and initialize new pages before linking
//! them, so an allocation failure aborts the operation without leaving
//! dangling references in the tree.

use crate::iter::TreeIter;
use crate::key::{IndexKey, IndexValue, KeyComparator};
use crate::page::{
    page_kind, HeaderMut, HeaderRef, InternalMut, InternalRef, LeafMut, LeafRef, PageKind,
};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use vellum_buffer::{BufferPool, PageReadGuard, PageWriteGuard};
use vellum_common::page::PageId;
use vellum_common::{Result, VellumError};

/// Formats the index header page on a fresh pool.
///
/// Must be the first allocation against the pool: the header is always
/// page 0.
pub fn bootstrap_index(bpm: &BufferPool) -> Result<PageId> {
    let mut guard = bpm.new_page()?;
    if guard.page_id() != PageId::HEADER {
        return Err(VellumError::Internal(format!(
            "header page must be page 0, allocator returned {}",
            guard.page_id()
        )));
    }
    HeaderMut::new(guard.data_mut().as_mut_slice()).init();
    Ok(guard.page_id())
}

/// In-flight ancestor chain of a mutating descent.
///
/// `write_set` holds guards from the shallowest retained ancestor down to
/// the page currently being worked on. Releasing "all ancestors" truncates
/// from the front; the header guard sits in its own slot because dropping
/// it is what allows other operations to move the root.
struct Context<'a> {
    header: Option<PageWriteGuard<'a>>,
    root_page_id: PageId,
    write_set: VecDeque<PageWriteGuard<'a>>,
}

impl<'a> Context<'a> {
    fn new() -> Self {
        Self {
            header: None,
            root_page_id: PageId::INVALID,
            write_set: VecDeque::new(),
        }
    }

    /// Drops every guard above the current page, plus the header guard.
    fn release_ancestors(&mut self) {
        let keep_from = self.write_set.len().saturating_sub(1);
        self.write_set.drain(..keep_from);
        self.header = None;
    }

    /// Drops every held guard, including the current page and header.
    fn release_all(&mut self) {
        self.write_set.clear();
        self.header = None;
    }
}

/// Outcome of one level of the pessimistic removal descent.
struct RemoveOutcome<K> {
    /// Whether the key was found and removed.
    removed: bool,
    /// The leaf's new minimum, captured iff slot 0 was removed; consumed
    /// by ancestors whose separator equals the removed key.
    new_min: Option<K>,
    /// Whether some level below released the remaining ancestor guards.
    released: bool,
}

/// Concurrent, unique-key B+ tree index.
pub struct BPlusTree<K, V, C> {
    bpm: Arc<BufferPool>,
    comparator: C,
    leaf_max_size: usize,
    internal_max_size: usize,
    header_page_id: PageId,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, C> BPlusTree<K, V, C>
where
    K: IndexKey,
    V: IndexValue,
    C: KeyComparator<K>,
{
    /// Creates a tree over an already-bootstrapped pool.
    ///
    /// `leaf_max_size` and `internal_max_size` bound the entry and child
    /// counts per page; tests use small values to force deep trees.
    pub fn new(
        bpm: Arc<BufferPool>,
        comparator: C,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Self {
        assert!(leaf_max_size >= 2, "leaf fanout too small");
        assert!(internal_max_size >= 3, "internal fanout too small");
        Self {
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
            header_page_id: PageId::HEADER,
            _marker: PhantomData,
        }
    }

    /// The comparator this tree orders by.
    pub fn comparator(&self) -> &C {
        &self.comparator
    }

    /// Current root page id; `PageId::INVALID` means the tree is empty.
    pub fn root_page_id(&self) -> Result<PageId> {
        let guard = self.bpm.fetch_page_read(self.header_page_id)?;
        Ok(HeaderRef::new(guard.data().as_slice()).root_page_id())
    }

    /// True if the tree holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        let Some(guard) = self.root_guard_read()? else {
            return Ok(true);
        };
        match page_kind(guard.data().as_slice()) {
            PageKind::Leaf => Ok(LeafRef::<K, V>::new(guard.data().as_slice()).size() == 0),
            _ => Ok(false),
        }
    }

    fn corrupted(&self, page_id: PageId, reason: &str) -> VellumError {
        VellumError::PageCorrupted {
            page_id,
            reason: reason.to_string(),
        }
    }

    /// Allocates and formats a new index page of the given kind.
    fn new_tree_page(&self, kind: PageKind) -> Result<PageWriteGuard<'_>> {
        let mut guard = self.bpm.new_page()?;
        match kind {
            PageKind::Leaf => {
                LeafMut::<K, V>::new(guard.data_mut().as_mut_slice()).init(self.leaf_max_size)
            }
            PageKind::Internal => {
                InternalMut::<K>::new(guard.data_mut().as_mut_slice()).init(self.internal_max_size)
            }
            _ => {
                return Err(VellumError::Internal(
                    "only leaf and internal pages are allocated by the tree".to_string(),
                ))
            }
        }
        Ok(guard)
    }

    /// Read guard on the root, taken under the header's read latch.
    fn root_guard_read(&self) -> Result<Option<PageReadGuard<'_>>> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_id = HeaderRef::new(header_guard.data().as_slice()).root_page_id();
        if !root_id.is_valid() {
            return Ok(None);
        }
        let root_guard = self.bpm.fetch_page_read(root_id)?;
        // The header guard drops here, after the root latch is held.
        Ok(Some(root_guard))
    }

    /// Write guard on the root; stores the header guard in `ctx` so the
    /// root pointer stays stable for the rest of the operation.
    fn root_guard_write<'a>(&'a self, ctx: &mut Context<'a>) -> Result<Option<PageWriteGuard<'a>>> {
        let header_guard = self.bpm.fetch_page_write(self.header_page_id)?;
        let root_id = HeaderRef::new(header_guard.data().as_slice()).root_page_id();
        if !root_id.is_valid() {
            return Ok(None);
        }
        let root_guard = self.bpm.fetch_page_write(root_id)?;
        ctx.root_page_id = root_id;
        ctx.header = Some(header_guard);
        Ok(Some(root_guard))
    }

    /// Like [`Self::root_guard_write`], but creates an empty root leaf if
    /// the tree has none.
    fn root_guard_write_or_create<'a>(
        &'a self,
        ctx: &mut Context<'a>,
    ) -> Result<PageWriteGuard<'a>> {
        let mut header_guard = self.bpm.fetch_page_write(self.header_page_id)?;
        let root_id = HeaderRef::new(header_guard.data().as_slice()).root_page_id();
        if root_id.is_valid() {
            let root_guard = self.bpm.fetch_page_write(root_id)?;
            ctx.root_page_id = root_id;
            ctx.header = Some(header_guard);
            return Ok(root_guard);
        }

        let root_guard = self.new_tree_page(PageKind::Leaf)?;
        let root_id = root_guard.page_id();
        HeaderMut::new(header_guard.data_mut().as_mut_slice()).set_root_page_id(root_id);
        ctx.root_page_id = root_id;
        ctx.header = Some(header_guard);
        tracing::debug!(root = %root_id, "created root leaf");
        Ok(root_guard)
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Returns every value whose key equals `key` under the default
    /// comparator. For unique keys this is zero or one value; coarser
    /// comparators (prefix lookups) may match a range.
    pub fn get_value(&self, key: &K) -> Result<Vec<V>> {
        self.get_value_with(key, &self.comparator)
    }

    /// Like [`Self::get_value`] with a caller-supplied comparator.
    pub fn get_value_with(&self, key: &K, cmp: &impl KeyComparator<K>) -> Result<Vec<V>> {
        let mut result = Vec::new();
        let Some(mut guard) = self.root_guard_read()? else {
            return Ok(result);
        };

        // Read crabbing: take the child's latch, then drop the parent's.
        loop {
            match page_kind(guard.data().as_slice()) {
                PageKind::Leaf => break,
                PageKind::Internal => {
                    let child_id = {
                        let page = InternalRef::<K>::new(guard.data().as_slice());
                        page.child_at(page.last_index_lt(key, cmp))
                    };
                    let child_guard = self.bpm.fetch_page_read(child_id)?;
                    guard = child_guard;
                }
                _ => return Err(self.corrupted(guard.page_id(), "expected an index page")),
            }
        }

        // Scan forward from the first candidate, chaining into the next
        // leaf if the matching range runs off the end of this one.
        loop {
            let next_id = {
                let leaf = LeafRef::<K, V>::new(guard.data().as_slice());
                let size = leaf.size();
                let mut index = leaf.first_index_ge(key, cmp);
                while index < size && cmp.compare(&leaf.key_at(index), key) != Ordering::Greater {
                    result.push(leaf.value_at(index));
                    index += 1;
                }
                if index < size || !leaf.next_page_id().is_valid() {
                    break;
                }
                leaf.next_page_id()
            };
            let next_guard = self.bpm.fetch_page_read(next_id)?;
            guard = next_guard;
        }
        Ok(result)
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Inserts a key/value pair. Returns false iff the key already exists.
    pub fn insert(&self, key: &K, value: &V) -> Result<bool> {
        if let Some(done) = self.insert_optimistic(key, value)? {
            return Ok(done);
        }

        let mut ctx = Context::new();
        let root_guard = self.root_guard_write_or_create(&mut ctx)?;
        ctx.write_set.push_back(root_guard);
        let (inserted, released) = self.insert_into_page(key, value, &mut ctx, 0)?;
        if released {
            return Ok(inserted);
        }

        // The split chain reached the root: grow the tree by one level
        // under the retained header guard.
        let root_id = ctx.root_page_id;
        let mut root_guard = self.bpm.fetch_page_write(root_id)?;
        let kind = page_kind(root_guard.data().as_slice());
        let exceeded = match kind {
            PageKind::Leaf => LeafRef::<K, V>::new(root_guard.data().as_slice()).size_exceeded(),
            PageKind::Internal => {
                InternalRef::<K>::new(root_guard.data().as_slice()).size_exceeded()
            }
            _ => return Err(self.corrupted(root_id, "expected an index page at the root")),
        };
        if exceeded {
            let mut new_root_guard = self.new_tree_page(PageKind::Internal)?;
            let new_root_id = new_root_guard.page_id();
            InternalMut::<K>::new(new_root_guard.data_mut().as_mut_slice())
                .seed_first_child(root_id);
            match kind {
                PageKind::Leaf => self.split_leaf(&mut root_guard, &mut new_root_guard)?,
                _ => self.split_internal(&mut root_guard, &mut new_root_guard)?,
            }
            let header = ctx
                .header
                .as_mut()
                .expect("header guard is retained while the root may change");
            HeaderMut::new(header.data_mut().as_mut_slice()).set_root_page_id(new_root_id);
            tracing::debug!(old_root = %root_id, new_root = %new_root_id, "root split");
        }
        Ok(true)
    }

    /// Leaf-only fast path. Descends with read guards, then upgrades the
    /// leaf to a write guard while still holding its parent's read latch,
    /// so the leaf cannot be restructured across the upgrade.
    ///
    /// Returns `None` when the mutation may need structural changes and
    /// the pessimistic pass must run.
    fn insert_optimistic(&self, key: &K, value: &V) -> Result<Option<bool>> {
        let cmp = &self.comparator;
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_id = HeaderRef::new(header_guard.data().as_slice()).root_page_id();
        if !root_id.is_valid() {
            // Empty tree: the pessimistic pass creates the root.
            return Ok(None);
        }

        let mut _parent_guard = header_guard;
        let mut child_id = root_id;
        loop {
            let child_guard = self.bpm.fetch_page_read(child_id)?;
            match page_kind(child_guard.data().as_slice()) {
                PageKind::Internal => {
                    let next_id = {
                        let page = InternalRef::<K>::new(child_guard.data().as_slice());
                        if !page.is_insert_safe() {
                            return Ok(None);
                        }
                        page.child_at(page.last_index_le(key, cmp))
                    };
                    _parent_guard = child_guard;
                    child_id = next_id;
                }
                PageKind::Leaf => {
                    drop(child_guard);
                    let mut leaf_guard = self.bpm.fetch_page_write(child_id)?;
                    let existing = {
                        let leaf = LeafRef::<K, V>::new(leaf_guard.data().as_slice());
                        if leaf.size() == 0
                            || !leaf.is_insert_safe()
                            || cmp.compare(&leaf.key_at(0), key) == Ordering::Greater
                        {
                            // Full, or the key would become the new leaf
                            // minimum and a separator may need updating.
                            return Ok(None);
                        }
                        leaf.index_eq(key, cmp).is_some()
                    };
                    if existing {
                        return Ok(Some(false));
                    }
                    LeafMut::<K, V>::new(leaf_guard.data_mut().as_mut_slice())
                        .insert_data(key, value, cmp);
                    return Ok(Some(true));
                }
                _ => return Err(self.corrupted(child_id, "expected an index page")),
            }
        }
    }

    /// One level of the pessimistic insertion descent. The current page's
    /// guard is at the back of `ctx.write_set`.
    ///
    /// Returns `(inserted, released)`; `released` means every guard in the
    /// context has been dropped and ancestors must not post-process.
    fn insert_into_page<'a>(
        &'a self,
        key: &K,
        value: &V,
        ctx: &mut Context<'a>,
        slot_in_parent: usize,
    ) -> Result<(bool, bool)> {
        let kind = match ctx.write_set.back() {
            Some(guard) => page_kind(guard.data().as_slice()),
            None => return Err(VellumError::Internal("empty write set".to_string())),
        };
        if kind == PageKind::Leaf {
            return self.insert_into_leaf_page(key, value, ctx, slot_in_parent);
        }
        if kind != PageKind::Internal {
            let page_id = ctx.write_set.back().map(|g| g.page_id());
            return Err(self.corrupted(
                page_id.unwrap_or(PageId::INVALID),
                "expected an index page",
            ));
        }

        let (slot, child_id, safe) = {
            let back = ctx.write_set.back().expect("current page guard");
            let page = InternalRef::<K>::new(back.data().as_slice());
            let slot = page.last_index_le(key, &self.comparator);
            (slot, page.child_at(slot), page.is_insert_safe())
        };
        if safe {
            // This page absorbs any split below it; everything above can
            // make progress in the meantime.
            ctx.release_ancestors();
        }

        let child_guard = self.bpm.fetch_page_write(child_id)?;
        ctx.write_set.push_back(child_guard);
        let (inserted, released) = self.insert_into_page(key, value, ctx, slot)?;
        if !inserted {
            return Ok((false, true));
        }
        if released {
            return Ok((true, true));
        }

        // The child split into this page; deal with our own overflow.
        let mut cur_guard = ctx.write_set.pop_back().expect("current page guard");
        let exceeded = InternalRef::<K>::new(cur_guard.data().as_slice()).size_exceeded();
        let mut resolved = true;
        if exceeded {
            if let Some(parent) = ctx.write_set.back_mut() {
                if !self.shift_internal(&mut cur_guard, parent, slot_in_parent)? {
                    self.split_internal(&mut cur_guard, parent)?;
                    resolved = false;
                }
            } else {
                // Root overflow resolves at the top level.
                resolved = false;
            }
        }
        if resolved {
            ctx.release_all();
        }
        Ok((true, resolved))
    }

    fn insert_into_leaf_page<'a>(
        &'a self,
        key: &K,
        value: &V,
        ctx: &mut Context<'a>,
        slot_in_parent: usize,
    ) -> Result<(bool, bool)> {
        let mut cur_guard = ctx.write_set.pop_back().expect("current leaf guard");

        let duplicate = LeafRef::<K, V>::new(cur_guard.data().as_slice())
            .index_eq(key, &self.comparator)
            .is_some();
        if duplicate {
            ctx.release_all();
            return Ok((false, true));
        }
        LeafMut::<K, V>::new(cur_guard.data_mut().as_mut_slice()).insert_data(
            key,
            value,
            &self.comparator,
        );

        let exceeded = LeafRef::<K, V>::new(cur_guard.data().as_slice()).size_exceeded();
        let mut resolved = true;
        if exceeded {
            if let Some(parent) = ctx.write_set.back_mut() {
                if !self.shift_leaf(&mut cur_guard, parent, slot_in_parent)? {
                    self.split_leaf(&mut cur_guard, parent)?;
                    resolved = false;
                }
            } else {
                resolved = false;
            }
        }
        if resolved {
            ctx.release_all();
        }
        Ok((true, resolved))
    }

    /// Moves entries from an overflowing leaf into a sibling whose size
    /// differs by at least two, updating the separator. Prefers the right
    /// sibling. Returns false if neither sibling can absorb the surplus.
    fn shift_leaf(
        &self,
        cur: &mut PageWriteGuard<'_>,
        parent: &mut PageWriteGuard<'_>,
        slot: usize,
    ) -> Result<bool> {
        let (right_id, left_id) = {
            let page = InternalRef::<K>::new(parent.data().as_slice());
            (
                (slot + 1 < page.size()).then(|| page.child_at(slot + 1)),
                (slot > 0).then(|| page.child_at(slot - 1)),
            )
        };

        if let Some(right_id) = right_id {
            let mut right_guard = self.bpm.fetch_page_write(right_id)?;
            let moved = {
                let mut cur_leaf = LeafMut::<K, V>::new(cur.data_mut().as_mut_slice());
                let mut right_leaf = LeafMut::<K, V>::new(right_guard.data_mut().as_mut_slice());
                let diff = cur_leaf.size().saturating_sub(right_leaf.size());
                if diff >= 2 {
                    cur_leaf.copy_last_n_to(diff / 2, &mut right_leaf);
                    true
                } else {
                    false
                }
            };
            if moved {
                let separator = LeafRef::<K, V>::new(right_guard.data().as_slice()).key_at(0);
                InternalMut::<K>::new(parent.data_mut().as_mut_slice())
                    .set_key_at(slot + 1, &separator);
                return Ok(true);
            }
        }

        if let Some(left_id) = left_id {
            let mut left_guard = self.bpm.fetch_page_write(left_id)?;
            let moved = {
                let mut cur_leaf = LeafMut::<K, V>::new(cur.data_mut().as_mut_slice());
                let mut left_leaf = LeafMut::<K, V>::new(left_guard.data_mut().as_mut_slice());
                let diff = cur_leaf.size().saturating_sub(left_leaf.size());
                if diff >= 2 {
                    cur_leaf.copy_first_n_to(diff / 2, &mut left_leaf);
                    true
                } else {
                    false
                }
            };
            if moved {
                let separator = LeafRef::<K, V>::new(cur.data().as_slice()).key_at(0);
                InternalMut::<K>::new(parent.data_mut().as_mut_slice()).set_key_at(slot, &separator);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Internal-page counterpart of [`Self::shift_leaf`]. The parent
    /// separator travels down into the receiving sibling and the
    /// replacement separator comes back up.
    fn shift_internal(
        &self,
        cur: &mut PageWriteGuard<'_>,
        parent: &mut PageWriteGuard<'_>,
        slot: usize,
    ) -> Result<bool> {
        let (right_id, left_id) = {
            let page = InternalRef::<K>::new(parent.data().as_slice());
            (
                (slot + 1 < page.size()).then(|| page.child_at(slot + 1)),
                (slot > 0).then(|| page.child_at(slot - 1)),
            )
        };

        if let Some(right_id) = right_id {
            let separator = InternalRef::<K>::new(parent.data().as_slice()).key_at(slot + 1);
            let mut right_guard = self.bpm.fetch_page_write(right_id)?;
            let new_separator = {
                let mut cur_page = InternalMut::<K>::new(cur.data_mut().as_mut_slice());
                let mut right_page = InternalMut::<K>::new(right_guard.data_mut().as_mut_slice());
                let diff = cur_page.size().saturating_sub(right_page.size());
                (diff >= 2).then(|| cur_page.copy_last_n_to(diff / 2, &mut right_page, &separator))
            };
            if let Some(new_separator) = new_separator {
                InternalMut::<K>::new(parent.data_mut().as_mut_slice())
                    .set_key_at(slot + 1, &new_separator);
                return Ok(true);
            }
        }

        if let Some(left_id) = left_id {
            let separator = InternalRef::<K>::new(parent.data().as_slice()).key_at(slot);
            let mut left_guard = self.bpm.fetch_page_write(left_id)?;
            let new_separator = {
                let mut cur_page = InternalMut::<K>::new(cur.data_mut().as_mut_slice());
                let mut left_page = InternalMut::<K>::new(left_guard.data_mut().as_mut_slice());
                let diff = cur_page.size().saturating_sub(left_page.size());
                (diff >= 2).then(|| cur_page.copy_first_n_to(diff / 2, &mut left_page, &separator))
            };
            if let Some(new_separator) = new_separator {
                InternalMut::<K>::new(parent.data_mut().as_mut_slice())
                    .set_key_at(slot, &new_separator);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Splits an overflowing leaf: allocates a right sibling, moves the
    /// upper half over, threads the leaf chain, and posts the separator
    /// into the parent.
    fn split_leaf(
        &self,
        cur: &mut PageWriteGuard<'_>,
        parent: &mut PageWriteGuard<'_>,
    ) -> Result<()> {
        let mut new_guard = self.new_tree_page(PageKind::Leaf)?;
        let new_id = new_guard.page_id();

        let separator = {
            let mut cur_leaf = LeafMut::<K, V>::new(cur.data_mut().as_mut_slice());
            let mut new_leaf = LeafMut::<K, V>::new(new_guard.data_mut().as_mut_slice());
            cur_leaf.copy_second_half_to(&mut new_leaf);
            new_leaf.set_next_page_id(cur_leaf.next_page_id());
            cur_leaf.set_next_page_id(new_id);
            new_leaf.key_at(0)
        };
        InternalMut::<K>::new(parent.data_mut().as_mut_slice()).insert_data(
            &separator,
            new_id,
            &self.comparator,
        );
        Ok(())
    }

    /// Splits an overflowing internal page, promoting the middle
    /// separator into the parent.
    fn split_internal(
        &self,
        cur: &mut PageWriteGuard<'_>,
        parent: &mut PageWriteGuard<'_>,
    ) -> Result<()> {
        let mut new_guard = self.new_tree_page(PageKind::Internal)?;
        let new_id = new_guard.page_id();

        let separator = {
            let mut cur_page = InternalMut::<K>::new(cur.data_mut().as_mut_slice());
            let mut new_page = InternalMut::<K>::new(new_guard.data_mut().as_mut_slice());
            let separator = cur_page.key_at(cur_page.size() / 2);
            cur_page.copy_second_half_to(&mut new_page);
            separator
        };
        InternalMut::<K>::new(parent.data_mut().as_mut_slice()).insert_data(
            &separator,
            new_id,
            &self.comparator,
        );
        Ok(())
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Removes a key. Returns false iff the key is absent.
    pub fn remove(&self, key: &K) -> Result<bool> {
        if let Some(done) = self.remove_optimistic(key)? {
            return Ok(done);
        }

        let mut ctx = Context::new();
        let Some(root_guard) = self.root_guard_write(&mut ctx)? else {
            return Ok(false);
        };
        ctx.write_set.push_back(root_guard);
        let outcome = self.remove_in_page(key, &mut ctx, 0, false)?;
        if !outcome.removed {
            return Ok(false);
        }

        // Shrink the root if needed, under the retained header guard.
        if ctx.header.is_some() {
            let root_id = ctx.root_page_id;
            let root_guard = self.bpm.fetch_page_write(root_id)?;
            match page_kind(root_guard.data().as_slice()) {
                PageKind::Internal => {
                    let (size, only_child) = {
                        let page = InternalRef::<K>::new(root_guard.data().as_slice());
                        (page.size(), page.child_at(0))
                    };
                    if size == 1 {
                        let header = ctx.header.as_mut().expect("header guard retained");
                        HeaderMut::new(header.data_mut().as_mut_slice())
                            .set_root_page_id(only_child);
                        drop(root_guard);
                        let _ = self.bpm.delete_page(root_id);
                        tracing::debug!(old_root = %root_id, new_root = %only_child, "root collapsed");
                    }
                }
                PageKind::Leaf => {
                    let size = LeafRef::<K, V>::new(root_guard.data().as_slice()).size();
                    if size == 0 {
                        let header = ctx.header.as_mut().expect("header guard retained");
                        HeaderMut::new(header.data_mut().as_mut_slice())
                            .set_root_page_id(PageId::INVALID);
                        drop(root_guard);
                        let _ = self.bpm.delete_page(root_id);
                        tracing::debug!(old_root = %root_id, "tree emptied");
                    }
                }
                _ => {}
            }
        }
        Ok(true)
    }

    /// Leaf-only fast path for removal; mirrors the insert fast path.
    /// Aborts when a separator on the path equals the key (it may need
    /// replacement) or when the leaf could fall below minimum occupancy.
    fn remove_optimistic(&self, key: &K) -> Result<Option<bool>> {
        let cmp = &self.comparator;
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_id = HeaderRef::new(header_guard.data().as_slice()).root_page_id();
        if !root_id.is_valid() {
            return Ok(Some(false));
        }

        let mut _parent_guard = header_guard;
        let mut child_id = root_id;
        let mut at_root = true;
        loop {
            let child_guard = self.bpm.fetch_page_read(child_id)?;
            match page_kind(child_guard.data().as_slice()) {
                PageKind::Internal => {
                    let next_id = {
                        let page = InternalRef::<K>::new(child_guard.data().as_slice());
                        if (at_root && page.size() == 1) || (!at_root && !page.is_remove_safe()) {
                            return Ok(None);
                        }
                        let slot = page.last_index_le(key, cmp);
                        if slot > 0 && cmp.compare(&page.key_at(slot), key) == Ordering::Equal {
                            return Ok(None);
                        }
                        page.child_at(slot)
                    };
                    _parent_guard = child_guard;
                    child_id = next_id;
                    at_root = false;
                }
                PageKind::Leaf => {
                    drop(child_guard);
                    let mut leaf_guard = self.bpm.fetch_page_write(child_id)?;
                    let found = {
                        let leaf = LeafRef::<K, V>::new(leaf_guard.data().as_slice());
                        if !leaf.is_remove_safe()
                            || (leaf.size() > 0
                                && cmp.compare(&leaf.key_at(0), key) == Ordering::Equal)
                        {
                            return Ok(None);
                        }
                        leaf.index_eq(key, cmp)
                    };
                    let Some(index) = found else {
                        return Ok(Some(false));
                    };
                    LeafMut::<K, V>::new(leaf_guard.data_mut().as_mut_slice()).remove_at(index);
                    return Ok(Some(true));
                }
                _ => return Err(self.corrupted(child_id, "expected an index page")),
            }
        }
    }

    /// One level of the pessimistic removal descent. `sep_locked` records
    /// that some ancestor's separator equals the key, which pins the whole
    /// ancestor chain until the replacement key has been written.
    fn remove_in_page<'a>(
        &'a self,
        key: &K,
        ctx: &mut Context<'a>,
        slot_in_parent: usize,
        sep_locked: bool,
    ) -> Result<RemoveOutcome<K>> {
        let kind = match ctx.write_set.back() {
            Some(guard) => page_kind(guard.data().as_slice()),
            None => return Err(VellumError::Internal("empty write set".to_string())),
        };
        if kind == PageKind::Leaf {
            return self.remove_in_leaf_page(key, ctx, slot_in_parent);
        }
        if kind != PageKind::Internal {
            let page_id = ctx.write_set.back().map(|g| g.page_id());
            return Err(self.corrupted(
                page_id.unwrap_or(PageId::INVALID),
                "expected an index page",
            ));
        }

        let is_root = ctx.header.is_some() && ctx.write_set.len() == 1;
        let (slot, child_id, sep_eq, safe) = {
            let back = ctx.write_set.back().expect("current page guard");
            let page = InternalRef::<K>::new(back.data().as_slice());
            let slot = page.last_index_le(key, &self.comparator);
            let sep_eq =
                slot > 0 && self.comparator.compare(&page.key_at(slot), key) == Ordering::Equal;
            // The root shrinks by promotion only once it is down to a
            // single child, so it is safe while three remain.
            let safe = if is_root {
                page.size() >= 3
            } else {
                page.is_remove_safe()
            };
            (slot, page.child_at(slot), sep_eq, safe)
        };

        let locked = sep_locked || sep_eq;
        let mut released_here = false;
        if safe && !locked && (ctx.write_set.len() > 1 || ctx.header.is_some()) {
            // No merge below can underflow this page and no separator
            // above needs rewriting: ancestors can go.
            ctx.release_ancestors();
            released_here = true;
        }

        let child_guard = self.bpm.fetch_page_write(child_id)?;
        ctx.write_set.push_back(child_guard);
        let res = self.remove_in_page(key, ctx, slot, locked)?;
        if res.released {
            return Ok(RemoveOutcome {
                released: true,
                ..res
            });
        }

        let mut cur_guard = ctx.write_set.pop_back().expect("current page guard");
        if res.removed {
            {
                let mut page = InternalMut::<K>::new(cur_guard.data_mut().as_mut_slice());
                // Re-checked rather than reusing `sep_eq`: a merge below
                // may have shifted or dropped the slot.
                if slot > 0
                    && slot < page.size()
                    && self.comparator.compare(&page.key_at(slot), key) == Ordering::Equal
                {
                    if let Some(new_min) = res.new_min.as_ref() {
                        page.set_key_at(slot, new_min);
                    }
                }
            }
            let underflow = InternalRef::<K>::new(cur_guard.data().as_slice()).size_not_enough();
            if underflow {
                if let Some(parent) = ctx.write_set.back_mut() {
                    if !self.replenish_internal(&mut cur_guard, parent, slot_in_parent)? {
                        self.coalesce_internal(cur_guard, parent, slot_in_parent)?;
                        return Ok(RemoveOutcome {
                            released: released_here,
                            ..res
                        });
                    }
                }
            }
        }
        Ok(RemoveOutcome {
            released: released_here,
            ..res
        })
    }

    fn remove_in_leaf_page<'a>(
        &'a self,
        key: &K,
        ctx: &mut Context<'a>,
        slot_in_parent: usize,
    ) -> Result<RemoveOutcome<K>> {
        let mut cur_guard = ctx.write_set.pop_back().expect("current leaf guard");

        let found = LeafRef::<K, V>::new(cur_guard.data().as_slice()).index_eq(key, &self.comparator);
        let Some(index) = found else {
            return Ok(RemoveOutcome {
                removed: false,
                new_min: None,
                released: false,
            });
        };

        let new_min = {
            let mut leaf = LeafMut::<K, V>::new(cur_guard.data_mut().as_mut_slice());
            leaf.remove_at(index);
            // Only a slot-0 removal can change the minimum and therefore
            // a separator upstream.
            (index == 0 && leaf.size() > 0).then(|| leaf.key_at(0))
        };

        let underflow = LeafRef::<K, V>::new(cur_guard.data().as_slice()).size_not_enough();
        if underflow {
            if let Some(parent) = ctx.write_set.back_mut() {
                if !self.replenish_leaf(&mut cur_guard, parent, slot_in_parent)? {
                    self.coalesce_leaf(cur_guard, parent, slot_in_parent)?;
                }
            }
        }
        Ok(RemoveOutcome {
            removed: true,
            new_min,
            released: false,
        })
    }

    /// Borrows entries into an underflowing leaf from a sibling whose
    /// size exceeds it by at least two, updating the separator. Returns
    /// false if neither sibling can spare entries.
    fn replenish_leaf(
        &self,
        cur: &mut PageWriteGuard<'_>,
        parent: &mut PageWriteGuard<'_>,
        slot: usize,
    ) -> Result<bool> {
        let (right_id, left_id) = {
            let page = InternalRef::<K>::new(parent.data().as_slice());
            (
                (slot + 1 < page.size()).then(|| page.child_at(slot + 1)),
                (slot > 0).then(|| page.child_at(slot - 1)),
            )
        };

        if let Some(right_id) = right_id {
            let mut right_guard = self.bpm.fetch_page_write(right_id)?;
            let moved = {
                let mut cur_leaf = LeafMut::<K, V>::new(cur.data_mut().as_mut_slice());
                let mut right_leaf = LeafMut::<K, V>::new(right_guard.data_mut().as_mut_slice());
                let diff = right_leaf.size().saturating_sub(cur_leaf.size());
                if diff >= 2 {
                    right_leaf.copy_first_n_to(diff / 2, &mut cur_leaf);
                    true
                } else {
                    false
                }
            };
            if moved {
                let separator = LeafRef::<K, V>::new(right_guard.data().as_slice()).key_at(0);
                InternalMut::<K>::new(parent.data_mut().as_mut_slice())
                    .set_key_at(slot + 1, &separator);
                return Ok(true);
            }
        }

        if let Some(left_id) = left_id {
            let mut left_guard = self.bpm.fetch_page_write(left_id)?;
            let moved = {
                let mut cur_leaf = LeafMut::<K, V>::new(cur.data_mut().as_mut_slice());
                let mut left_leaf = LeafMut::<K, V>::new(left_guard.data_mut().as_mut_slice());
                let diff = left_leaf.size().saturating_sub(cur_leaf.size());
                if diff >= 2 {
                    left_leaf.copy_last_n_to(diff / 2, &mut cur_leaf);
                    true
                } else {
                    false
                }
            };
            if moved {
                let separator = LeafRef::<K, V>::new(cur.data().as_slice()).key_at(0);
                InternalMut::<K>::new(parent.data_mut().as_mut_slice()).set_key_at(slot, &separator);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Internal-page counterpart of [`Self::replenish_leaf`].
    fn replenish_internal(
        &self,
        cur: &mut PageWriteGuard<'_>,
        parent: &mut PageWriteGuard<'_>,
        slot: usize,
    ) -> Result<bool> {
        let (right_id, left_id) = {
            let page = InternalRef::<K>::new(parent.data().as_slice());
            (
                (slot + 1 < page.size()).then(|| page.child_at(slot + 1)),
                (slot > 0).then(|| page.child_at(slot - 1)),
            )
        };

        if let Some(right_id) = right_id {
            let separator = InternalRef::<K>::new(parent.data().as_slice()).key_at(slot + 1);
            let mut right_guard = self.bpm.fetch_page_write(right_id)?;
            let new_separator = {
                let mut cur_page = InternalMut::<K>::new(cur.data_mut().as_mut_slice());
                let mut right_page = InternalMut::<K>::new(right_guard.data_mut().as_mut_slice());
                let diff = right_page.size().saturating_sub(cur_page.size());
                (diff >= 2).then(|| right_page.copy_first_n_to(diff / 2, &mut cur_page, &separator))
            };
            if let Some(new_separator) = new_separator {
                InternalMut::<K>::new(parent.data_mut().as_mut_slice())
                    .set_key_at(slot + 1, &new_separator);
                return Ok(true);
            }
        }

        if let Some(left_id) = left_id {
            let separator = InternalRef::<K>::new(parent.data().as_slice()).key_at(slot);
            let mut left_guard = self.bpm.fetch_page_write(left_id)?;
            let new_separator = {
                let mut cur_page = InternalMut::<K>::new(cur.data_mut().as_mut_slice());
                let mut left_page = InternalMut::<K>::new(left_guard.data_mut().as_mut_slice());
                let diff = left_page.size().saturating_sub(cur_page.size());
                (diff >= 2).then(|| left_page.copy_last_n_to(diff / 2, &mut cur_page, &separator))
            };
            if let Some(new_separator) = new_separator {
                InternalMut::<K>::new(parent.data_mut().as_mut_slice())
                    .set_key_at(slot, &new_separator);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Merges an underflowing leaf with a sibling, unlinking the emptied
    /// page from the parent and the leaf chain and handing it back to the
    /// buffer pool once its guard has dropped.
    fn coalesce_leaf(
        &self,
        cur_guard: PageWriteGuard<'_>,
        parent: &mut PageWriteGuard<'_>,
        slot: usize,
    ) -> Result<()> {
        let mut cur_guard = cur_guard;
        let (right_id, left_id) = {
            let page = InternalRef::<K>::new(parent.data().as_slice());
            (
                (slot + 1 < page.size()).then(|| page.child_at(slot + 1)),
                (slot > 0).then(|| page.child_at(slot - 1)),
            )
        };

        if let Some(right_id) = right_id {
            let mut right_guard = self.bpm.fetch_page_write(right_id)?;
            let merged = {
                let mut cur_leaf = LeafMut::<K, V>::new(cur_guard.data_mut().as_mut_slice());
                let mut right_leaf = LeafMut::<K, V>::new(right_guard.data_mut().as_mut_slice());
                if right_leaf.size() + cur_leaf.size() <= self.leaf_max_size {
                    let next = right_leaf.next_page_id();
                    right_leaf.merge_into(&mut cur_leaf);
                    cur_leaf.set_next_page_id(next);
                    true
                } else {
                    false
                }
            };
            if merged {
                InternalMut::<K>::new(parent.data_mut().as_mut_slice()).remove_at(slot + 1);
                drop(right_guard);
                self.reclaim_page(right_id);
                return Ok(());
            }
        }

        if let Some(left_id) = left_id {
            let mut left_guard = self.bpm.fetch_page_write(left_id)?;
            let merged = {
                let mut cur_leaf = LeafMut::<K, V>::new(cur_guard.data_mut().as_mut_slice());
                let mut left_leaf = LeafMut::<K, V>::new(left_guard.data_mut().as_mut_slice());
                if left_leaf.size() + cur_leaf.size() <= self.leaf_max_size {
                    let next = cur_leaf.next_page_id();
                    cur_leaf.merge_into(&mut left_leaf);
                    left_leaf.set_next_page_id(next);
                    true
                } else {
                    false
                }
            };
            if merged {
                let cur_id = cur_guard.page_id();
                InternalMut::<K>::new(parent.data_mut().as_mut_slice()).remove_at(slot);
                drop(cur_guard);
                self.reclaim_page(cur_id);
                return Ok(());
            }
        }
        Ok(())
    }

    /// Internal-page counterpart of [`Self::coalesce_leaf`]; the parent
    /// separator of the emptied page travels down into the merge.
    fn coalesce_internal(
        &self,
        cur_guard: PageWriteGuard<'_>,
        parent: &mut PageWriteGuard<'_>,
        slot: usize,
    ) -> Result<()> {
        let mut cur_guard = cur_guard;
        let (right_id, left_id) = {
            let page = InternalRef::<K>::new(parent.data().as_slice());
            (
                (slot + 1 < page.size()).then(|| page.child_at(slot + 1)),
                (slot > 0).then(|| page.child_at(slot - 1)),
            )
        };

        if let Some(right_id) = right_id {
            let mut right_guard = self.bpm.fetch_page_write(right_id)?;
            let fits = {
                let cur_page = InternalRef::<K>::new(cur_guard.data().as_slice());
                let right_page = InternalRef::<K>::new(right_guard.data().as_slice());
                right_page.size() + cur_page.size() <= self.internal_max_size
            };
            if fits {
                let (separator, _) =
                    InternalMut::<K>::new(parent.data_mut().as_mut_slice()).remove_at(slot + 1);
                let mut cur_page = InternalMut::<K>::new(cur_guard.data_mut().as_mut_slice());
                let mut right_page = InternalMut::<K>::new(right_guard.data_mut().as_mut_slice());
                right_page.merge_into(&mut cur_page, &separator);
                drop(right_page);
                drop(right_guard);
                self.reclaim_page(right_id);
                return Ok(());
            }
        }

        if let Some(left_id) = left_id {
            let mut left_guard = self.bpm.fetch_page_write(left_id)?;
            let fits = {
                let cur_page = InternalRef::<K>::new(cur_guard.data().as_slice());
                let left_page = InternalRef::<K>::new(left_guard.data().as_slice());
                left_page.size() + cur_page.size() <= self.internal_max_size
            };
            if fits {
                let (separator, cur_id) =
                    InternalMut::<K>::new(parent.data_mut().as_mut_slice()).remove_at(slot);
                {
                    let mut cur_page = InternalMut::<K>::new(cur_guard.data_mut().as_mut_slice());
                    let mut left_page = InternalMut::<K>::new(left_guard.data_mut().as_mut_slice());
                    cur_page.merge_into(&mut left_page, &separator);
                }
                drop(cur_guard);
                self.reclaim_page(cur_id);
                return Ok(());
            }
        }
        Ok(())
    }

    /// Returns a page unlinked from the tree to the buffer pool's free
    /// list. A concurrent reader may still hold a pin; the frame then
    /// drains through the normal unpin and eviction path instead.
    fn reclaim_page(&self, page_id: PageId) {
        if !self.bpm.delete_page(page_id) {
            tracing::debug!(%page_id, "merged page still pinned; reclaim deferred");
        }
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Iterator positioned at the first entry of the tree.
    pub fn iter(&self) -> Result<TreeIter<'_, K, V>> {
        let Some(mut guard) = self.root_guard_read()? else {
            return Ok(TreeIter::new(&self.bpm, None, 0));
        };
        loop {
            match page_kind(guard.data().as_slice()) {
                PageKind::Leaf => break,
                PageKind::Internal => {
                    let child_id = InternalRef::<K>::new(guard.data().as_slice()).child_at(0);
                    let child_guard = self.bpm.fetch_page_read(child_id)?;
                    guard = child_guard;
                }
                _ => return Err(self.corrupted(guard.page_id(), "expected an index page")),
            }
        }
        Ok(TreeIter::new(&self.bpm, Some(guard), 0))
    }

    /// Iterator positioned at the first entry whose key is `>= key`.
    pub fn iter_from(&self, key: &K) -> Result<TreeIter<'_, K, V>> {
        let cmp = &self.comparator;
        let Some(mut guard) = self.root_guard_read()? else {
            return Ok(TreeIter::new(&self.bpm, None, 0));
        };
        loop {
            match page_kind(guard.data().as_slice()) {
                PageKind::Leaf => break,
                PageKind::Internal => {
                    let child_id = {
                        let page = InternalRef::<K>::new(guard.data().as_slice());
                        page.child_at(page.last_index_le(key, cmp))
                    };
                    let child_guard = self.bpm.fetch_page_read(child_id)?;
                    guard = child_guard;
                }
                _ => return Err(self.corrupted(guard.page_id(), "expected an index page")),
            }
        }
        let index = LeafRef::<K, V>::new(guard.data().as_slice()).first_index_ge(key, cmp);
        Ok(TreeIter::new(&self.bpm, Some(guard), index))
    }

    // =========================================================================
    // Debug
    // =========================================================================

    /// Renders the tree structure level by level; for debugging and tests.
    pub fn debug_structure(&self) -> Result<String> {
        let root_id = self.root_page_id()?;
        if !root_id.is_valid() {
            return Ok("(empty)".to_string());
        }
        let mut out = String::new();
        self.render_page(root_id, 0, &mut out)?;
        Ok(out)
    }

    fn render_page(&self, page_id: PageId, depth: usize, out: &mut String) -> Result<()> {
        use std::fmt::Write;

        let guard = self.bpm.fetch_page_basic(page_id)?;
        let (line, children) = guard.with_data(|data| match page_kind(data.as_slice()) {
            PageKind::Leaf => {
                let leaf = LeafRef::<K, V>::new(data.as_slice());
                let keys: Vec<String> = (0..leaf.size())
                    .map(|i| format!("{:?}", leaf.key_at(i)))
                    .collect();
                (
                    format!(
                        "leaf {} [{}] next={}",
                        page_id,
                        keys.join(","),
                        leaf.next_page_id()
                    ),
                    Vec::new(),
                )
            }
            PageKind::Internal => {
                let page = InternalRef::<K>::new(data.as_slice());
                let keys: Vec<String> = (1..page.size())
                    .map(|i| format!("{:?}", page.key_at(i)))
                    .collect();
                let children: Vec<PageId> = (0..page.size()).map(|i| page.child_at(i)).collect();
                (format!("internal {} [{}]", page_id, keys.join(",")), children)
            }
            _ => (format!("?{page_id}"), Vec::new()),
        });
        let _ = writeln!(out, "{}{}", "  ".repeat(depth), line);
        for child in children {
            self.render_page(child, depth + 1, out)?;
        }
        Ok(())
    }
}
