//! RAII page guards.
//!
//! A guard couples a frame reservation (one pin) with an optionally held
//! page latch. Three variants exist:
//!
//! - [`PageGuard`]: pin only, no latch. For single-threaded callers and
//!   debug dumps; data access is scoped through closures so the latch is
//!   held only transiently.
//! - [`PageReadGuard`]: pin + shared latch, held for the guard's lifetime.
//! - [`PageWriteGuard`]: pin + exclusive latch, held for the guard's
//!   lifetime. Taking a mutable view marks the page dirty.
//!
//! Guards are move-only capability tokens. Dropping a guard releases the
//! latch first and then the pin (declaration order of the fields), which
//! may make the frame evictable again.

use crate::frame::Frame;
use crate::pool::BufferPool;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::cell::Cell;
use vellum_common::page::{PageId, PAGE_SIZE};

/// Holds one pin on a frame; dropping it unpins the page and forwards the
/// accumulated dirty flag to the pool.
pub(crate) struct FramePin<'a> {
    pool: &'a BufferPool,
    frame: &'a Frame,
    page_id: PageId,
    dirty: Cell<bool>,
}

impl<'a> FramePin<'a> {
    pub(crate) fn new(pool: &'a BufferPool, frame: &'a Frame, page_id: PageId) -> Self {
        Self {
            pool,
            frame,
            page_id,
            dirty: Cell::new(false),
        }
    }
}

impl Drop for FramePin<'_> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, self.dirty.get());
    }
}

/// Pin-only guard with no held latch.
pub struct PageGuard<'a> {
    pin: FramePin<'a>,
}

impl<'a> PageGuard<'a> {
    pub(crate) fn new(pool: &'a BufferPool, frame: &'a Frame, page_id: PageId) -> Self {
        Self {
            pin: FramePin::new(pool, frame, page_id),
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    /// Runs `f` with a shared view of the page bytes.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8; PAGE_SIZE]) -> R) -> R {
        f(&self.pin.frame.read_data())
    }

    /// Runs `f` with an exclusive view of the page bytes and marks the
    /// page dirty.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        self.pin.dirty.set(true);
        f(&mut self.pin.frame.write_data())
    }
}

/// Guard holding a pin and a shared page latch.
pub struct PageReadGuard<'a> {
    // Declared before `pin` so the latch releases before the unpin.
    latch: RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>,
    pin: FramePin<'a>,
}

impl<'a> PageReadGuard<'a> {
    pub(crate) fn new(pool: &'a BufferPool, frame: &'a Frame, page_id: PageId) -> Self {
        Self {
            latch: frame.read_data(),
            pin: FramePin::new(pool, frame, page_id),
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    /// Returns the page bytes.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.latch
    }
}

/// Guard holding a pin and the exclusive page latch.
pub struct PageWriteGuard<'a> {
    // Declared before `pin` so the latch releases before the unpin.
    latch: RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>>,
    pin: FramePin<'a>,
}

impl<'a> PageWriteGuard<'a> {
    pub(crate) fn new(pool: &'a BufferPool, frame: &'a Frame, page_id: PageId) -> Self {
        Self {
            latch: frame.write_data(),
            pin: FramePin::new(pool, frame, page_id),
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    /// Returns the page bytes.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.latch
    }

    /// Returns the page bytes mutably and marks the page dirty.
    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.pin.dirty.set(true);
        &mut self.latch
    }
}
