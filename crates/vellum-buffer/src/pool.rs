//! Buffer pool manager.

use crate::disk::DiskManager;
use crate::frame::{Frame, FrameId};
use crate::guard::{PageGuard, PageReadGuard, PageWriteGuard};
use crate::replacer::{LruKReplacer, Replacer};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use sysinfo::System;
use vellum_common::page::{PageId, PAGE_SIZE};
use vellum_common::{Result, VellumError};

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
    /// K parameter of the LRU-K replacement policy.
    pub replacer_k: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            num_frames: 1024,
            replacer_k: 2,
        }
    }
}

/// Buffer pool manager.
///
/// Manages a fixed-size pool of page frames with:
/// - Page ID to frame ID mapping
/// - Free frame list for new pages
/// - LRU-K replacement for eviction
/// - Pin counting for concurrent access
/// - Monotonic page-id allocation for the backing file
///
/// The pool is the only path between RAM and the index file: misses are
/// read through the disk manager and dirty victims are written back before
/// their frame is reused. All metadata (page table, free list, allocation
/// counter) is protected by one latch; the per-page latches are acquired
/// through guards after that latch is released, so a thread blocked on a
/// page latch never holds up the pool itself.
pub struct BufferPool {
    /// Configuration.
    config: BufferPoolConfig,
    /// Array of buffer frames.
    frames: Vec<Frame>,
    /// Metadata protected by the pool latch.
    inner: Mutex<PoolInner>,
    /// Page replacement policy.
    replacer: LruKReplacer,
    /// Backing file.
    disk: Arc<DiskManager>,
}

struct PoolInner {
    /// Page ID to frame ID mapping.
    page_table: HashMap<PageId, FrameId>,
    /// Frames not holding any page.
    free_list: VecDeque<FrameId>,
    /// Next page id to hand out; never reused after deallocation.
    next_page_id: u32,
}

impl BufferPool {
    /// Creates a new buffer pool over the given disk manager.
    pub fn new(config: BufferPoolConfig, disk: Arc<DiskManager>) -> Self {
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| Frame::new(FrameId(i as u32)))
            .collect();

        // All frames start in the free list
        let free_list: VecDeque<_> = (0..num_frames).map(|i| FrameId(i as u32)).collect();

        let replacer = LruKReplacer::new(config.replacer_k);

        Self {
            config,
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::with_capacity(num_frames),
                free_list,
                next_page_id: 0,
            }),
            replacer,
            disk,
        }
    }

    /// Creates a buffer pool sized to 25% of available system RAM.
    ///
    /// Queries the system for available memory and allocates 25% of it
    /// for the buffer pool. Minimum 1,000 frames to ensure useful caching
    /// even on low-memory systems.
    pub fn auto_sized(disk: Arc<DiskManager>) -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4;
        let num_frames = (target_bytes / PAGE_SIZE).max(1_000);

        Self::new(
            BufferPoolConfig {
                num_frames,
                ..Default::default()
            },
            disk,
        )
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.inner.lock().free_list.len()
    }

    /// Returns the number of pages currently resident in the pool.
    pub fn page_count(&self) -> usize {
        self.inner.lock().page_table.len()
    }

    /// Checks if a page is resident in the buffer pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.inner.lock().page_table.contains_key(&page_id)
    }

    /// Returns the next page id the allocator would hand out.
    pub fn next_page_id(&self) -> u32 {
        self.inner.lock().next_page_id
    }

    /// Restores the allocator counter, e.g. from the allocation log after
    /// reopening an existing file.
    pub fn set_next_page_id(&self, next_page_id: u32) {
        self.inner.lock().next_page_id = next_page_id;
    }

    /// Finds a frame for a new resident page: free list first, else an
    /// eviction victim. A dirty victim is written back before reuse.
    fn find_frame(&self, inner: &mut PoolInner) -> Result<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(victim) = self.replacer.evict() else {
            return Err(VellumError::BufferPoolFull);
        };
        let frame = &self.frames[victim.0 as usize];

        if frame.is_dirty() {
            if let Some(page_id) = frame.page_id() {
                tracing::trace!(%page_id, %victim, "writing back dirty victim");
                if let Err(e) = self.disk.write_page(page_id, &frame.read_data()) {
                    // Put the victim back; the page stays dirty so the next
                    // flush or eviction retries the write.
                    self.replacer.record_access(victim);
                    self.replacer.set_evictable(victim, true);
                    return Err(e);
                }
            }
            frame.set_dirty(false);
        }

        if let Some(old_page_id) = frame.page_id() {
            inner.page_table.remove(&old_page_id);
        }
        Ok(victim)
    }

    /// Installs a page into a frame and pins it. Shared tail of the fetch
    /// and allocation paths; assumes the pool latch is held.
    fn install_frame(&self, inner: &mut PoolInner, frame_id: FrameId, page_id: PageId) {
        let frame = &self.frames[frame_id.0 as usize];
        frame.set_page_id(Some(page_id));
        frame.pin();
        inner.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);
    }

    /// Allocates a new page and returns it write-guarded.
    ///
    /// The frame is zeroed; the caller is responsible for formatting the
    /// page before unpinning it.
    pub fn new_page(&self) -> Result<PageWriteGuard<'_>> {
        let (frame, page_id) = {
            let mut inner = self.inner.lock();
            let frame_id = self.find_frame(&mut inner)?;
            let frame = &self.frames[frame_id.0 as usize];
            frame.reset();
            let page_id = PageId(inner.next_page_id);
            inner.next_page_id += 1;
            self.install_frame(&mut inner, frame_id, page_id);
            (frame, page_id)
        };
        // The pin taken above keeps the frame resident while the page
        // latch is acquired outside the pool latch.
        Ok(PageWriteGuard::new(self, frame, page_id))
    }

    /// Pins the frame holding `page_id`, reading it from disk on a miss.
    fn fetch_frame(&self, page_id: PageId) -> Result<&Frame> {
        let mut inner = self.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            self.replacer.record_access(frame_id);
            self.replacer.set_evictable(frame_id, false);
            return Ok(frame);
        }

        let frame_id = self.find_frame(&mut inner)?;
        let frame = &self.frames[frame_id.0 as usize];
        frame.reset();
        {
            let mut data = frame.write_data();
            if let Err(e) = self.disk.read_page(page_id, &mut data) {
                drop(data);
                frame.reset();
                inner.free_list.push_back(frame_id);
                return Err(e);
            }
        }
        self.install_frame(&mut inner, frame_id, page_id);
        Ok(frame)
    }

    /// Fetches a page with a pin but no latch.
    pub fn fetch_page_basic(&self, page_id: PageId) -> Result<PageGuard<'_>> {
        let frame = self.fetch_frame(page_id)?;
        Ok(PageGuard::new(self, frame, page_id))
    }

    /// Fetches a page with a pin and a shared latch.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<PageReadGuard<'_>> {
        let frame = self.fetch_frame(page_id)?;
        Ok(PageReadGuard::new(self, frame, page_id))
    }

    /// Fetches a page with a pin and the exclusive latch.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<PageWriteGuard<'_>> {
        let frame = self.fetch_frame(page_id)?;
        Ok(PageWriteGuard::new(self, frame, page_id))
    }

    /// Unpins a page, ORing in the caller's dirty flag.
    ///
    /// Returns false if the page is not resident or was not pinned. A
    /// frame whose pin count reaches zero becomes evictable. Guards call
    /// this on drop; it only needs to be called directly by code managing
    /// pins by hand.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let inner = self.inner.lock();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return false;
        };
        let frame = &self.frames[frame_id.0 as usize];
        if frame.pin_count() == 0 {
            return false;
        }
        if is_dirty {
            frame.set_dirty(true);
        }
        if frame.unpin() == 0 {
            self.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Writes a page back to disk if it is dirty and clears the dirty bit.
    ///
    /// Returns true if bytes were written. Pin state is unchanged.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let inner = self.inner.lock();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return Ok(false);
        };
        let frame = &self.frames[frame_id.0 as usize];
        if !frame.is_dirty() {
            return Ok(false);
        }
        self.disk.write_page(page_id, &frame.read_data())?;
        frame.set_dirty(false);
        Ok(true)
    }

    /// Writes all dirty resident pages back to disk.
    ///
    /// Returns the number of pages flushed.
    pub fn flush_all(&self) -> Result<usize> {
        let inner = self.inner.lock();
        let mut flushed = 0;
        for (&page_id, &frame_id) in &inner.page_table {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_dirty() {
                self.disk.write_page(page_id, &frame.read_data())?;
                frame.set_dirty(false);
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Drops a page from the pool and returns its frame to the free list.
    ///
    /// Returns false if the page is pinned; true otherwise (including when
    /// the page was not resident). The page bytes are discarded, not
    /// written back: callers delete pages they have already unlinked.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut inner = self.inner.lock();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return true;
        };
        let frame = &self.frames[frame_id.0 as usize];
        if frame.is_pinned() {
            return false;
        }
        inner.page_table.remove(&page_id);
        self.replacer.remove(frame_id);
        frame.reset();
        inner.free_list.push_back(frame_id);
        true
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let inner = self.inner.lock();
        let mut pinned_frames = 0;
        let mut dirty_frames = 0;
        for &frame_id in inner.page_table.values() {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                pinned_frames += 1;
            }
            if frame.is_dirty() {
                dirty_frames += 1;
            }
        }
        BufferPoolStats {
            total_frames: self.config.num_frames,
            free_frames: inner.free_list.len(),
            used_frames: inner.page_table.len(),
            pinned_frames,
            dirty_frames,
        }
    }

    /// Sum of all pin counts; zero at any quiescent point with no live
    /// guards.
    pub fn total_pin_count(&self) -> u32 {
        self.frames.iter().map(|f| f.pin_count()).sum()
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}
