use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{FrameId, GraniteError, PageId, Result, INVALID_PAGE_ID};
use crate::storage::disk::{DiskManager, DiskScheduler};

use super::{BasicPageGuard, Frame, LruKReplacer, ReadPageGuard, WritePageGuard};

/// Which page a frame holds, how many guards pin it, and whether its image
/// differs from disk. Frames themselves carry none of this; it is pool
/// metadata and is only ever touched under the pool mutex.
struct FrameState {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

impl FrameState {
    fn new() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Pool metadata behind the single pool mutex.
struct PoolInner {
    /// Page table: maps page IDs to frame IDs
    page_table: HashMap<PageId, FrameId>,
    /// Free list: frames that are not currently in use
    free_list: VecDeque<FrameId>,
    /// Per-frame identity, pin count, and dirty bit; indexed by frame id
    frame_states: Vec<FrameState>,
}

/// State shared between the pool and the guard release callbacks.
struct BufferPoolState {
    /// The buffer pool frames: the latched page buffers
    frames: Vec<Arc<Frame>>,
    /// Pool metadata; one mutex covers the page table, free list, and
    /// every frame's state
    inner: Mutex<PoolInner>,
    /// LRU-K replacer for eviction decisions
    replacer: LruKReplacer,
}

impl BufferPoolState {
    /// Decrements a page's pin count; on the transition to zero the frame
    /// becomes evictable. Or-ing in the dirty flag is sticky. Returns false
    /// for unknown pages or pin counts already at zero.
    fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut inner = self.inner.lock();
        let frame_id = match inner.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return false,
        };

        let state = &mut inner.frame_states[frame_id.as_usize()];
        if is_dirty {
            state.is_dirty = true;
        }
        if state.pin_count == 0 {
            return false;
        }
        state.pin_count -= 1;
        if state.pin_count == 0 {
            self.replacer.set_evictable(frame_id, true);
        }
        true
    }
}

/// BufferPoolManager caches disk pages in a fixed set of in-memory frames.
/// Frames are handed out through RAII page guards that couple the pin count
/// with the page's read/write latch; eviction follows the LRU-K policy.
pub struct BufferPoolManager {
    /// Number of frames in the buffer pool
    pool_size: usize,
    /// Shared state
    state: Arc<BufferPoolState>,
    /// Disk scheduler for I/O
    disk_scheduler: DiskScheduler,
}

impl BufferPoolManager {
    /// Creates a new BufferPoolManager with the given pool size, k value for
    /// LRU-K, and disk manager.
    pub fn new(pool_size: usize, k: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut frame_states = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::new();

        for i in 0..pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(Frame::new(frame_id)));
            frame_states.push(FrameState::new());
            free_list.push_back(frame_id);
        }

        let state = Arc::new(BufferPoolState {
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::new(),
                free_list,
                frame_states,
            }),
            replacer: LruKReplacer::new(k, pool_size),
        });

        Self {
            pool_size,
            state,
            disk_scheduler: DiskScheduler::new(disk_manager),
        }
    }

    /// Allocates a fresh page and returns it pinned behind a write guard.
    /// The frame is zeroed, pinned to 1, and marked non-evictable.
    pub fn new_page(&self) -> Result<(PageId, WritePageGuard)> {
        let mut inner = self.state.inner.lock();
        let frame_id = self.acquire_frame(&mut inner)?;
        let page_id = self.disk_scheduler.disk_manager().allocate_page()?;

        self.state.frames[frame_id.as_usize()].zero();
        let state = &mut inner.frame_states[frame_id.as_usize()];
        state.page_id = page_id;
        state.pin_count = 1;
        state.is_dirty = false;

        inner.page_table.insert(page_id, frame_id);
        self.state.replacer.record_access(frame_id);
        self.state.replacer.set_evictable(frame_id, false);
        drop(inner);

        let guard = self.make_write_guard(page_id, frame_id);
        Ok((page_id, guard))
    }

    /// Fetches a page for read access.
    pub fn checked_read_page(&self, page_id: PageId) -> Result<Option<ReadPageGuard>> {
        if page_id == INVALID_PAGE_ID {
            return Err(GraniteError::InvalidPageId(page_id));
        }

        let frame_id = self.fetch_page(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        let state = Arc::clone(&self.state);

        let guard = unsafe {
            ReadPageGuard::new(
                page_id,
                frame,
                Box::new(move |pid, is_dirty| {
                    state.unpin_page(pid, is_dirty);
                }),
            )
        };

        Ok(Some(guard))
    }

    /// Fetches a page for write access.
    pub fn checked_write_page(&self, page_id: PageId) -> Result<Option<WritePageGuard>> {
        if page_id == INVALID_PAGE_ID {
            return Err(GraniteError::InvalidPageId(page_id));
        }

        let frame_id = self.fetch_page(page_id)?;
        let guard = self.make_write_guard(page_id, frame_id);

        Ok(Some(guard))
    }

    /// Fetches a page behind a basic guard: pinned, but unlatched.
    pub fn checked_basic_page(&self, page_id: PageId) -> Result<Option<BasicPageGuard>> {
        if page_id == INVALID_PAGE_ID {
            return Err(GraniteError::InvalidPageId(page_id));
        }

        let frame_id = self.fetch_page(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        let state = Arc::clone(&self.state);

        let guard = BasicPageGuard::new(
            page_id,
            frame,
            Box::new(move |pid, is_dirty| {
                state.unpin_page(pid, is_dirty);
            }),
        );

        Ok(Some(guard))
    }

    /// Decrements a page's pin count, or-ing in the dirty flag.
    /// Guards call this on release; executors unpinning manually must pass
    /// an accurate dirty flag and pair every pin with exactly one unpin.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.state.unpin_page(page_id, is_dirty)
    }

    /// Writes the page's buffer to disk unconditionally and clears dirty.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if page_id == INVALID_PAGE_ID {
            return Err(GraniteError::InvalidPageId(page_id));
        }

        let mut inner = self.state.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let image = self.state.frames[frame_id.as_usize()].snapshot();
            self.disk_scheduler.write_page_sync(page_id, image)?;
            inner.frame_states[frame_id.as_usize()].is_dirty = false;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Flushes all dirty pages in the buffer pool to disk.
    pub fn flush_all_pages(&self) -> Result<()> {
        let mut inner = self.state.inner.lock();

        let dirty_pages: Vec<(PageId, FrameId)> = inner
            .page_table
            .iter()
            .filter(|(_, &frame_id)| inner.frame_states[frame_id.as_usize()].is_dirty)
            .map(|(&page_id, &frame_id)| (page_id, frame_id))
            .collect();

        for (page_id, frame_id) in dirty_pages {
            let image = self.state.frames[frame_id.as_usize()].snapshot();
            self.disk_scheduler.write_page_sync(page_id, image)?;
            inner.frame_states[frame_id.as_usize()].is_dirty = false;
        }

        Ok(())
    }

    /// Deletes a page from the buffer pool and deallocates it on disk.
    /// Unknown pages succeed trivially; pinned pages fail.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut inner = self.state.inner.lock();

        let frame_id = match inner.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(true),
        };

        if inner.frame_states[frame_id.as_usize()].pin_count > 0 {
            return Err(GraniteError::PageStillPinned(page_id));
        }

        inner.page_table.remove(&page_id);
        inner.frame_states[frame_id.as_usize()].reset();
        self.state.frames[frame_id.as_usize()].zero();
        self.state.replacer.remove(frame_id);
        inner.free_list.push_back(frame_id);

        self.disk_scheduler.disk_manager().deallocate_page(page_id)?;

        Ok(true)
    }

    /// Returns the pin count for a page, or None if it is not resident.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let inner = self.state.inner.lock();

        inner
            .page_table
            .get(&page_id)
            .map(|&frame_id| inner.frame_states[frame_id.as_usize()].pin_count)
    }

    /// Returns the pool size.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the number of free frames.
    pub fn free_frame_count(&self) -> usize {
        self.state.inner.lock().free_list.len()
    }

    fn make_write_guard(&self, page_id: PageId, frame_id: FrameId) -> WritePageGuard {
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        let state = Arc::clone(&self.state);

        unsafe {
            WritePageGuard::new(
                page_id,
                frame,
                Box::new(move |pid, is_dirty| {
                    state.unpin_page(pid, is_dirty);
                }),
            )
        }
    }

    /// Pins the page into a frame and returns the frame ID, reading it from
    /// disk if it is not resident. The whole operation runs under the pool
    /// mutex so a page can never be mapped into two frames.
    fn fetch_page(&self, page_id: PageId) -> Result<FrameId> {
        let mut inner = self.state.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            inner.frame_states[frame_id.as_usize()].pin_count += 1;
            self.state.replacer.record_access(frame_id);
            self.state.replacer.set_evictable(frame_id, false);
            return Ok(frame_id);
        }

        let frame_id = self.acquire_frame(&mut inner)?;

        let image = self.disk_scheduler.read_page_sync(page_id)?;
        self.state.frames[frame_id.as_usize()].fill(&image[..]);

        let state = &mut inner.frame_states[frame_id.as_usize()];
        state.page_id = page_id;
        state.pin_count = 1;
        state.is_dirty = false;

        inner.page_table.insert(page_id, frame_id);
        self.state.replacer.record_access(frame_id);
        self.state.replacer.set_evictable(frame_id, false);

        Ok(frame_id)
    }

    /// Takes a frame from the free list, or evicts one. A dirty victim's
    /// image is queued for writing; the scheduler's ordering guarantees a
    /// later fetch of the victim page reads the written image.
    /// Called with the pool mutex held.
    fn acquire_frame(&self, inner: &mut PoolInner) -> Result<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = match self.state.replacer.evict() {
            Some(frame_id) => frame_id,
            None => return Err(GraniteError::BufferPoolFull),
        };

        let old_page_id = inner.frame_states[frame_id.as_usize()].page_id;
        tracing::trace!(victim = %old_page_id, frame = %frame_id, "evicting page");

        if inner.frame_states[frame_id.as_usize()].is_dirty {
            let image = self.state.frames[frame_id.as_usize()].snapshot();
            self.disk_scheduler.schedule_write(old_page_id, image)?;
        }

        inner.page_table.remove(&old_page_id);
        inner.frame_states[frame_id.as_usize()].reset();

        Ok(frame_id)
    }
}
