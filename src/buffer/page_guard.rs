use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{PageId, PAGE_SIZE};

use super::Frame;

/// Callback type for releasing a page guard.
/// Receives the page ID and whether the guard dirtied the page.
type ReleaseCallback = Box<dyn FnOnce(PageId, bool) + Send + Sync>;

/// Base page guard that manages the pin and the release callback.
struct PageGuardBase {
    /// The page ID being guarded
    page_id: PageId,
    /// The frame holding the page (kept alive for the guard's lifetime)
    frame: Arc<Frame>,
    /// Callback to release the guard; taken exactly once
    release_callback: Option<ReleaseCallback>,
    /// Whether the page was marked dirty through this guard
    is_dirty: bool,
}

impl PageGuardBase {
    fn new(page_id: PageId, frame: Arc<Frame>, release_callback: ReleaseCallback) -> Self {
        Self {
            page_id,
            frame,
            release_callback: Some(release_callback),
            is_dirty: false,
        }
    }

    fn drop_impl(&mut self) {
        if let Some(callback) = self.release_callback.take() {
            callback(self.page_id, self.is_dirty);
        }
    }
}

/// RAII guard that holds only a pin on a page, without a latch.
/// Data access takes the frame's latch for the duration of the call.
pub struct BasicPageGuard {
    base: PageGuardBase,
}

impl BasicPageGuard {
    pub(crate) fn new(
        page_id: PageId,
        frame: Arc<Frame>,
        release_callback: ReleaseCallback,
    ) -> Self {
        Self {
            base: PageGuardBase::new(page_id, frame, release_callback),
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.base.page_id
    }

    /// Takes a short-lived read latch on the page data.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.base.frame.read()
    }

    /// Drops this guard, releasing the pin.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Drop for BasicPageGuard {
    fn drop(&mut self) {
        self.base.drop_impl();
    }
}

/// RAII guard for read-only access to a page.
/// Holds the pin and the page's read latch; both released on drop.
pub struct ReadPageGuard {
    base: PageGuardBase,
    /// Read lock on the page data
    data_guard: Option<RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>>>,
}

impl ReadPageGuard {
    /// Creates a new ReadPageGuard.
    /// # Safety
    /// The caller must ensure that the frame outlives this guard.
    pub(crate) unsafe fn new(
        page_id: PageId,
        frame: Arc<Frame>,
        release_callback: ReleaseCallback,
    ) -> Self {
        let data_guard = frame.read();
        // Transmute to static lifetime - the frame is kept alive via Arc
        let data_guard: RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>> =
            std::mem::transmute(data_guard);

        Self {
            base: PageGuardBase::new(page_id, frame, release_callback),
            data_guard: Some(data_guard),
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.base.page_id
    }

    /// Returns a reference to the page data.
    pub fn data(&self) -> &[u8] {
        match &self.data_guard {
            Some(guard) => &guard[..],
            None => &[],
        }
    }

    /// Drops this guard, releasing the page.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        // Release the latch before the unpin callback runs
        self.data_guard.take();
        self.base.drop_impl();
    }
}

/// RAII guard for read-write access to a page.
/// Holds the pin and the page's write latch; mutation marks the page dirty.
pub struct WritePageGuard {
    base: PageGuardBase,
    /// Write lock on the page data
    data_guard: Option<RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>>>,
}

impl WritePageGuard {
    /// Creates a new WritePageGuard.
    /// # Safety
    /// The caller must ensure that the frame outlives this guard.
    pub(crate) unsafe fn new(
        page_id: PageId,
        frame: Arc<Frame>,
        release_callback: ReleaseCallback,
    ) -> Self {
        let data_guard = frame.write();
        // Transmute to static lifetime - the frame is kept alive via Arc
        let data_guard: RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>> =
            std::mem::transmute(data_guard);

        Self {
            base: PageGuardBase::new(page_id, frame, release_callback),
            data_guard: Some(data_guard),
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.base.page_id
    }

    /// Returns a reference to the page data.
    pub fn data(&self) -> &[u8] {
        match &self.data_guard {
            Some(guard) => &guard[..],
            None => &[],
        }
    }

    /// Returns a mutable reference to the page data and marks the page dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.base.is_dirty = true;
        match &mut self.data_guard {
            Some(guard) => &mut guard[..],
            None => &mut [],
        }
    }

    /// Drops this guard, releasing the page.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        // Release the latch before the unpin callback runs
        self.data_guard.take();
        self.base.drop_impl();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FrameId;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn frame_with_byte(index: usize, value: u8) -> Arc<Frame> {
        let frame = Arc::new(Frame::new(FrameId::new(0)));
        let mut image = [0u8; PAGE_SIZE];
        image[index] = value;
        frame.fill(&image);
        frame
    }

    #[test]
    fn test_basic_page_guard() {
        let frame = frame_with_byte(7, 7);

        let released = Arc::new(AtomicBool::new(false));
        let released_clone = released.clone();

        let guard = BasicPageGuard::new(
            PageId::new(1),
            frame.clone(),
            Box::new(move |_, _| {
                released_clone.store(true, Ordering::SeqCst);
            }),
        );

        assert_eq!(guard.page_id(), PageId::new(1));
        assert_eq!(guard.read()[7], 7);

        // A basic guard holds no latch, so the write latch stays available
        assert!(frame.latch.try_write().is_some());

        drop(guard);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_read_page_guard() {
        let frame = frame_with_byte(0, 42);

        let released = Arc::new(AtomicBool::new(false));
        let released_clone = released.clone();

        let guard = unsafe {
            ReadPageGuard::new(
                PageId::new(1),
                frame.clone(),
                Box::new(move |_, _| {
                    released_clone.store(true, Ordering::SeqCst);
                }),
            )
        };

        assert_eq!(guard.page_id(), PageId::new(1));
        assert_eq!(guard.data()[0], 42);

        // The read latch is held for the guard's lifetime
        assert!(frame.latch.try_write().is_none());
        assert!(!released.load(Ordering::SeqCst));

        drop(guard);
        assert!(released.load(Ordering::SeqCst));
        assert!(frame.latch.try_write().is_some());
    }

    #[test]
    fn test_write_page_guard() {
        let frame = Arc::new(Frame::new(FrameId::new(0)));

        let released = Arc::new(AtomicBool::new(false));
        let dirty = Arc::new(AtomicBool::new(false));
        let released_clone = released.clone();
        let dirty_clone = dirty.clone();

        let mut guard = unsafe {
            WritePageGuard::new(
                PageId::new(1),
                frame.clone(),
                Box::new(move |_, is_dirty| {
                    released_clone.store(true, Ordering::SeqCst);
                    dirty_clone.store(is_dirty, Ordering::SeqCst);
                }),
            )
        };

        assert_eq!(guard.page_id(), PageId::new(1));

        guard.data_mut()[0] = 42;

        // The write latch excludes readers until release
        assert!(frame.latch.try_read().is_none());
        assert!(!released.load(Ordering::SeqCst));

        drop(guard);
        assert!(released.load(Ordering::SeqCst));
        assert!(dirty.load(Ordering::SeqCst));
        assert_eq!(frame.snapshot()[0], 42);
    }

    #[test]
    fn test_write_page_guard_clean_when_untouched() {
        let frame = Arc::new(Frame::new(FrameId::new(0)));
        let dirty = Arc::new(AtomicBool::new(true));
        let dirty_clone = dirty.clone();

        let guard = unsafe {
            WritePageGuard::new(
                PageId::new(1),
                frame.clone(),
                Box::new(move |_, is_dirty| {
                    dirty_clone.store(is_dirty, Ordering::SeqCst);
                }),
            )
        };
        drop(guard);
        assert!(!dirty.load(Ordering::SeqCst));
    }
}
