use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::common::{FrameId, PAGE_SIZE};

/// A buffer frame: one page-sized buffer behind the page's reader-writer
/// latch.
///
/// The frame is nothing but the latched bytes that page guards borrow.
/// Which page the frame holds, its pin count, and its dirty bit are pool
/// metadata; they live in the buffer pool under its mutex and are never
/// stored here.
pub struct Frame {
    /// The frame ID (index in the buffer pool)
    frame_id: FrameId,
    /// The page bytes. This RwLock is the per-page latch.
    pub(crate) latch: RwLock<Box<[u8; PAGE_SIZE]>>,
}

impl Frame {
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            latch: RwLock::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Takes the page's read latch.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.latch.read()
    }

    /// Takes the page's write latch.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.latch.write()
    }

    /// Overwrites the frame with the given page image.
    /// The frame must not be latched by the caller.
    pub(crate) fn fill(&self, data: &[u8]) {
        assert_eq!(data.len(), PAGE_SIZE);
        self.latch.write().copy_from_slice(data);
    }

    /// Copies the frame's current page image out.
    pub(crate) fn snapshot(&self) -> Box<[u8; PAGE_SIZE]> {
        Box::new(**self.latch.read())
    }

    /// Zeroes the frame for reuse.
    pub(crate) fn zero(&self) {
        self.latch.write().fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_starts_zeroed() {
        let frame = Frame::new(FrameId::new(3));
        assert_eq!(frame.frame_id(), FrameId::new(3));
        assert!(frame.read().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_frame_fill_snapshot_zero() {
        let frame = Frame::new(FrameId::new(0));

        let mut image = [0u8; PAGE_SIZE];
        image[0] = 42;
        image[PAGE_SIZE - 1] = 7;
        frame.fill(&image);

        let copy = frame.snapshot();
        assert_eq!(copy[0], 42);
        assert_eq!(copy[PAGE_SIZE - 1], 7);

        frame.zero();
        assert!(frame.read().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_frame_latch_exclusion() {
        let frame = Frame::new(FrameId::new(0));

        let read_guard = frame.read();
        // Readers share, writers wait
        assert!(frame.latch.try_read().is_some());
        assert!(frame.latch.try_write().is_none());
        drop(read_guard);

        let write_guard = frame.write();
        assert!(frame.latch.try_read().is_none());
        drop(write_guard);
        assert!(frame.latch.try_write().is_some());
    }
}
