use std::time::Duration;

/// Size of a page in bytes (4 KB)
pub const PAGE_SIZE: usize = 4096;

/// Invalid page ID constant
pub const INVALID_PAGE_ID: PageId = PageId(u32::MAX);

/// Invalid frame ID constant
pub const INVALID_FRAME_ID: FrameId = FrameId(u32::MAX);

/// Invalid transaction ID constant
pub const INVALID_TXN_ID: TxnId = TxnId(u32::MAX);

/// Default K value for LRU-K replacement policy
pub const DEFAULT_LRUK_K: usize = 2;

/// Default buffer pool size (number of frames)
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 10;

/// Default maximum number of entries in a B+tree leaf page
pub const DEFAULT_LEAF_MAX_SIZE: usize = 128;

/// Default maximum number of entries in a B+tree internal page
pub const DEFAULT_INTERNAL_MAX_SIZE: usize = 128;

/// How often the lock manager's background thread scans for deadlocks
pub const CYCLE_DETECTION_INTERVAL: Duration = Duration::from_millis(50);

use super::types::{FrameId, PageId, TxnId};
