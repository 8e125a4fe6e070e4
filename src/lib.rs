//! Granite - the storage and concurrency core of a disk-oriented RDBMS
//!
//! This crate provides the mechanisms every query plan ultimately rides on:
//! a buffer pool caching fixed-size disk pages, RAII page guards coupling
//! pin counts with per-page latches, a concurrent B+tree index, and a
//! hierarchical lock manager with deadlock detection.
//!
//! # Architecture
//!
//! - **Storage Layer** (`storage`): disk I/O
//!   - `DiskManager`: reads and writes pages to/from a database file
//!   - `DiskScheduler`: background-thread disk I/O scheduling
//!
//! - **Buffer Pool** (`buffer`): memory management for database pages
//!   - `BufferPoolManager`: fetches pages from disk and caches them
//!   - `LruKReplacer`: LRU-K page replacement policy
//!   - `Frame`: the page buffer behind the per-page latch
//!   - `BasicPageGuard`/`ReadPageGuard`/`WritePageGuard`: RAII guards
//!     pairing pins with latches
//!
//! - **Index** (`index`): a concurrent B+tree over buffer pool pages, with
//!   latch-crab traversal, eager splits on descent, merge/redistribution on
//!   ascent, and a forward range iterator
//!
//! - **Concurrency** (`concurrency`): hierarchical table/row locking with
//!   the standard multi-granularity modes, lock upgrades, and a background
//!   deadlock detector over the wait-for graph
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use granite::buffer::BufferPoolManager;
//! use granite::index::BPlusTree;
//! use granite::storage::disk::DiskManager;
//! use granite::common::{PageId, RecordId, SlotId};
//!
//! let disk_manager = Arc::new(DiskManager::new("test.db").unwrap());
//! let bpm = Arc::new(BufferPoolManager::new(64, 2, disk_manager));
//!
//! let tree = BPlusTree::new(Arc::clone(&bpm), 64, 64).unwrap();
//! tree.insert(42, RecordId::new(PageId::new(7), SlotId::new(0))).unwrap();
//! assert!(tree.get_value(42).unwrap().is_some());
//! ```

pub mod buffer;
pub mod common;
pub mod concurrency;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{GraniteError, PageId, RecordId, Result, SlotId};
