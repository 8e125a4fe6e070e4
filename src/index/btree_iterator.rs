use std::sync::Arc;

use crate::buffer::{BufferPoolManager, ReadPageGuard};
use crate::common::{GraniteError, PageId, RecordId, Result, INVALID_PAGE_ID};

use super::btree_page::LeafPageRef;

/// Forward cursor over the leaf chain. Holds a read guard on the current
/// leaf plus an entry index; advancing past the last entry hands over to
/// the next leaf's guard. The end state holds no guard.
pub struct BPlusTreeIterator {
    bpm: Arc<BufferPoolManager>,
    guard: Option<ReadPageGuard>,
    index: usize,
}

impl BPlusTreeIterator {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, guard: ReadPageGuard, index: usize) -> Self {
        Self {
            bpm,
            guard: Some(guard),
            index,
        }
    }

    pub(crate) fn end(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            guard: None,
            index: 0,
        }
    }

    /// Whether the cursor has run off the end of the leaf chain.
    pub fn is_end(&self) -> bool {
        self.guard.is_none()
    }

    /// The page id of the leaf under the cursor, if any. Together with the
    /// entry index this identifies the cursor position.
    pub fn current_page_id(&self) -> Option<PageId> {
        self.guard.as_ref().map(|guard| guard.page_id())
    }

    pub fn current_index(&self) -> usize {
        self.index
    }

    /// Returns the entry under the cursor and advances, or None at the end.
    pub fn next_entry(&mut self) -> Result<Option<(u32, RecordId)>> {
        loop {
            let next_page_id = {
                let guard = match self.guard.as_ref() {
                    Some(guard) => guard,
                    None => return Ok(None),
                };
                let leaf = LeafPageRef::new(guard.data());
                if self.index < leaf.size() {
                    let entry = (leaf.key_at(self.index), leaf.rid_at(self.index));
                    self.index += 1;
                    return Ok(Some(entry));
                }
                leaf.next_page_id()
            };

            if next_page_id == INVALID_PAGE_ID {
                self.guard = None;
                self.index = 0;
                return Ok(None);
            }

            // Hand over: the next leaf is latched before the current one is
            // released.
            let next_guard = self
                .bpm
                .checked_read_page(next_page_id)?
                .ok_or(GraniteError::PageNotFound(next_page_id))?;
            self.guard = Some(next_guard);
            self.index = 0;
        }
    }
}

impl Iterator for BPlusTreeIterator {
    type Item = Result<(u32, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl PartialEq for BPlusTreeIterator {
    /// Two cursors are equal when they sit on the same leaf page at the
    /// same index, or are both at the end.
    fn eq(&self, other: &Self) -> bool {
        self.current_page_id() == other.current_page_id() && self.index == other.index
    }
}
