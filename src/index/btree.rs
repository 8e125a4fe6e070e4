use std::collections::VecDeque;
use std::sync::Arc;

use crate::buffer::{BufferPoolManager, WritePageGuard};
use crate::common::{GraniteError, PageId, RecordId, Result, INVALID_PAGE_ID};

use super::btree_iterator::BPlusTreeIterator;
use super::btree_page::{
    BTreePageRef, HeaderPageMut, HeaderPageRef, InternalPageMut, InternalPageRef, LeafPageMut,
    LeafPageRef,
};

fn corrupt(msg: &str) -> GraniteError {
    GraniteError::IndexCorrupted(msg.to_string())
}

/// Per-call crab path: the captured root id plus the chain of write guards
/// held on the way down. The deque is back-pushed on descent and
/// front-dropped once a node is proven safe.
struct Context {
    root_page_id: PageId,
    write_set: VecDeque<WritePageGuard>,
}

impl Context {
    fn new(root_page_id: PageId) -> Self {
        Self {
            root_page_id,
            write_set: VecDeque::new(),
        }
    }

    fn is_root(&self, page_id: PageId) -> bool {
        self.root_page_id == page_id
    }

    fn back(&self) -> Result<&WritePageGuard> {
        self.write_set.back().ok_or_else(|| corrupt("crab path empty"))
    }

    fn back_mut(&mut self) -> Result<&mut WritePageGuard> {
        self.write_set
            .back_mut()
            .ok_or_else(|| corrupt("crab path empty"))
    }
}

/// A concurrent B+tree index mapping u32 keys to record ids, built on
/// buffer pool page guards.
///
/// Readers descend with chained read latches; writers carry a crab path of
/// write guards, splitting full nodes eagerly on the way down and
/// rebalancing underfull nodes on the way back up. Root splits and root
/// collapses rewrite the root page in place, so the header page is only
/// written when the tree goes from empty to non-empty.
pub struct BPlusTree {
    bpm: Arc<BufferPoolManager>,
    header_page_id: PageId,
    leaf_max_size: usize,
    internal_max_size: usize,
}

impl BPlusTree {
    /// Creates a new, empty tree, allocating its header page.
    pub fn new(
        bpm: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        let (header_page_id, mut guard) = bpm.new_page()?;
        {
            let mut header = HeaderPageMut::new(guard.data_mut());
            header.init();
        }
        drop(guard);

        Ok(Self {
            bpm,
            header_page_id,
            leaf_max_size,
            internal_max_size,
        })
    }

    /// Reattaches to a tree persisted behind an existing header page.
    pub fn open(
        bpm: Arc<BufferPoolManager>,
        header_page_id: PageId,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Self {
        Self {
            bpm,
            header_page_id,
            leaf_max_size,
            internal_max_size,
        }
    }

    pub fn header_page_id(&self) -> PageId {
        self.header_page_id
    }

    /// The current root page id, or INVALID_PAGE_ID for an empty tree.
    pub fn root_page_id(&self) -> Result<PageId> {
        let guard = self
            .bpm
            .checked_read_page(self.header_page_id)?
            .ok_or(GraniteError::PageNotFound(self.header_page_id))?;
        Ok(HeaderPageRef::new(guard.data()).root_page_id())
    }

    pub fn is_empty(&self) -> Result<bool> {
        let root_id = self.root_page_id()?;
        if root_id == INVALID_PAGE_ID {
            return Ok(true);
        }
        let guard = self
            .bpm
            .checked_read_page(root_id)?
            .ok_or(GraniteError::PageNotFound(root_id))?;
        Ok(BTreePageRef::new(guard.data()).size() == 0)
    }

    /// Point lookup. Descends with chained read guards, releasing each
    /// parent as soon as the child latch is held.
    pub fn get_value(&self, key: u32) -> Result<Option<RecordId>> {
        let root_id = self.root_page_id()?;
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }

        let mut guard = self
            .bpm
            .checked_read_page(root_id)?
            .ok_or(GraniteError::PageNotFound(root_id))?;
        loop {
            if BTreePageRef::new(guard.data()).is_leaf() {
                let leaf = LeafPageRef::new(guard.data());
                let idx = leaf.lower_bound(key);
                if idx < leaf.size() && leaf.key_at(idx) == key {
                    return Ok(Some(leaf.rid_at(idx)));
                }
                return Ok(None);
            }

            let child_id = {
                let node = InternalPageRef::new(guard.data());
                node.child_at(node.lookup_child(key))
            };
            let child = self
                .bpm
                .checked_read_page(child_id)?
                .ok_or(GraniteError::PageNotFound(child_id))?;
            guard = child;
        }
    }

    /// Inserts a key/value pair. Returns Ok(false) on a duplicate key,
    /// leaving the tree unchanged.
    pub fn insert(&self, key: u32, rid: RecordId) -> Result<bool> {
        let mut ctx = {
            let mut header_guard = self
                .bpm
                .checked_write_page(self.header_page_id)?
                .ok_or(GraniteError::PageNotFound(self.header_page_id))?;
            let root_id = HeaderPageRef::new(header_guard.data()).root_page_id();
            if root_id == INVALID_PAGE_ID {
                let (new_root_id, mut root_guard) = self.bpm.new_page()?;
                LeafPageMut::init(root_guard.data_mut(), self.leaf_max_size);
                drop(root_guard);
                let mut header = HeaderPageMut::new(header_guard.data_mut());
                header.set_root_page_id(new_root_id);
                Context::new(new_root_id)
            } else {
                Context::new(root_id)
            }
        };

        let mut next_page_id = ctx.root_page_id;
        loop {
            let guard = self
                .bpm
                .checked_write_page(next_page_id)?
                .ok_or(GraniteError::PageNotFound(next_page_id))?;
            ctx.write_set.push_back(guard);

            // Eager split on descent: an already-full node is split under
            // its latched parent before we go any deeper, which is what
            // makes keeping only [parent, child] guards sufficient. Nodes of
            // three entries or fewer are left alone so a split never
            // produces an invalid internal node. After a split the back of
            // the path is the parent; the search below re-runs on it and
            // descends into the proper half.
            {
                let (size, max_size) = {
                    let node = BTreePageRef::new(ctx.back()?.data());
                    (node.size(), node.max_size())
                };
                if size >= max_size && size > 3 {
                    self.split(&mut ctx)?;
                }
            }

            while ctx.write_set.len() > 2 {
                ctx.write_set.pop_front();
            }

            let is_leaf = BTreePageRef::new(ctx.back()?.data()).is_leaf();
            if is_leaf {
                return self.insert_into_leaf(&mut ctx, key, rid);
            }

            next_page_id = {
                let node = InternalPageRef::new(ctx.back()?.data());
                node.child_at(node.lookup_child(key))
            };
        }
    }

    fn insert_into_leaf(&self, ctx: &mut Context, key: u32, rid: RecordId) -> Result<bool> {
        let needs_split = {
            let guard = ctx.back_mut()?;
            let mut leaf = LeafPageMut::new(guard.data_mut());
            let idx = leaf.lower_bound(key);
            if idx < leaf.size() && leaf.key_at(idx) == key {
                return Ok(false);
            }
            leaf.insert_at(idx, key, rid);
            leaf.size() >= leaf.max_size()
        };

        if needs_split {
            self.split(ctx)?;
        }
        Ok(true)
    }

    /// Splits the node at the back of the crab path, inserting the promoted
    /// separator into its parent (which becomes the new back). The root is
    /// rewritten in place so its page id never changes.
    fn split(&self, ctx: &mut Context) -> Result<()> {
        let mut guard = ctx
            .write_set
            .pop_back()
            .ok_or_else(|| corrupt("split with empty crab path"))?;

        let (is_leaf, size, max_size) = {
            let node = BTreePageRef::new(guard.data());
            (node.is_leaf(), node.size(), node.max_size())
        };
        if size < max_size {
            ctx.write_set.push_back(guard);
            return Ok(());
        }

        if ctx.is_root(guard.page_id()) {
            self.split_root(&mut guard)?;
            ctx.write_set.push_back(guard);
            return Ok(());
        }

        let mut parent_guard = ctx
            .write_set
            .pop_back()
            .ok_or_else(|| corrupt("split of non-root without parent latch"))?;

        if is_leaf {
            self.split_leaf(&mut guard, &mut parent_guard)?;
        } else {
            self.split_internal(&mut guard, &mut parent_guard)?;
        }

        drop(guard);
        ctx.write_set.push_back(parent_guard);
        Ok(())
    }

    /// Rewrites a full root as an internal node over two freshly allocated
    /// children, preserving the root page id.
    fn split_root(&self, root_guard: &mut WritePageGuard) -> Result<()> {
        let (left_id, mut left_guard) = self.bpm.new_page()?;
        let (right_id, mut right_guard) = self.bpm.new_page()?;

        let is_leaf = BTreePageRef::new(root_guard.data()).is_leaf();
        let separator = if is_leaf {
            let root = LeafPageRef::new(root_guard.data());
            let size = root.size();
            let mid = (size - 1) / 2;
            {
                let mut left = LeafPageMut::init(left_guard.data_mut(), self.leaf_max_size);
                for i in 0..=mid {
                    left.set_entry(i, root.key_at(i), root.rid_at(i));
                }
                left.set_size(mid + 1);
                left.set_next_page_id(right_id);
            }
            {
                let mut right = LeafPageMut::init(right_guard.data_mut(), self.leaf_max_size);
                for i in mid + 1..size {
                    right.set_entry(i - mid - 1, root.key_at(i), root.rid_at(i));
                }
                right.set_size(size - mid - 1);
                right.set_next_page_id(root.next_page_id());
            }
            root.key_at(mid)
        } else {
            let root = InternalPageRef::new(root_guard.data());
            let size = root.size();
            let mid = size / 2;
            {
                let mut left = InternalPageMut::init(left_guard.data_mut(), self.internal_max_size);
                for i in 0..mid {
                    left.set_entry(i, root.key_at(i), root.child_at(i));
                }
                left.set_size(mid);
            }
            {
                let mut right =
                    InternalPageMut::init(right_guard.data_mut(), self.internal_max_size);
                right.set_entry(0, 0, root.child_at(mid));
                for i in mid + 1..size {
                    right.set_entry(i - mid, root.key_at(i), root.child_at(i));
                }
                right.set_size(size - mid);
            }
            root.key_at(mid)
        };

        let mut root = InternalPageMut::init(root_guard.data_mut(), self.internal_max_size);
        root.set_entry(0, 0, left_id);
        root.set_entry(1, separator, right_id);
        root.set_size(2);
        Ok(())
    }

    fn split_leaf(
        &self,
        leaf_guard: &mut WritePageGuard,
        parent_guard: &mut WritePageGuard,
    ) -> Result<()> {
        let leaf_id = leaf_guard.page_id();
        let (right_id, mut right_guard) = self.bpm.new_page()?;

        let separator = {
            let mut leaf = LeafPageMut::new(leaf_guard.data_mut());
            let size = leaf.size();
            let mid = (size - 1) / 2;
            {
                let mut right = LeafPageMut::init(right_guard.data_mut(), self.leaf_max_size);
                for i in mid + 1..size {
                    right.set_entry(i - mid - 1, leaf.key_at(i), leaf.rid_at(i));
                }
                right.set_size(size - mid - 1);
                right.set_next_page_id(leaf.next_page_id());
            }
            leaf.set_next_page_id(right_id);
            leaf.set_size(mid + 1);
            leaf.key_at(mid)
        };

        let mut parent = InternalPageMut::new(parent_guard.data_mut());
        let index = parent
            .child_index_of(leaf_id)
            .ok_or_else(|| corrupt("split leaf not found in parent"))?;
        parent.insert_at(index + 1, separator, right_id);
        Ok(())
    }

    fn split_internal(
        &self,
        node_guard: &mut WritePageGuard,
        parent_guard: &mut WritePageGuard,
    ) -> Result<()> {
        let node_id = node_guard.page_id();
        let (right_id, mut right_guard) = self.bpm.new_page()?;

        let separator = {
            let mut node = InternalPageMut::new(node_guard.data_mut());
            let size = node.size();
            let mid = size / 2;
            let sep = node.key_at(mid);
            {
                let mut right =
                    InternalPageMut::init(right_guard.data_mut(), self.internal_max_size);
                right.set_entry(0, 0, node.child_at(mid));
                for i in mid + 1..size {
                    right.set_entry(i - mid, node.key_at(i), node.child_at(i));
                }
                right.set_size(size - mid);
            }
            node.set_size(mid);
            sep
        };

        let mut parent = InternalPageMut::new(parent_guard.data_mut());
        let index = parent
            .child_index_of(node_id)
            .ok_or_else(|| corrupt("split node not found in parent"))?;
        parent.insert_at(index + 1, separator, right_id);
        Ok(())
    }

    /// Removes a key. Returns Ok(false) if the key is absent.
    pub fn remove(&self, key: u32) -> Result<bool> {
        let mut ctx = {
            let header_guard = self
                .bpm
                .checked_write_page(self.header_page_id)?
                .ok_or(GraniteError::PageNotFound(self.header_page_id))?;
            let root_id = HeaderPageRef::new(header_guard.data()).root_page_id();
            if root_id == INVALID_PAGE_ID {
                return Ok(false);
            }
            Context::new(root_id)
        };

        let mut next_page_id = ctx.root_page_id;
        loop {
            let guard = self
                .bpm
                .checked_write_page(next_page_id)?
                .ok_or(GraniteError::PageNotFound(next_page_id))?;
            ctx.write_set.push_back(guard);

            let (is_leaf, safe) = {
                let node = BTreePageRef::new(ctx.back()?.data());
                let safe = if node.is_leaf() {
                    node.size() > node.min_size()
                } else {
                    node.size() > 2
                };
                (node.is_leaf(), safe)
            };

            // A node that cannot underflow stops merge propagation, so
            // everything above it can be released.
            if safe {
                while ctx.write_set.len() > 1 {
                    ctx.write_set.pop_front();
                }
            }

            if is_leaf {
                let removed = {
                    let guard = ctx.back_mut()?;
                    let mut leaf = LeafPageMut::new(guard.data_mut());
                    let idx = leaf.lower_bound(key);
                    if idx < leaf.size() && leaf.key_at(idx) == key {
                        leaf.remove_at(idx);
                        true
                    } else {
                        false
                    }
                };
                if removed {
                    self.merge(&mut ctx)?;
                }
                return Ok(removed);
            }

            next_page_id = {
                let node = InternalPageRef::new(ctx.back()?.data());
                node.child_at(node.lookup_child(key))
            };
        }
    }

    /// Walks the crab path back up from the leaf, fixing underflows by
    /// redistribution (preferred) or merge, left sibling first.
    fn merge(&self, ctx: &mut Context) -> Result<()> {
        let mut guard = match ctx.write_set.pop_back() {
            Some(guard) => guard,
            None => return Ok(()),
        };

        loop {
            let underflow = {
                let node = BTreePageRef::new(guard.data());
                if node.is_leaf() {
                    node.size() < node.min_size()
                } else {
                    node.size() <= 1
                }
            };
            if !underflow {
                return Ok(());
            }

            let mut parent_guard = match ctx.write_set.pop_back() {
                // The root is exempt from minimum occupancy.
                None => return Ok(()),
                Some(guard) => guard,
            };

            let is_leaf = BTreePageRef::new(guard.data()).is_leaf();
            let merged = if is_leaf {
                self.rebalance_leaf(guard, &mut parent_guard, ctx)?
            } else {
                self.rebalance_internal(guard, &mut parent_guard, ctx)?
            };

            if !merged {
                return Ok(());
            }
            guard = parent_guard;
        }
    }

    /// Fixes an underflowed leaf. Returns true if a merge removed a parent
    /// entry (underflow may now propagate), false after redistribution.
    fn rebalance_leaf(
        &self,
        self_guard: WritePageGuard,
        parent_guard: &mut WritePageGuard,
        ctx: &Context,
    ) -> Result<bool> {
        let self_id = self_guard.page_id();
        let parent_id = parent_guard.page_id();
        let (index, parent_size) = {
            let parent = InternalPageRef::new(parent_guard.data());
            let index = parent
                .child_index_of(self_id)
                .ok_or_else(|| corrupt("underflowed leaf not found in parent"))?;
            (index, parent.size())
        };

        if index > 0 {
            // Re-latch siblings left before right to keep writers ordered.
            let left_id = InternalPageRef::new(parent_guard.data()).child_at(index - 1);
            drop(self_guard);
            let mut left_guard = self
                .bpm
                .checked_write_page(left_id)?
                .ok_or(GraniteError::PageNotFound(left_id))?;
            let mut self_guard = self
                .bpm
                .checked_write_page(self_id)?
                .ok_or(GraniteError::PageNotFound(self_id))?;

            let (left_size, self_size, left_max, self_min) = {
                let left = LeafPageRef::new(left_guard.data());
                let me = LeafPageRef::new(self_guard.data());
                (left.size(), me.size(), left.max_size(), me.min_size())
            };

            if left_size + self_size >= left_max {
                // Borrow from the left sibling's tail.
                let move_num = self_min - self_size;
                {
                    let left = LeafPageRef::new(left_guard.data());
                    let mut me = LeafPageMut::new(self_guard.data_mut());
                    for i in (0..self_size).rev() {
                        let (k, r) = (me.key_at(i), me.rid_at(i));
                        me.set_entry(i + move_num, k, r);
                    }
                    for i in 0..move_num {
                        let src = left_size - move_num + i;
                        me.set_entry(i, left.key_at(src), left.rid_at(src));
                    }
                    me.set_size(self_size + move_num);
                }
                let separator = {
                    let mut left = LeafPageMut::new(left_guard.data_mut());
                    left.set_size(left_size - move_num);
                    left.key_at(left_size - move_num - 1)
                };
                let mut parent = InternalPageMut::new(parent_guard.data_mut());
                parent.set_key_at(index, separator);
                return Ok(false);
            }

            if parent_size <= 2 && ctx.is_root(parent_id) {
                // The root would keep a single child; fold both leaves into
                // the root page itself, which becomes the sole leaf.
                let entries = Self::collect_leaf_entries(&left_guard, &self_guard);
                drop(left_guard);
                drop(self_guard);
                let mut root = LeafPageMut::init(parent_guard.data_mut(), self.leaf_max_size);
                for (i, (k, r)) in entries.iter().enumerate() {
                    root.set_entry(i, *k, *r);
                }
                root.set_size(entries.len());
                return Ok(false);
            }

            // Merge self into the left sibling.
            {
                let me = LeafPageRef::new(self_guard.data());
                let mut left = LeafPageMut::new(left_guard.data_mut());
                for i in 0..self_size {
                    left.set_entry(left_size + i, me.key_at(i), me.rid_at(i));
                }
                left.set_size(left_size + self_size);
                left.set_next_page_id(me.next_page_id());
            }
            let mut parent = InternalPageMut::new(parent_guard.data_mut());
            parent.remove_at(index);
            Ok(true)
        } else {
            // Leftmost child: work with the right sibling.
            let right_id = InternalPageRef::new(parent_guard.data()).child_at(1);
            let mut self_guard = self_guard;
            let mut right_guard = self
                .bpm
                .checked_write_page(right_id)?
                .ok_or(GraniteError::PageNotFound(right_id))?;

            let (right_size, self_size, right_max, self_min) = {
                let right = LeafPageRef::new(right_guard.data());
                let me = LeafPageRef::new(self_guard.data());
                (right.size(), me.size(), right.max_size(), me.min_size())
            };

            if right_size + self_size >= right_max {
                // Borrow from the right sibling's head.
                let move_num = self_min - self_size;
                let separator = {
                    let right = LeafPageRef::new(right_guard.data());
                    let mut me = LeafPageMut::new(self_guard.data_mut());
                    for i in 0..move_num {
                        me.set_entry(self_size + i, right.key_at(i), right.rid_at(i));
                    }
                    me.set_size(self_size + move_num);
                    right.key_at(move_num - 1)
                };
                {
                    let mut right = LeafPageMut::new(right_guard.data_mut());
                    for i in 0..right_size - move_num {
                        let (k, r) = (right.key_at(i + move_num), right.rid_at(i + move_num));
                        right.set_entry(i, k, r);
                    }
                    right.set_size(right_size - move_num);
                }
                let mut parent = InternalPageMut::new(parent_guard.data_mut());
                parent.set_key_at(1, separator);
                return Ok(false);
            }

            if parent_size <= 2 && ctx.is_root(parent_id) {
                let entries = Self::collect_leaf_entries(&self_guard, &right_guard);
                drop(self_guard);
                drop(right_guard);
                let mut root = LeafPageMut::init(parent_guard.data_mut(), self.leaf_max_size);
                for (i, (k, r)) in entries.iter().enumerate() {
                    root.set_entry(i, *k, *r);
                }
                root.set_size(entries.len());
                return Ok(false);
            }

            // Merge the right sibling into self.
            {
                let right = LeafPageRef::new(right_guard.data());
                let mut me = LeafPageMut::new(self_guard.data_mut());
                for i in 0..right_size {
                    me.set_entry(self_size + i, right.key_at(i), right.rid_at(i));
                }
                me.set_size(self_size + right_size);
                me.set_next_page_id(right.next_page_id());
            }
            let mut parent = InternalPageMut::new(parent_guard.data_mut());
            parent.remove_at(1);
            Ok(true)
        }
    }

    fn collect_leaf_entries(
        first: &WritePageGuard,
        second: &WritePageGuard,
    ) -> Vec<(u32, RecordId)> {
        let mut entries = Vec::new();
        for guard in [first, second] {
            let leaf = LeafPageRef::new(guard.data());
            for i in 0..leaf.size() {
                entries.push((leaf.key_at(i), leaf.rid_at(i)));
            }
        }
        entries
    }

    /// Fixes an underflowed internal node (size has fallen to one entry).
    fn rebalance_internal(
        &self,
        self_guard: WritePageGuard,
        parent_guard: &mut WritePageGuard,
        ctx: &Context,
    ) -> Result<bool> {
        let self_id = self_guard.page_id();
        let parent_id = parent_guard.page_id();
        let (index, parent_size) = {
            let parent = InternalPageRef::new(parent_guard.data());
            let index = parent
                .child_index_of(self_id)
                .ok_or_else(|| corrupt("underflowed node not found in parent"))?;
            (index, parent.size())
        };

        if index > 0 {
            let left_id = InternalPageRef::new(parent_guard.data()).child_at(index - 1);
            drop(self_guard);
            let mut left_guard = self
                .bpm
                .checked_write_page(left_id)?
                .ok_or(GraniteError::PageNotFound(left_id))?;
            let mut self_guard = self
                .bpm
                .checked_write_page(self_id)?
                .ok_or(GraniteError::PageNotFound(self_id))?;

            let (left_size, self_size, left_max) = {
                let left = InternalPageRef::new(left_guard.data());
                let me = InternalPageRef::new(self_guard.data());
                (left.size(), me.size(), left.max_size())
            };

            if left_size > 2 && left_size + self_size >= left_max {
                // Rotate entries from the left sibling through the parent
                // separator.
                let move_num = 2 - self_size;
                let parent_key = InternalPageRef::new(parent_guard.data()).key_at(index);
                let separator = {
                    let left = InternalPageRef::new(left_guard.data());
                    let mut me = InternalPageMut::new(self_guard.data_mut());
                    for i in (0..self_size).rev() {
                        let (k, c) = (me.key_at(i), me.child_at(i));
                        me.set_entry(i + move_num, k, c);
                    }
                    me.set_key_at(move_num, parent_key);
                    for i in 0..move_num {
                        let src = left_size - move_num + i;
                        me.set_entry(i, left.key_at(src), left.child_at(src));
                    }
                    me.set_key_at(0, 0);
                    me.set_size(self_size + move_num);
                    left.key_at(left_size - move_num)
                };
                {
                    let mut left = InternalPageMut::new(left_guard.data_mut());
                    left.set_size(left_size - move_num);
                }
                let mut parent = InternalPageMut::new(parent_guard.data_mut());
                parent.set_key_at(index, separator);
                return Ok(false);
            }

            if parent_size <= 2 && ctx.is_root(parent_id) {
                // Fold both children into the root page.
                let parent_key = InternalPageRef::new(parent_guard.data()).key_at(index);
                let entries = Self::collect_internal_entries(&left_guard, &self_guard, parent_key);
                drop(left_guard);
                drop(self_guard);
                let mut root = InternalPageMut::init(parent_guard.data_mut(), self.internal_max_size);
                for (i, (k, c)) in entries.iter().enumerate() {
                    root.set_entry(i, *k, *c);
                }
                root.set_size(entries.len());
                return Ok(false);
            }

            // Merge self into the left sibling; the parent separator drops
            // down to caption self's sentinel child.
            {
                let parent_key = InternalPageRef::new(parent_guard.data()).key_at(index);
                let me = InternalPageRef::new(self_guard.data());
                let mut left = InternalPageMut::new(left_guard.data_mut());
                left.set_entry(left_size, parent_key, me.child_at(0));
                for i in 1..self_size {
                    left.set_entry(left_size + i, me.key_at(i), me.child_at(i));
                }
                left.set_size(left_size + self_size);
            }
            let mut parent = InternalPageMut::new(parent_guard.data_mut());
            parent.remove_at(index);
            Ok(true)
        } else {
            let right_id = InternalPageRef::new(parent_guard.data()).child_at(1);
            let mut self_guard = self_guard;
            let mut right_guard = self
                .bpm
                .checked_write_page(right_id)?
                .ok_or(GraniteError::PageNotFound(right_id))?;

            let (right_size, self_size, right_max) = {
                let right = InternalPageRef::new(right_guard.data());
                let me = InternalPageRef::new(self_guard.data());
                (right.size(), me.size(), right.max_size())
            };

            if right_size > 2 && right_size + self_size >= right_max {
                let move_num = 2 - self_size;
                let parent_key = InternalPageRef::new(parent_guard.data()).key_at(1);
                let separator = {
                    let right = InternalPageRef::new(right_guard.data());
                    let mut me = InternalPageMut::new(self_guard.data_mut());
                    me.set_entry(self_size, parent_key, right.child_at(0));
                    for i in 1..move_num {
                        me.set_entry(self_size + i, right.key_at(i), right.child_at(i));
                    }
                    me.set_size(self_size + move_num);
                    right.key_at(move_num)
                };
                {
                    let mut right = InternalPageMut::new(right_guard.data_mut());
                    for i in 0..right_size - move_num {
                        let (k, c) = (right.key_at(i + move_num), right.child_at(i + move_num));
                        right.set_entry(i, k, c);
                    }
                    right.set_key_at(0, 0);
                    right.set_size(right_size - move_num);
                }
                let mut parent = InternalPageMut::new(parent_guard.data_mut());
                parent.set_key_at(1, separator);
                return Ok(false);
            }

            if parent_size <= 2 && ctx.is_root(parent_id) {
                let parent_key = InternalPageRef::new(parent_guard.data()).key_at(1);
                let entries = Self::collect_internal_entries(&self_guard, &right_guard, parent_key);
                drop(self_guard);
                drop(right_guard);
                let mut root = InternalPageMut::init(parent_guard.data_mut(), self.internal_max_size);
                for (i, (k, c)) in entries.iter().enumerate() {
                    root.set_entry(i, *k, *c);
                }
                root.set_size(entries.len());
                return Ok(false);
            }

            // Merge the right sibling into self.
            {
                let parent_key = InternalPageRef::new(parent_guard.data()).key_at(1);
                let right = InternalPageRef::new(right_guard.data());
                let mut me = InternalPageMut::new(self_guard.data_mut());
                me.set_entry(self_size, parent_key, right.child_at(0));
                for i in 1..right_size {
                    me.set_entry(self_size + i, right.key_at(i), right.child_at(i));
                }
                me.set_size(self_size + right_size);
            }
            let mut parent = InternalPageMut::new(parent_guard.data_mut());
            parent.remove_at(1);
            Ok(true)
        }
    }

    /// Concatenates two internal siblings, demoting the parent separator in
    /// front of the second node's sentinel child.
    fn collect_internal_entries(
        first: &WritePageGuard,
        second: &WritePageGuard,
        parent_key: u32,
    ) -> Vec<(u32, PageId)> {
        let mut entries = Vec::new();
        {
            let node = InternalPageRef::new(first.data());
            for i in 0..node.size() {
                entries.push((node.key_at(i), node.child_at(i)));
            }
        }
        {
            let node = InternalPageRef::new(second.data());
            entries.push((parent_key, node.child_at(0)));
            for i in 1..node.size() {
                entries.push((node.key_at(i), node.child_at(i)));
            }
        }
        entries
    }

    /// Iterator positioned at the first key of the tree.
    pub fn begin(&self) -> Result<BPlusTreeIterator> {
        let root_id = self.root_page_id()?;
        if root_id == INVALID_PAGE_ID {
            return Ok(BPlusTreeIterator::end(Arc::clone(&self.bpm)));
        }

        let mut guard = self
            .bpm
            .checked_read_page(root_id)?
            .ok_or(GraniteError::PageNotFound(root_id))?;
        loop {
            if BTreePageRef::new(guard.data()).is_leaf() {
                return Ok(BPlusTreeIterator::new(Arc::clone(&self.bpm), guard, 0));
            }
            let child_id = InternalPageRef::new(guard.data()).child_at(0);
            let child = self
                .bpm
                .checked_read_page(child_id)?
                .ok_or(GraniteError::PageNotFound(child_id))?;
            guard = child;
        }
    }

    /// Iterator positioned on the given key, or the end iterator if the key
    /// is not present.
    pub fn begin_at(&self, key: u32) -> Result<BPlusTreeIterator> {
        let root_id = self.root_page_id()?;
        if root_id == INVALID_PAGE_ID {
            return Ok(BPlusTreeIterator::end(Arc::clone(&self.bpm)));
        }

        let mut guard = self
            .bpm
            .checked_read_page(root_id)?
            .ok_or(GraniteError::PageNotFound(root_id))?;
        loop {
            if BTreePageRef::new(guard.data()).is_leaf() {
                let index = {
                    let leaf = LeafPageRef::new(guard.data());
                    let idx = leaf.lower_bound(key);
                    if idx < leaf.size() && leaf.key_at(idx) == key {
                        Some(idx)
                    } else {
                        None
                    }
                };
                return Ok(match index {
                    Some(idx) => BPlusTreeIterator::new(Arc::clone(&self.bpm), guard, idx),
                    None => BPlusTreeIterator::end(Arc::clone(&self.bpm)),
                });
            }
            let child_id = {
                let node = InternalPageRef::new(guard.data());
                node.child_at(node.lookup_child(key))
            };
            let child = self
                .bpm
                .checked_read_page(child_id)?
                .ok_or(GraniteError::PageNotFound(child_id))?;
            guard = child;
        }
    }

    /// Number of levels in the tree; zero when empty.
    pub fn height(&self) -> Result<usize> {
        let root_id = self.root_page_id()?;
        if root_id == INVALID_PAGE_ID {
            return Ok(0);
        }

        let mut levels = 1;
        let mut guard = self
            .bpm
            .checked_read_page(root_id)?
            .ok_or(GraniteError::PageNotFound(root_id))?;
        loop {
            if BTreePageRef::new(guard.data()).is_leaf() {
                return Ok(levels);
            }
            let child_id = InternalPageRef::new(guard.data()).child_at(0);
            let child = self
                .bpm
                .checked_read_page(child_id)?
                .ok_or(GraniteError::PageNotFound(child_id))?;
            guard = child;
            levels += 1;
        }
    }

    /// Renders the tree structure as indented text, one node per line.
    pub fn draw(&self) -> Result<String> {
        let root_id = self.root_page_id()?;
        if root_id == INVALID_PAGE_ID {
            return Ok("()".to_string());
        }
        let mut out = String::new();
        self.draw_node(root_id, 0, &mut out)?;
        Ok(out)
    }

    fn draw_node(&self, page_id: PageId, depth: usize, out: &mut String) -> Result<()> {
        let guard = self
            .bpm
            .checked_basic_page(page_id)?
            .ok_or(GraniteError::PageNotFound(page_id))?;

        let children = {
            let data = guard.read();
            let node = BTreePageRef::new(&data[..]);
            out.push_str(&"  ".repeat(depth));
            if node.is_leaf() {
                let leaf = LeafPageRef::new(&data[..]);
                let keys: Vec<String> =
                    (0..leaf.size()).map(|i| leaf.key_at(i).to_string()).collect();
                out.push_str(&format!("Leaf p{} [{}]\n", page_id.as_u32(), keys.join(", ")));
                Vec::new()
            } else {
                let internal = InternalPageRef::new(&data[..]);
                let keys: Vec<String> = (1..internal.size())
                    .map(|i| internal.key_at(i).to_string())
                    .collect();
                out.push_str(&format!(
                    "Internal p{} [{}]\n",
                    page_id.as_u32(),
                    keys.join(", ")
                ));
                (0..internal.size()).map(|i| internal.child_at(i)).collect()
            }
        };

        for child in children {
            self.draw_node(child, depth + 1, out)?;
        }
        Ok(())
    }
}
