pub mod btree;
pub mod btree_iterator;
pub mod btree_page;

pub use btree::BPlusTree;
pub use btree_iterator::BPlusTreeIterator;
pub use btree_page::{
    BTreePageRef, HeaderPageMut, HeaderPageRef, InternalPageMut, InternalPageRef, LeafPageMut,
    LeafPageRef,
};
