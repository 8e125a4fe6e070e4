//! Integration tests for the B+tree index

use std::sync::Arc;

use granite::buffer::BufferPoolManager;
use granite::common::{PageId, RecordId, SlotId};
use granite::index::BPlusTree;
use granite::storage::disk::DiskManager;

use tempfile::NamedTempFile;

fn create_bpm(pool_size: usize) -> (Arc<BufferPoolManager>, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let disk_manager = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    let bpm = Arc::new(BufferPoolManager::new(pool_size, 2, disk_manager));
    (bpm, temp_file)
}

fn rid(key: u32) -> RecordId {
    RecordId::new(PageId::new(key), SlotId::new(0))
}

fn scan_keys(tree: &BPlusTree) -> Vec<u32> {
    tree.begin()
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect()
}

#[test]
fn test_btree_empty() {
    let (bpm, _temp) = create_bpm(10);
    let tree = BPlusTree::new(bpm, 4, 4).unwrap();

    assert!(tree.is_empty().unwrap());
    assert_eq!(tree.get_value(1).unwrap(), None);
    assert!(tree.begin().unwrap().is_end());
    assert!(!tree.remove(1).unwrap());
    assert_eq!(tree.height().unwrap(), 0);
}

#[test]
fn test_btree_insert_and_get() {
    let (bpm, _temp) = create_bpm(10);
    let tree = BPlusTree::new(bpm, 4, 4).unwrap();

    tree.insert(10, rid(10)).unwrap();
    tree.insert(20, rid(20)).unwrap();
    tree.insert(30, rid(30)).unwrap();

    assert_eq!(tree.get_value(10).unwrap(), Some(rid(10)));
    assert_eq!(tree.get_value(20).unwrap(), Some(rid(20)));
    assert_eq!(tree.get_value(30).unwrap(), Some(rid(30)));
    assert_eq!(tree.get_value(40).unwrap(), None);
    assert!(!tree.is_empty().unwrap());
}

#[test]
fn test_btree_duplicate_key_rejected() {
    let (bpm, _temp) = create_bpm(10);
    let tree = BPlusTree::new(bpm, 4, 4).unwrap();

    assert!(tree.insert(7, rid(7)).unwrap());
    assert!(!tree.insert(7, rid(99)).unwrap());

    // The original value survives
    assert_eq!(tree.get_value(7).unwrap(), Some(rid(7)));
    assert_eq!(scan_keys(&tree), vec![7]);
}

#[test]
fn test_btree_split_sixteen_keys() {
    // Fan-out 4 and keys 1..=16 produce a three-level tree whose in-order
    // scan returns every key.
    let (bpm, _temp) = create_bpm(32);
    let tree = BPlusTree::new(bpm, 4, 4).unwrap();

    for key in 1..=16u32 {
        assert!(tree.insert(key, rid(key)).unwrap());
    }

    assert_eq!(tree.height().unwrap(), 3);
    assert_eq!(scan_keys(&tree), (1..=16).collect::<Vec<u32>>());

    let picture = tree.draw().unwrap();
    assert!(picture.contains("Internal"));
    assert!(picture.contains("Leaf"));

    for key in 1..=16u32 {
        assert_eq!(tree.get_value(key).unwrap(), Some(rid(key)), "key {}", key);
    }
}

#[test]
fn test_btree_merge_after_removals() {
    // Remove the lower half of the sixteen-key tree; the remainder scans in
    // order and lookups still work on both sides of the cut.
    let (bpm, _temp) = create_bpm(32);
    let tree = BPlusTree::new(bpm, 4, 4).unwrap();

    for key in 1..=16u32 {
        tree.insert(key, rid(key)).unwrap();
    }
    for key in 1..=8u32 {
        assert!(tree.remove(key).unwrap(), "remove {}", key);
    }

    assert_eq!(scan_keys(&tree), (9..=16).collect::<Vec<u32>>());
    for key in 1..=8u32 {
        assert_eq!(tree.get_value(key).unwrap(), None);
    }
    for key in 9..=16u32 {
        assert_eq!(tree.get_value(key).unwrap(), Some(rid(key)));
    }
}

#[test]
fn test_btree_root_collapse() {
    // Removing down to two keys folds the tree back into a single root leaf.
    let (bpm, _temp) = create_bpm(32);
    let tree = BPlusTree::new(bpm, 4, 4).unwrap();

    for key in 1..=16u32 {
        tree.insert(key, rid(key)).unwrap();
    }
    for key in 1..=14u32 {
        assert!(tree.remove(key).unwrap(), "remove {}", key);
    }

    assert_eq!(scan_keys(&tree), vec![15, 16]);
    assert_eq!(tree.height().unwrap(), 1);
}

#[test]
fn test_btree_remove_all_then_reinsert() {
    let (bpm, _temp) = create_bpm(32);
    let tree = BPlusTree::new(bpm, 4, 4).unwrap();

    for key in 1..=16u32 {
        tree.insert(key, rid(key)).unwrap();
    }
    for key in 1..=16u32 {
        assert!(tree.remove(key).unwrap());
    }

    assert!(tree.is_empty().unwrap());
    assert_eq!(scan_keys(&tree), Vec::<u32>::new());

    for key in (1..=8u32).rev() {
        assert!(tree.insert(key, rid(key)).unwrap());
    }
    assert_eq!(scan_keys(&tree), (1..=8).collect::<Vec<u32>>());
}

#[test]
fn test_btree_remove_absent_key() {
    let (bpm, _temp) = create_bpm(10);
    let tree = BPlusTree::new(bpm, 4, 4).unwrap();

    tree.insert(5, rid(5)).unwrap();
    assert!(!tree.remove(6).unwrap());
    assert_eq!(scan_keys(&tree), vec![5]);
}

#[test]
fn test_btree_insert_many_sequential() {
    let (bpm, _temp) = create_bpm(64);
    let tree = BPlusTree::new(bpm, 8, 8).unwrap();

    for key in 0..1000u32 {
        assert!(tree.insert(key, rid(key)).unwrap());
    }

    for key in 0..1000u32 {
        assert_eq!(tree.get_value(key).unwrap(), Some(rid(key)), "key {}", key);
    }
    assert_eq!(scan_keys(&tree), (0..1000).collect::<Vec<u32>>());
}

#[test]
fn test_btree_insert_reverse() {
    let (bpm, _temp) = create_bpm(64);
    let tree = BPlusTree::new(bpm, 4, 4).unwrap();

    for key in (0..100u32).rev() {
        assert!(tree.insert(key, rid(key)).unwrap());
    }

    assert_eq!(scan_keys(&tree), (0..100).collect::<Vec<u32>>());
}

#[test]
fn test_btree_random_insert_remove_round_trip() {
    use rand::seq::SliceRandom;
    use rand::thread_rng;

    let (bpm, _temp) = create_bpm(128);
    let tree = BPlusTree::new(bpm, 6, 6).unwrap();

    let mut keys: Vec<u32> = (0..500).collect();
    keys.shuffle(&mut thread_rng());

    for &key in &keys {
        assert!(tree.insert(key, rid(key)).unwrap());
    }

    // Remove a random half and verify the exact survivor set
    let mut to_remove = keys.clone();
    to_remove.shuffle(&mut thread_rng());
    to_remove.truncate(250);

    for &key in &to_remove {
        assert!(tree.remove(key).unwrap(), "remove {}", key);
    }

    let mut survivors: Vec<u32> = (0..500u32)
        .filter(|k| !to_remove.contains(k))
        .collect();
    survivors.sort_unstable();

    assert_eq!(scan_keys(&tree), survivors);
}

#[test]
fn test_btree_iterator_from_key() {
    let (bpm, _temp) = create_bpm(32);
    let tree = BPlusTree::new(bpm, 4, 4).unwrap();

    for key in (2..=20u32).step_by(2) {
        tree.insert(key, rid(key)).unwrap();
    }

    let tail: Vec<u32> = tree
        .begin_at(12)
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(tail, vec![12, 14, 16, 18, 20]);

    // An absent key yields the end iterator
    assert!(tree.begin_at(13).unwrap().is_end());
}

#[test]
fn test_btree_iterator_equality() {
    let (bpm, _temp) = create_bpm(32);
    let tree = BPlusTree::new(bpm, 4, 4).unwrap();

    for key in 1..=8u32 {
        tree.insert(key, rid(key)).unwrap();
    }

    let a = tree.begin().unwrap();
    let b = tree.begin().unwrap();
    assert!(a == b);

    let c = tree.begin_at(1).unwrap();
    assert!(a == c);

    let mut d = tree.begin().unwrap();
    d.next_entry().unwrap();
    assert!(a != d);
}

#[test]
fn test_btree_persistence() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_path_buf();

    let header_page_id = {
        let disk_manager = Arc::new(DiskManager::new(&path).unwrap());
        let bpm = Arc::new(BufferPoolManager::new(32, 2, disk_manager));
        let tree = BPlusTree::new(Arc::clone(&bpm), 4, 4).unwrap();

        for key in 0..50u32 {
            tree.insert(key, rid(key)).unwrap();
        }

        bpm.flush_all_pages().unwrap();
        tree.header_page_id()
    };

    {
        let disk_manager = Arc::new(DiskManager::new(&path).unwrap());
        let bpm = Arc::new(BufferPoolManager::new(32, 2, disk_manager));
        let tree = BPlusTree::open(bpm, header_page_id, 4, 4);

        for key in 0..50u32 {
            assert_eq!(
                tree.get_value(key).unwrap(),
                Some(rid(key)),
                "key {} after reload",
                key
            );
        }
        assert_eq!(scan_keys(&tree), (0..50).collect::<Vec<u32>>());
    }
}
