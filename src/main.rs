use std::sync::Arc;

use granite::buffer::BufferPoolManager;
use granite::common::{PageId, RecordId, SlotId, TableOid};
use granite::concurrency::{IsolationLevel, LockManager, LockMode, TransactionManager};
use granite::index::BPlusTree;
use granite::storage::disk::DiskManager;

fn main() {
    println!("Granite - a disk-oriented RDBMS storage core in Rust");
    println!("=====================================================\n");

    let db_path = "demo.db";

    let disk_manager = Arc::new(DiskManager::new(db_path).expect("Failed to create disk manager"));
    println!("Created disk manager for: {}", db_path);

    let bpm = Arc::new(BufferPoolManager::new(16, 2, disk_manager));
    println!("Created buffer pool manager with 16 frames\n");

    // Build a small B+tree and scan it back
    let tree = BPlusTree::new(Arc::clone(&bpm), 4, 4).expect("Failed to create index");
    for key in 1..=16u32 {
        let rid = RecordId::new(PageId::new(key), SlotId::new(0));
        tree.insert(key, rid).expect("Failed to insert");
    }
    println!(
        "Inserted keys 1..=16 into a fan-out-4 B+tree ({} levels):",
        tree.height().expect("Failed to read height")
    );
    println!("{}", tree.draw().expect("Failed to draw tree"));

    let keys: Vec<u32> = tree
        .begin()
        .expect("Failed to open iterator")
        .map(|entry| entry.expect("Iterator failed").0)
        .collect();
    println!("Range scan: {:?}\n", keys);

    // Hand a table lock between two transactions
    let lock_manager = LockManager::new();
    let txn_manager = Arc::new(TransactionManager::new(Arc::clone(&lock_manager)));

    let table = TableOid::new(1);
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager
        .lock_table(&t1, LockMode::Shared, table)
        .expect("t1 S lock failed");
    println!("t1 holds S on table 1");

    let tm = Arc::clone(&txn_manager);
    let lm = Arc::clone(&lock_manager);
    let t2_clone = Arc::clone(&t2);
    let waiter = std::thread::spawn(move || {
        lm.lock_table(&t2_clone, LockMode::Exclusive, table)
            .expect("t2 X lock failed");
        println!("t2 acquired X on table 1");
        tm.commit(&t2_clone);
    });

    std::thread::sleep(std::time::Duration::from_millis(50));
    println!("t2 is waiting for X; committing t1 to release it");
    txn_manager.commit(&t1);
    waiter.join().expect("waiter thread panicked");

    std::fs::remove_file(db_path).ok();
    println!("\nDemo completed successfully!");
}
