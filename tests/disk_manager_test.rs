//! Integration tests for the disk manager

use granite::common::{PageId, PAGE_SIZE};
use granite::storage::disk::DiskManager;

#[test]
fn test_disk_manager_monotonic_allocation() {
    let temp_dir = tempfile::tempdir().unwrap();
    let dm = DiskManager::new(temp_dir.path().join("alloc.db")).unwrap();

    for expected in 0..10u32 {
        assert_eq!(dm.allocate_page().unwrap(), PageId::new(expected));
    }

    // Deallocation never recycles ids
    dm.deallocate_page(PageId::new(3)).unwrap();
    assert_eq!(dm.allocate_page().unwrap(), PageId::new(10));
}

#[test]
fn test_disk_manager_write_read_cycle() {
    let temp_dir = tempfile::tempdir().unwrap();
    let dm = DiskManager::new(temp_dir.path().join("rw.db")).unwrap();

    let first = dm.allocate_page().unwrap();
    let second = dm.allocate_page().unwrap();

    let mut data1 = [0u8; PAGE_SIZE];
    data1[0] = 0xAB;
    let mut data2 = [0u8; PAGE_SIZE];
    data2[PAGE_SIZE - 1] = 0xCD;

    dm.write_page(first, &data1).unwrap();
    dm.write_page(second, &data2).unwrap();

    let mut read = [0u8; PAGE_SIZE];
    dm.read_page(first, &mut read).unwrap();
    assert_eq!(read[0], 0xAB);

    dm.read_page(second, &mut read).unwrap();
    assert_eq!(read[PAGE_SIZE - 1], 0xCD);

    assert!(dm.get_num_writes() >= 2);
    assert!(dm.get_num_reads() >= 2);
}

#[test]
fn test_disk_manager_reopen_resumes_allocation() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("resume.db");

    {
        let dm = DiskManager::new(&path).unwrap();
        for _ in 0..5 {
            dm.allocate_page().unwrap();
        }
        dm.sync().unwrap();
    }

    let dm = DiskManager::new(&path).unwrap();
    assert_eq!(dm.get_num_pages(), 5);
    assert_eq!(dm.allocate_page().unwrap(), PageId::new(5));
}
