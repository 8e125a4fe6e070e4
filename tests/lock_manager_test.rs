//! Integration tests for the hierarchical lock manager

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use granite::common::{AbortReason, PageId, RecordId, SlotId, TableOid};
use granite::concurrency::{
    IsolationLevel, LockManager, LockMode, TransactionManager, TransactionState,
};

fn setup() -> (Arc<LockManager>, Arc<TransactionManager>) {
    let lm = LockManager::with_detection_interval(Duration::from_millis(10));
    let tm = Arc::new(TransactionManager::new(Arc::clone(&lm)));
    (lm, tm)
}

fn rid(n: u32) -> RecordId {
    RecordId::new(PageId::new(n), SlotId::new(0))
}

#[test]
fn test_lock_unlock_table_basic() {
    let (lm, tm) = setup();
    let table = TableOid::new(1);

    let txn = tm.begin(IsolationLevel::RepeatableRead);
    assert!(lm.lock_table(&txn, LockMode::Shared, table).unwrap());
    assert!(txn.with_lock_sets(|sets| sets.shared_table.contains(&table)));

    lm.unlock_table(&txn, table).unwrap();
    assert!(txn.with_lock_sets(|sets| sets.shared_table.is_empty()));
    // S unlock under REPEATABLE_READ enters the shrinking phase
    assert_eq!(txn.state(), TransactionState::Shrinking);
}

#[test]
fn test_shared_locks_coexist() {
    let (lm, tm) = setup();
    let table = TableOid::new(1);

    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Shared, table).unwrap());
    assert!(lm.lock_table(&t2, LockMode::Shared, table).unwrap());

    tm.commit(&t1);
    tm.commit(&t2);
    assert_eq!(t1.state(), TransactionState::Committed);
    assert_eq!(t2.state(), TransactionState::Committed);
}

#[test]
fn test_already_sufficient_mode_is_a_noop() {
    let (lm, tm) = setup();
    let table = TableOid::new(1);

    let txn = tm.begin(IsolationLevel::RepeatableRead);
    assert!(lm.lock_table(&txn, LockMode::Exclusive, table).unwrap());
    // X already covers S: granted immediately, no upgrade machinery
    assert!(lm.lock_table(&txn, LockMode::Shared, table).unwrap());
    assert!(txn.with_lock_sets(|sets| sets.exclusive_table.contains(&table)));
    tm.commit(&txn);
}

#[test]
fn test_exclusive_blocks_until_release() {
    let (lm, tm) = setup();
    let table = TableOid::new(1);

    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Exclusive, table).unwrap());

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let lm = Arc::clone(&lm);
        let t2 = Arc::clone(&t2);
        thread::spawn(move || {
            assert!(lm.lock_table(&t2, LockMode::Shared, table).unwrap());
            tx.send(()).unwrap();
        })
    };

    // t2 must still be blocked
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    tm.commit(&t1);
    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    waiter.join().unwrap();
    tm.commit(&t2);
}

#[test]
fn test_upgrade_waits_for_other_readers() {
    // T1 and T2 share the table; T1's upgrade to X waits until T2 unlocks.
    let (lm, tm) = setup();
    let table = TableOid::new(1);

    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Shared, table).unwrap());
    assert!(lm.lock_table(&t2, LockMode::Shared, table).unwrap());

    let (tx, rx) = mpsc::channel();
    let upgrader = {
        let lm = Arc::clone(&lm);
        let t1 = Arc::clone(&t1);
        thread::spawn(move || {
            assert!(lm.lock_table(&t1, LockMode::Exclusive, table).unwrap());
            tx.send(()).unwrap();
        })
    };

    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    lm.unlock_table(&t2, table).unwrap();
    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    upgrader.join().unwrap();

    assert!(t1.with_lock_sets(|sets| sets.exclusive_table.contains(&table)));
    tm.commit(&t1);
}

#[test]
fn test_upgrade_conflict_aborts_second_upgrader() {
    // Both hold S and both request X: exactly one aborts with
    // UPGRADE_CONFLICT, the other succeeds once the loser releases.
    let (lm, tm) = setup();
    let table = TableOid::new(1);

    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Shared, table).unwrap());
    assert!(lm.lock_table(&t2, LockMode::Shared, table).unwrap());

    let first = {
        let lm = Arc::clone(&lm);
        let t1 = Arc::clone(&t1);
        thread::spawn(move || lm.lock_table(&t1, LockMode::Exclusive, table))
    };

    // Let t1 become the queue's upgrader before t2 tries
    thread::sleep(Duration::from_millis(100));

    let err = lm
        .lock_table(&t2, LockMode::Exclusive, table)
        .expect_err("second concurrent upgrade must abort");
    assert_eq!(err.abort_reason(), Some(AbortReason::UpgradeConflict));
    assert_eq!(t2.state(), TransactionState::Aborted);

    // Releasing the loser's S lock lets the winner's upgrade through
    tm.abort(&t2);
    assert!(first.join().unwrap().unwrap());
    tm.commit(&t1);
}

#[test]
fn test_incompatible_upgrade_rejected() {
    let (lm, tm) = setup();
    let table = TableOid::new(1);

    let txn = tm.begin(IsolationLevel::RepeatableRead);
    assert!(lm.lock_table(&txn, LockMode::Exclusive, table).unwrap());

    // X cannot be "upgraded" to SIX
    let err = lm
        .lock_table(&txn, LockMode::SharedIntentionExclusive, table)
        .expect_err("downgrade must abort");
    assert_eq!(err.abort_reason(), Some(AbortReason::IncompatibleUpgrade));
    assert_eq!(txn.state(), TransactionState::Aborted);
}

#[test]
fn test_read_uncommitted_rejects_shared() {
    let (lm, tm) = setup();
    let table = TableOid::new(1);

    for mode in [
        LockMode::Shared,
        LockMode::IntentionShared,
        LockMode::SharedIntentionExclusive,
    ] {
        let txn = tm.begin(IsolationLevel::ReadUncommitted);
        let err = lm
            .lock_table(&txn, mode, table)
            .expect_err("shared modes are illegal under READ_UNCOMMITTED");
        assert_eq!(
            err.abort_reason(),
            Some(AbortReason::LockSharedOnReadUncommitted)
        );
        assert_eq!(txn.state(), TransactionState::Aborted);
    }
}

#[test]
fn test_repeatable_read_locks_on_shrinking() {
    let (lm, tm) = setup();
    let table = TableOid::new(1);

    let txn = tm.begin(IsolationLevel::RepeatableRead);
    assert!(lm.lock_table(&txn, LockMode::Exclusive, table).unwrap());
    lm.unlock_table(&txn, table).unwrap();
    assert_eq!(txn.state(), TransactionState::Shrinking);

    let err = lm
        .lock_table(&txn, LockMode::Shared, table)
        .expect_err("no locks while shrinking under REPEATABLE_READ");
    assert_eq!(err.abort_reason(), Some(AbortReason::LockOnShrinking));
}

#[test]
fn test_read_committed_allows_shared_on_shrinking() {
    let (lm, tm) = setup();
    let table = TableOid::new(1);
    let other = TableOid::new(2);

    let txn = tm.begin(IsolationLevel::ReadCommitted);
    assert!(lm.lock_table(&txn, LockMode::Exclusive, table).unwrap());
    lm.unlock_table(&txn, table).unwrap();
    assert_eq!(txn.state(), TransactionState::Shrinking);

    // S and IS stay legal while shrinking under READ_COMMITTED
    assert!(lm.lock_table(&txn, LockMode::Shared, other).unwrap());
    assert!(lm
        .lock_table(&txn, LockMode::IntentionShared, other)
        .unwrap());

    let err = lm
        .lock_table(&txn, LockMode::IntentionExclusive, other)
        .expect_err("IX is illegal while shrinking under READ_COMMITTED");
    assert_eq!(err.abort_reason(), Some(AbortReason::LockOnShrinking));
}

#[test]
fn test_read_committed_shared_unlock_keeps_growing() {
    let (lm, tm) = setup();
    let table = TableOid::new(1);

    let txn = tm.begin(IsolationLevel::ReadCommitted);
    assert!(lm.lock_table(&txn, LockMode::Shared, table).unwrap());
    lm.unlock_table(&txn, table).unwrap();
    assert_eq!(txn.state(), TransactionState::Growing);
}

#[test]
fn test_row_lock_rules() {
    let (lm, tm) = setup();
    let table = TableOid::new(1);
    let row = rid(1);

    // Intention locks on rows are rejected
    let txn = tm.begin(IsolationLevel::RepeatableRead);
    let err = lm
        .lock_row(&txn, LockMode::IntentionShared, table, row)
        .expect_err("intention mode on a row must abort");
    assert_eq!(
        err.abort_reason(),
        Some(AbortReason::AttemptedIntentionLockOnRow)
    );

    // An X row lock needs a covering table lock
    let txn = tm.begin(IsolationLevel::RepeatableRead);
    let err = lm
        .lock_row(&txn, LockMode::Exclusive, table, row)
        .expect_err("row lock without table lock must abort");
    assert_eq!(err.abort_reason(), Some(AbortReason::TableLockNotPresent));

    // IS covers S rows but not X rows
    let txn = tm.begin(IsolationLevel::RepeatableRead);
    assert!(lm
        .lock_table(&txn, LockMode::IntentionShared, table)
        .unwrap());
    assert!(lm.lock_row(&txn, LockMode::Shared, table, row).unwrap());
    let err = lm
        .lock_row(&txn, LockMode::Exclusive, table, rid(2))
        .expect_err("IS does not cover X rows");
    assert_eq!(err.abort_reason(), Some(AbortReason::TableLockNotPresent));
}

#[test]
fn test_table_unlock_blocked_by_row_locks() {
    let (lm, tm) = setup();
    let table = TableOid::new(1);
    let row = rid(1);

    let txn = tm.begin(IsolationLevel::RepeatableRead);
    assert!(lm
        .lock_table(&txn, LockMode::IntentionExclusive, table)
        .unwrap());
    assert!(lm.lock_row(&txn, LockMode::Exclusive, table, row).unwrap());

    let err = lm
        .unlock_table(&txn, table)
        .expect_err("rows must be unlocked before their table");
    assert_eq!(
        err.abort_reason(),
        Some(AbortReason::TableUnlockedBeforeUnlockingRows)
    );
}

#[test]
fn test_row_unlock_then_table_unlock() {
    let (lm, tm) = setup();
    let table = TableOid::new(1);
    let row = rid(1);

    let txn = tm.begin(IsolationLevel::RepeatableRead);
    assert!(lm
        .lock_table(&txn, LockMode::IntentionExclusive, table)
        .unwrap());
    assert!(lm.lock_row(&txn, LockMode::Exclusive, table, row).unwrap());

    lm.unlock_row(&txn, table, row, false).unwrap();
    // X row unlock flips the txn into shrinking
    assert_eq!(txn.state(), TransactionState::Shrinking);
    lm.unlock_table(&txn, table).unwrap();
    assert!(txn.with_lock_sets(|sets| sets.intention_exclusive_table.is_empty()));
}

#[test]
fn test_forced_row_unlock_skips_state_change() {
    let (lm, tm) = setup();
    let table = TableOid::new(1);
    let row = rid(1);

    let txn = tm.begin(IsolationLevel::ReadCommitted);
    assert!(lm
        .lock_table(&txn, LockMode::IntentionExclusive, table)
        .unwrap());
    assert!(lm.lock_row(&txn, LockMode::Exclusive, table, row).unwrap());

    lm.unlock_row(&txn, table, row, true).unwrap();
    assert_eq!(txn.state(), TransactionState::Growing);

    // Forced unlock of an unknown row is silently fine
    lm.unlock_row(&txn, table, rid(42), true).unwrap();
}

#[test]
fn test_unlock_without_lock_aborts() {
    let (lm, tm) = setup();
    let table = TableOid::new(1);

    let txn = tm.begin(IsolationLevel::RepeatableRead);
    let err = lm
        .unlock_table(&txn, table)
        .expect_err("unlocking an unheld lock must abort");
    assert_eq!(
        err.abort_reason(),
        Some(AbortReason::AttemptedUnlockButNoLockHeld)
    );

    let txn = tm.begin(IsolationLevel::RepeatableRead);
    let err = lm
        .unlock_row(&txn, table, rid(1), false)
        .expect_err("unlocking an unheld row lock must abort");
    assert_eq!(
        err.abort_reason(),
        Some(AbortReason::AttemptedUnlockButNoLockHeld)
    );
}

#[test]
fn test_deadlock_detection_aborts_youngest() {
    // T1 holds row a and wants row b; T2 holds row b and wants row a.
    // The detector must abort T2 (the larger txn id) within an interval.
    let (lm, tm) = setup();
    let table = TableOid::new(1);
    let row_a = rid(1);
    let row_b = rid(2);

    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm
        .lock_table(&t1, LockMode::IntentionExclusive, table)
        .unwrap());
    assert!(lm
        .lock_table(&t2, LockMode::IntentionExclusive, table)
        .unwrap());
    assert!(lm.lock_row(&t1, LockMode::Exclusive, table, row_a).unwrap());
    assert!(lm.lock_row(&t2, LockMode::Exclusive, table, row_b).unwrap());

    let survivor = {
        let lm = Arc::clone(&lm);
        let tm = Arc::clone(&tm);
        let t1 = Arc::clone(&t1);
        thread::spawn(move || {
            // Blocks on T2's row, then proceeds once T2 dies
            assert!(lm.lock_row(&t1, LockMode::Exclusive, table, row_b).unwrap());
            tm.commit(&t1);
        })
    };

    thread::sleep(Duration::from_millis(50));

    // Completes the cycle; this txn is the victim
    let acquired = lm.lock_row(&t2, LockMode::Exclusive, table, row_a).unwrap();
    assert!(!acquired);
    assert_eq!(t2.state(), TransactionState::Aborted);

    // Releasing the victim's locks lets T1 finish
    tm.abort(&t2);
    survivor.join().unwrap();
    assert_eq!(t1.state(), TransactionState::Committed);
}

#[test]
fn test_wait_for_graph_edges() {
    let (lm, tm) = setup();
    let table = TableOid::new(1);

    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Exclusive, table).unwrap());

    let waiter = {
        let lm = Arc::clone(&lm);
        let t2 = Arc::clone(&t2);
        thread::spawn(move || lm.lock_table(&t2, LockMode::Shared, table))
    };

    // Give the waiter time to queue and the detector time to rebuild
    thread::sleep(Duration::from_millis(100));
    let edges = lm.edge_list();
    assert!(edges.contains(&(t2.txn_id(), t1.txn_id())));

    tm.commit(&t1);
    assert!(waiter.join().unwrap().unwrap());
    tm.commit(&t2);
}

#[test]
fn test_aborted_txn_cannot_lock() {
    let (lm, tm) = setup();
    let table = TableOid::new(1);

    let txn = tm.begin(IsolationLevel::RepeatableRead);
    txn.set_state(TransactionState::Aborted);

    assert!(!lm.lock_table(&txn, LockMode::Shared, table).unwrap());
}
