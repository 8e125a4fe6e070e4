use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{RecordId, TableOid, TxnId};

use super::lock_manager::{LockManager, LockMode};

/// Isolation levels supported by the lock manager's admission rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// The granted locks of a transaction, one set per granularity/mode pair.
#[derive(Debug, Default)]
pub struct TransactionLockSets {
    pub intention_shared_table: HashSet<TableOid>,
    pub intention_exclusive_table: HashSet<TableOid>,
    pub shared_table: HashSet<TableOid>,
    pub shared_intention_exclusive_table: HashSet<TableOid>,
    pub exclusive_table: HashSet<TableOid>,
    pub shared_rows: HashMap<TableOid, HashSet<RecordId>>,
    pub exclusive_rows: HashMap<TableOid, HashSet<RecordId>>,
}

impl TransactionLockSets {
    fn table_set_mut(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::IntentionShared => &mut self.intention_shared_table,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_table,
            LockMode::Shared => &mut self.shared_table,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_table,
            LockMode::Exclusive => &mut self.exclusive_table,
        }
    }
}

/// A transaction as seen by the storage core: an id, an isolation level,
/// a 2PL state, and the sets of locks it currently holds. Write sets and
/// the rest of transaction bookkeeping live outside the core.
pub struct Transaction {
    txn_id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    lock_sets: Mutex<TransactionLockSets>,
}

impl Transaction {
    pub fn new(txn_id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            txn_id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            lock_sets: Mutex::new(TransactionLockSets::default()),
        }
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// Runs the given closure over the lock sets under their mutex.
    pub fn with_lock_sets<R>(&self, f: impl FnOnce(&TransactionLockSets) -> R) -> R {
        f(&self.lock_sets.lock())
    }

    pub(crate) fn add_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.lock_sets.lock().table_set_mut(mode).insert(oid);
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.lock_sets.lock().table_set_mut(mode).remove(&oid);
    }

    pub(crate) fn add_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        let rows = match mode {
            LockMode::Shared => &mut sets.shared_rows,
            LockMode::Exclusive => &mut sets.exclusive_rows,
            _ => return,
        };
        rows.entry(oid).or_default().insert(rid);
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        let rows = match mode {
            LockMode::Shared => &mut sets.shared_rows,
            LockMode::Exclusive => &mut sets.exclusive_rows,
            _ => return,
        };
        if let Some(set) = rows.get_mut(&oid) {
            set.remove(&rid);
        }
    }

    /// Whether the transaction still holds any row lock on the given table.
    pub fn holds_row_locks_on(&self, oid: TableOid) -> bool {
        let sets = self.lock_sets.lock();
        sets.shared_rows.get(&oid).is_some_and(|s| !s.is_empty())
            || sets.exclusive_rows.get(&oid).is_some_and(|s| !s.is_empty())
    }
}

/// Hands out transactions and drives commit/abort through the lock
/// manager. Write-set reverts are out of scope for the storage core.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(0),
            lock_manager,
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = TxnId::new(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        Arc::new(Transaction::new(txn_id, isolation_level))
    }

    pub fn commit(&self, txn: &Arc<Transaction>) {
        self.release_locks(txn);
        txn.set_state(TransactionState::Committed);
    }

    pub fn abort(&self, txn: &Arc<Transaction>) {
        self.release_locks(txn);
        txn.set_state(TransactionState::Aborted);
    }

    /// Releases every lock the transaction still holds, rows before their
    /// tables so the hierarchy rule is never tripped.
    fn release_locks(&self, txn: &Arc<Transaction>) {
        let (rows, tables) = txn.with_lock_sets(|sets| {
            let mut rows: Vec<(TableOid, RecordId)> = Vec::new();
            for (oid, set) in sets.shared_rows.iter().chain(sets.exclusive_rows.iter()) {
                rows.extend(set.iter().map(|rid| (*oid, *rid)));
            }
            let mut tables: Vec<TableOid> = Vec::new();
            tables.extend(sets.intention_shared_table.iter().copied());
            tables.extend(sets.intention_exclusive_table.iter().copied());
            tables.extend(sets.shared_table.iter().copied());
            tables.extend(sets.shared_intention_exclusive_table.iter().copied());
            tables.extend(sets.exclusive_table.iter().copied());
            (rows, tables)
        });

        for (oid, rid) in rows {
            if let Err(err) = self.lock_manager.unlock_row(txn, oid, rid, true) {
                tracing::debug!(txn = %txn.txn_id(), %oid, %rid, %err, "row unlock during release failed");
            }
        }
        for oid in tables {
            if let Err(err) = self.lock_manager.unlock_table_internal(txn, oid, true) {
                tracing::debug!(txn = %txn.txn_id(), %oid, %err, "table unlock during release failed");
            }
        }
    }
}
