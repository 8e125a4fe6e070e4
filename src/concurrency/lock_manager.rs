use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::common::{
    AbortReason, GraniteError, RecordId, Result, TableOid, TxnId, CYCLE_DETECTION_INTERVAL,
    INVALID_TXN_ID,
};

use super::transaction::{IsolationLevel, Transaction, TransactionState};

/// Hierarchical lock modes. Intention modes announce finer-granularity
/// locks below; SIX combines a shared table lock with intention-exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

/// The multi-granularity compatibility matrix.
pub fn are_locks_compatible(held: LockMode, requested: LockMode) -> bool {
    use LockMode::*;
    match held {
        IntentionShared => !matches!(requested, Exclusive),
        IntentionExclusive => matches!(requested, IntentionShared | IntentionExclusive),
        Shared => matches!(requested, IntentionShared | Shared),
        SharedIntentionExclusive => matches!(requested, IntentionShared),
        Exclusive => false,
    }
}

/// The legal lock upgrades. Everything else is an incompatible upgrade.
pub fn can_lock_upgrade(held: LockMode, requested: LockMode) -> bool {
    use LockMode::*;
    match held {
        IntentionShared => matches!(
            requested,
            Shared | Exclusive | IntentionExclusive | SharedIntentionExclusive
        ),
        Shared | IntentionExclusive => {
            matches!(requested, Exclusive | SharedIntentionExclusive)
        }
        SharedIntentionExclusive => matches!(requested, Exclusive),
        Exclusive => false,
    }
}

/// Whether a held mode already covers a requested one, making a fresh
/// request a no-op.
pub fn satisfies(held: LockMode, requested: LockMode) -> bool {
    use LockMode::*;
    match held {
        IntentionShared => matches!(requested, IntentionShared),
        Shared => matches!(requested, IntentionShared | Shared),
        IntentionExclusive => matches!(requested, IntentionShared | IntentionExclusive),
        SharedIntentionExclusive => !matches!(requested, Exclusive),
        Exclusive => true,
    }
}

fn is_intention_mode(mode: LockMode) -> bool {
    matches!(
        mode,
        LockMode::IntentionShared | LockMode::IntentionExclusive | LockMode::SharedIntentionExclusive
    )
}

/// One entry in a resource's request queue. The transaction handle is kept
/// so the deadlock detector can inspect and abort waiters.
struct LockRequest {
    txn: Arc<Transaction>,
    mode: LockMode,
    #[allow(dead_code)]
    oid: TableOid,
    rid: Option<RecordId>,
    granted: bool,
}

impl LockRequest {
    fn txn_id(&self) -> TxnId {
        self.txn.txn_id()
    }
}

struct QueueState {
    /// Ordered request list; granted requests keep their slots.
    requests: Vec<LockRequest>,
    /// The one transaction allowed to be upgrading on this resource.
    upgrading: TxnId,
}

/// Per-resource request queue with its condition variable.
struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                requests: Vec::new(),
                upgrading: INVALID_TXN_ID,
            }),
            cv: Condvar::new(),
        }
    }
}

/// Hierarchical two-granularity lock manager with upgrades and deadlock
/// detection.
///
/// Tables and rows each get a map of request queues. Requests wait on the
/// queue's condition variable until every granted request is compatible and
/// no incompatible request is queued ahead of them; an in-flight upgrader
/// keeps its original slot and therefore its priority. A background thread
/// periodically rebuilds the wait-for graph from the queues and aborts the
/// youngest transaction of every cycle it finds.
pub struct LockManager {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<RecordId, Arc<LockRequestQueue>>>,
    /// Last wait-for graph built by the detection thread.
    waits_for: Mutex<BTreeMap<TxnId, BTreeSet<TxnId>>>,
    enable_cycle_detection: AtomicBool,
    detection_thread: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    /// Creates a lock manager with the default deadlock detection interval.
    pub fn new() -> Arc<Self> {
        Self::with_detection_interval(CYCLE_DETECTION_INTERVAL)
    }

    /// Creates a lock manager whose detection thread runs at the given
    /// interval.
    pub fn with_detection_interval(interval: Duration) -> Arc<Self> {
        let lm = Arc::new(Self {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            waits_for: Mutex::new(BTreeMap::new()),
            enable_cycle_detection: AtomicBool::new(true),
            detection_thread: Mutex::new(None),
        });

        let weak = Arc::downgrade(&lm);
        let handle = thread::spawn(move || Self::run_cycle_detection(weak, interval));
        *lm.detection_thread.lock() = Some(handle);

        lm
    }

    /// Acquires (or upgrades to) a table lock, blocking until granted.
    /// Returns Ok(false) if the transaction was aborted while waiting.
    pub fn lock_table(&self, txn: &Arc<Transaction>, mode: LockMode, oid: TableOid) -> Result<bool> {
        if !self.can_txn_take_lock(txn, mode)? {
            return Ok(false);
        }
        let txn_id = txn.txn_id();
        let queue = self.table_queue(oid);
        let mut state = queue.state.lock();

        if let Some(pos) = state.requests.iter().position(|r| r.txn_id() == txn_id) {
            let held = state.requests[pos].mode;
            if state.requests[pos].granted && satisfies(held, mode) {
                return Ok(true);
            }
            // At most one upgrader per queue.
            if state.upgrading != INVALID_TXN_ID {
                drop(state);
                return Err(self.abort_txn(txn, AbortReason::UpgradeConflict));
            }
            if !can_lock_upgrade(held, mode) {
                drop(state);
                return Err(self.abort_txn(txn, AbortReason::IncompatibleUpgrade));
            }
            state.upgrading = txn_id;
            state.requests[pos].granted = false;
            state.requests[pos].mode = mode;
            txn.remove_table_lock(held, oid);
        } else {
            state.requests.push(LockRequest {
                txn: Arc::clone(txn),
                mode,
                oid,
                rid: None,
                granted: false,
            });
        }

        loop {
            if Self::grantable(&state, txn_id) {
                break;
            }
            queue.cv.wait(&mut state);
            // Re-check after every wakeup: the deadlock detector may have
            // chosen us as a victim.
            if txn.state() == TransactionState::Aborted {
                if let Some(pos) = state.requests.iter().position(|r| r.txn_id() == txn_id) {
                    state.requests.remove(pos);
                }
                if state.upgrading == txn_id {
                    state.upgrading = INVALID_TXN_ID;
                }
                drop(state);
                queue.cv.notify_all();
                return Ok(false);
            }
        }

        if let Some(pos) = state.requests.iter().position(|r| r.txn_id() == txn_id) {
            state.requests[pos].granted = true;
        }
        if state.upgrading == txn_id {
            state.upgrading = INVALID_TXN_ID;
        }
        drop(state);

        txn.add_table_lock(mode, oid);
        tracing::trace!(txn = %txn_id, %oid, ?mode, "table lock granted");
        Ok(true)
    }

    /// Releases a table lock, failing while row locks on the table remain.
    pub fn unlock_table(&self, txn: &Arc<Transaction>, oid: TableOid) -> Result<()> {
        self.unlock_table_internal(txn, oid, false)
    }

    pub(crate) fn unlock_table_internal(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        force: bool,
    ) -> Result<()> {
        let txn_id = txn.txn_id();
        let queue = {
            let map = self.table_lock_map.lock();
            map.get(&oid).cloned()
        };
        let queue = match queue {
            Some(queue) => queue,
            None if force => return Ok(()),
            None => return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld)),
        };

        let mut state = queue.state.lock();
        let pos = state
            .requests
            .iter()
            .position(|r| r.txn_id() == txn_id && r.granted);
        let pos = match pos {
            Some(pos) => pos,
            None if force => return Ok(()),
            None => {
                drop(state);
                return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld));
            }
        };

        if !force && txn.holds_row_locks_on(oid) {
            drop(state);
            return Err(self.abort_txn(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }

        let mode = state.requests[pos].mode;
        if !force {
            self.change_txn_state_on_unlock(txn, mode);
        }
        state.requests.remove(pos);
        drop(state);

        txn.remove_table_lock(mode, oid);
        queue.cv.notify_all();
        Ok(())
    }

    /// Acquires (or upgrades to) a row lock. Rows only take S or X, and the
    /// transaction must already hold a covering table lock.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: RecordId,
    ) -> Result<bool> {
        if !self.can_txn_take_lock(txn, mode)? {
            return Ok(false);
        }
        if is_intention_mode(mode) {
            return Err(self.abort_txn(txn, AbortReason::AttemptedIntentionLockOnRow));
        }
        if !self.check_table_lock_for_row(txn, oid, mode) {
            return Err(self.abort_txn(txn, AbortReason::TableLockNotPresent));
        }

        let txn_id = txn.txn_id();
        let queue = self.row_queue(rid);
        let mut state = queue.state.lock();

        if let Some(pos) = state.requests.iter().position(|r| r.txn_id() == txn_id) {
            let held = state.requests[pos].mode;
            if state.requests[pos].granted && satisfies(held, mode) {
                return Ok(true);
            }
            if state.upgrading != INVALID_TXN_ID {
                drop(state);
                return Err(self.abort_txn(txn, AbortReason::UpgradeConflict));
            }
            if !can_lock_upgrade(held, mode) {
                drop(state);
                return Err(self.abort_txn(txn, AbortReason::IncompatibleUpgrade));
            }
            state.upgrading = txn_id;
            state.requests[pos].granted = false;
            state.requests[pos].mode = mode;
            txn.remove_row_lock(held, oid, rid);
        } else {
            state.requests.push(LockRequest {
                txn: Arc::clone(txn),
                mode,
                oid,
                rid: Some(rid),
                granted: false,
            });
        }

        loop {
            if Self::grantable(&state, txn_id) {
                break;
            }
            queue.cv.wait(&mut state);
            if txn.state() == TransactionState::Aborted {
                if let Some(pos) = state.requests.iter().position(|r| r.txn_id() == txn_id) {
                    state.requests.remove(pos);
                }
                if state.upgrading == txn_id {
                    state.upgrading = INVALID_TXN_ID;
                }
                drop(state);
                queue.cv.notify_all();
                return Ok(false);
            }
        }

        if let Some(pos) = state.requests.iter().position(|r| r.txn_id() == txn_id) {
            state.requests[pos].granted = true;
        }
        if state.upgrading == txn_id {
            state.upgrading = INVALID_TXN_ID;
        }
        drop(state);

        txn.add_row_lock(mode, oid, rid);
        tracing::trace!(txn = %txn_id, %oid, %rid, ?mode, "row lock granted");
        Ok(true)
    }

    /// Releases a row lock. `force` skips the held-lock check and the 2PL
    /// state transition; executors use it to drop short reads under
    /// READ_COMMITTED.
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: RecordId,
        force: bool,
    ) -> Result<()> {
        let txn_id = txn.txn_id();
        let queue = {
            let map = self.row_lock_map.lock();
            map.get(&rid).cloned()
        };
        let queue = match queue {
            Some(queue) => queue,
            None if force => return Ok(()),
            None => return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld)),
        };

        let mut state = queue.state.lock();
        let pos = state
            .requests
            .iter()
            .position(|r| r.txn_id() == txn_id && r.granted);
        let pos = match pos {
            Some(pos) => pos,
            None if force => return Ok(()),
            None => {
                drop(state);
                return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld));
            }
        };

        let mode = state.requests[pos].mode;
        if !force && !self.check_table_lock_for_row(txn, oid, mode) {
            drop(state);
            return Err(self.abort_txn(txn, AbortReason::TableLockNotPresent));
        }
        if !force {
            self.change_txn_state_on_unlock(txn, mode);
        }
        state.requests.remove(pos);
        drop(state);

        txn.remove_row_lock(mode, oid, rid);
        queue.cv.notify_all();
        Ok(())
    }

    /// The edges of the wait-for graph as of the last detection cycle.
    pub fn edge_list(&self) -> Vec<(TxnId, TxnId)> {
        let graph = self.waits_for.lock();
        graph
            .iter()
            .flat_map(|(waiter, holders)| holders.iter().map(move |h| (*waiter, *h)))
            .collect()
    }

    /// One full detection pass: rebuild the graph, then abort the youngest
    /// transaction of each cycle until none remain.
    pub fn detect_deadlocks(&self) {
        let (mut graph, handles, txn_queues) = self.build_waits_for_graph();
        *self.waits_for.lock() = graph.clone();

        while let Some(cycle) = Self::find_cycle(&graph) {
            let victim = match cycle.iter().max() {
                Some(victim) => *victim,
                None => break,
            };
            tracing::debug!(victim = %victim, ?cycle, "deadlock found, aborting youngest txn");

            if let Some(txn) = handles.get(&victim) {
                txn.set_state(TransactionState::Aborted);
            }
            graph.remove(&victim);
            for holders in graph.values_mut() {
                holders.remove(&victim);
            }
            // Wake every queue the victim waits or holds on so it can clean
            // its requests up and its peers can make progress.
            if let Some(queues) = txn_queues.get(&victim) {
                for queue in queues {
                    queue.cv.notify_all();
                }
            }
        }
    }

    /// True if the request is compatible with every granted request and no
    /// incompatible request sits ahead of it in the queue. An upgrader
    /// keeps its original (early) slot, which is what gives it priority.
    fn grantable(state: &QueueState, txn_id: TxnId) -> bool {
        let pos = match state.requests.iter().position(|r| r.txn_id() == txn_id) {
            Some(pos) => pos,
            None => return false,
        };
        let mode = state.requests[pos].mode;

        for (i, request) in state.requests.iter().enumerate() {
            if request.txn_id() == txn_id {
                continue;
            }
            if !are_locks_compatible(request.mode, mode) && (request.granted || i < pos) {
                return false;
            }
        }
        true
    }

    /// Admission check: refuses requests from finished transactions and
    /// enforces the per-isolation-level 2PL rules.
    fn can_txn_take_lock(&self, txn: &Arc<Transaction>, mode: LockMode) -> Result<bool> {
        use LockMode::*;

        let state = txn.state();
        if matches!(
            state,
            TransactionState::Aborted | TransactionState::Committed
        ) {
            return Ok(false);
        }

        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if matches!(mode, IntentionShared | Shared | SharedIntentionExclusive) {
                    return Err(self.abort_txn(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if state != TransactionState::Growing {
                    return Err(self.abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if state == TransactionState::Shrinking
                    && !matches!(mode, IntentionShared | Shared)
                {
                    return Err(self.abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if state == TransactionState::Shrinking {
                    return Err(self.abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(true)
    }

    /// Marks the transaction aborted and returns the matching error.
    fn abort_txn(&self, txn: &Arc<Transaction>, reason: AbortReason) -> GraniteError {
        txn.set_state(TransactionState::Aborted);
        tracing::debug!(txn = %txn.txn_id(), ?reason, "aborting transaction");
        GraniteError::TransactionAborted {
            txn_id: txn.txn_id(),
            reason,
        }
    }

    /// Row-lock coverage rule: X rows need IX/SIX/X on the table, S rows
    /// need any granted table lock.
    fn check_table_lock_for_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        row_mode: LockMode,
    ) -> bool {
        let queue = {
            let map = self.table_lock_map.lock();
            map.get(&oid).cloned()
        };
        let queue = match queue {
            Some(queue) => queue,
            None => return false,
        };
        let state = queue.state.lock();
        let held = state
            .requests
            .iter()
            .find(|r| r.txn_id() == txn.txn_id() && r.granted)
            .map(|r| r.mode);
        match held {
            None => false,
            Some(table_mode) => match row_mode {
                LockMode::Exclusive => matches!(
                    table_mode,
                    LockMode::IntentionExclusive
                        | LockMode::SharedIntentionExclusive
                        | LockMode::Exclusive
                ),
                _ => true,
            },
        }
    }

    /// First-unlock-of-class rule: any X unlock moves GROWING to SHRINKING;
    /// an S unlock does so only under REPEATABLE_READ.
    fn change_txn_state_on_unlock(&self, txn: &Arc<Transaction>, mode: LockMode) {
        if txn.state() != TransactionState::Growing {
            return;
        }
        match mode {
            LockMode::Exclusive => txn.set_state(TransactionState::Shrinking),
            LockMode::Shared if txn.isolation_level() == IsolationLevel::RepeatableRead => {
                txn.set_state(TransactionState::Shrinking)
            }
            _ => {}
        }
    }

    fn table_queue(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        let mut map = self.table_lock_map.lock();
        Arc::clone(
            map.entry(oid)
                .or_insert_with(|| Arc::new(LockRequestQueue::new())),
        )
    }

    fn row_queue(&self, rid: RecordId) -> Arc<LockRequestQueue> {
        let mut map = self.row_lock_map.lock();
        Arc::clone(
            map.entry(rid)
                .or_insert_with(|| Arc::new(LockRequestQueue::new())),
        )
    }

    /// Rebuilds the wait-for graph from the queues (the source of truth):
    /// each not-granted request gains an edge to every granted request on
    /// its queue. Aborted transactions are skipped and their queues nudged.
    #[allow(clippy::type_complexity)]
    fn build_waits_for_graph(
        &self,
    ) -> (
        BTreeMap<TxnId, BTreeSet<TxnId>>,
        HashMap<TxnId, Arc<Transaction>>,
        HashMap<TxnId, Vec<Arc<LockRequestQueue>>>,
    ) {
        let mut graph: BTreeMap<TxnId, BTreeSet<TxnId>> = BTreeMap::new();
        let mut handles: HashMap<TxnId, Arc<Transaction>> = HashMap::new();
        let mut txn_queues: HashMap<TxnId, Vec<Arc<LockRequestQueue>>> = HashMap::new();

        let mut queues: Vec<Arc<LockRequestQueue>> = {
            let table_map = self.table_lock_map.lock();
            table_map.values().cloned().collect()
        };
        {
            let row_map = self.row_lock_map.lock();
            queues.extend(row_map.values().cloned());
        }

        for queue in &queues {
            let mut granted: Vec<TxnId> = Vec::new();
            let mut waiting: Vec<TxnId> = Vec::new();
            let mut saw_aborted = false;
            {
                let state = queue.state.lock();
                for request in &state.requests {
                    if request.txn.state() == TransactionState::Aborted {
                        saw_aborted = true;
                        continue;
                    }
                    handles.insert(request.txn_id(), Arc::clone(&request.txn));
                    txn_queues
                        .entry(request.txn_id())
                        .or_default()
                        .push(Arc::clone(queue));
                    if request.granted {
                        granted.push(request.txn_id());
                    } else {
                        waiting.push(request.txn_id());
                    }
                }
            }
            if saw_aborted {
                queue.cv.notify_all();
            }
            for waiter in waiting {
                let holders = graph.entry(waiter).or_default();
                for holder in &granted {
                    if *holder != waiter {
                        holders.insert(*holder);
                    }
                }
            }
        }

        (graph, handles, txn_queues)
    }

    /// Deterministic cycle search: start vertices and neighbors are visited
    /// in ascending txn id order. Returns the vertices of the first cycle.
    fn find_cycle(graph: &BTreeMap<TxnId, BTreeSet<TxnId>>) -> Option<Vec<TxnId>> {
        let mut visited: BTreeSet<TxnId> = BTreeSet::new();
        for &start in graph.keys() {
            if visited.contains(&start) {
                continue;
            }
            let mut path: Vec<TxnId> = Vec::new();
            let mut on_path: BTreeSet<TxnId> = BTreeSet::new();
            if let Some(cycle) = Self::dfs(graph, start, &mut path, &mut on_path, &mut visited) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs(
        graph: &BTreeMap<TxnId, BTreeSet<TxnId>>,
        node: TxnId,
        path: &mut Vec<TxnId>,
        on_path: &mut BTreeSet<TxnId>,
        visited: &mut BTreeSet<TxnId>,
    ) -> Option<Vec<TxnId>> {
        path.push(node);
        on_path.insert(node);

        if let Some(neighbors) = graph.get(&node) {
            for &next in neighbors {
                if on_path.contains(&next) {
                    let start = path.iter().position(|&t| t == next).unwrap_or(0);
                    return Some(path[start..].to_vec());
                }
                if !visited.contains(&next) {
                    if let Some(cycle) = Self::dfs(graph, next, path, on_path, visited) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        on_path.remove(&node);
        visited.insert(node);
        None
    }

    fn run_cycle_detection(weak: Weak<LockManager>, interval: Duration) {
        loop {
            thread::sleep(interval);
            let lm = match weak.upgrade() {
                Some(lm) => lm,
                None => break,
            };
            if !lm.enable_cycle_detection.load(Ordering::Relaxed) {
                break;
            }
            lm.detect_deadlocks();
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.enable_cycle_detection.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detection_thread.get_mut().take() {
            let _ = handle.join();
        }
    }
}
