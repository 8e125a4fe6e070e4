use thiserror::Error;

use super::types::{PageId, TxnId};

/// Why the lock manager aborted a transaction.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    #[error("lock requested while in the shrinking phase")]
    LockOnShrinking,

    #[error("shared lock requested under READ_UNCOMMITTED")]
    LockSharedOnReadUncommitted,

    #[error("another transaction is already upgrading on this resource")]
    UpgradeConflict,

    #[error("requested lock mode is not a legal upgrade")]
    IncompatibleUpgrade,

    #[error("intention lock requested on a row")]
    AttemptedIntentionLockOnRow,

    #[error("row lock requested without an appropriate table lock")]
    TableLockNotPresent,

    #[error("table unlocked while row locks on it are still held")]
    TableUnlockedBeforeUnlockingRows,

    #[error("unlock requested but no lock is held")]
    AttemptedUnlockButNoLockHeld,
}

/// Database error types
#[derive(Error, Debug)]
pub enum GraniteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Page {0} not found")]
    PageNotFound(PageId),

    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),

    #[error("Buffer pool is full, no evictable frames available")]
    BufferPoolFull,

    #[error("Page {0} is still pinned")]
    PageStillPinned(PageId),

    #[error("Disk scheduler error: {0}")]
    DiskScheduler(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Index corrupted: {0}")]
    IndexCorrupted(String),

    #[error("Transaction {txn_id} aborted: {reason}")]
    TransactionAborted { txn_id: TxnId, reason: AbortReason },
}

impl GraniteError {
    /// The abort reason, if this error aborted a transaction.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            GraniteError::TransactionAborted { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GraniteError>;
