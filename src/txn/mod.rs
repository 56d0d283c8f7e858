//! # Transactions
//!
//! Strict two-phase locking with undo-based rollback, coordinated by
//! three pieces:
//!
//! - [`LockManager`]: multi-granularity table/record locks in five modes
//!   with no-wait deadlock prevention,
//! - [`Transaction`]: per-transaction 2PL state, held-lock set, and undo
//!   log,
//! - [`TransactionManager`]: begin/commit/abort lifecycle and the
//!   process-wide transaction registry.
//!
//! ## Lifecycle
//!
//! ```text
//!            lock / mutate / append undo
//!           ┌────────────┐
//!           ▼            │
//! begin ─► GROWING ──────┘
//!             │ first unlock
//!             ▼
//!          SHRINKING ──► COMMITTED   (undo discarded, locks released)
//!             │
//!             └────────► ABORTED     (undo replayed in reverse, locks released)
//! ```
//!
//! A [`Context`] bundles the lock manager with one transaction handle and
//! is what the record manager and the executor glue thread through their
//! operations; passing no context (as undo replay does) skips locking and
//! undo recording entirely.

mod lock_manager;
mod manager;

pub use lock_manager::{LockDataId, LockManager, LockMode};
pub use manager::TransactionManager;

use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::Mutex;

use crate::errors::Result;
use crate::storage::FileId;
use crate::types::Rid;

pub type TxnId = u32;
pub type Timestamp = u32;

/// Two-phase-locking state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// One undo entry. Insert needs only the position to revert; delete and
/// update carry the bytes they must restore.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRecord {
    Insert {
        table: String,
        rid: Rid,
    },
    Delete {
        table: String,
        rid: Rid,
        record: Vec<u8>,
    },
    Update {
        table: String,
        rid: Rid,
        old_record: Vec<u8>,
    },
}

struct TxnInner {
    state: TxnState,
    lock_set: HashSet<LockDataId>,
    write_set: Vec<WriteRecord>,
}

/// A transaction handle. Interior mutability lets the lock manager and
/// the executor glue share `&Transaction` across threads; every state
/// transition goes through the single inner mutex.
pub struct Transaction {
    id: TxnId,
    start_ts: Timestamp,
    inner: Mutex<TxnInner>,
}

impl Transaction {
    pub(crate) fn new(id: TxnId, start_ts: Timestamp) -> Self {
        Self {
            id,
            start_ts,
            inner: Mutex::new(TxnInner {
                state: TxnState::Growing,
                lock_set: HashSet::new(),
                write_set: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    pub fn state(&self) -> TxnState {
        self.inner.lock().state
    }

    pub(crate) fn set_state(&self, state: TxnState) {
        self.inner.lock().state = state;
    }

    pub(crate) fn add_lock(&self, id: LockDataId) {
        self.inner.lock().lock_set.insert(id);
    }

    /// Drains the held-lock set for release at commit/abort.
    pub(crate) fn take_locks(&self) -> Vec<LockDataId> {
        self.inner.lock().lock_set.drain().collect()
    }

    pub fn held_lock_count(&self) -> usize {
        self.inner.lock().lock_set.len()
    }

    /// Appends an undo entry. Callers append only after the mutation it
    /// reverts has succeeded.
    pub fn append_write(&self, record: WriteRecord) {
        self.inner.lock().write_set.push(record);
    }

    pub fn undo_len(&self) -> usize {
        self.inner.lock().write_set.len()
    }

    /// Drains the undo log (reverse replay happens at the caller).
    pub(crate) fn take_writes(&self) -> Vec<WriteRecord> {
        std::mem::take(&mut self.inner.lock().write_set)
    }
}

/// Lock manager plus one transaction: the per-operation context the
/// storage layers thread through their calls.
#[derive(Clone)]
pub struct Context {
    lock_mgr: Arc<LockManager>,
    txn: Arc<Transaction>,
}

impl Context {
    pub fn new(lock_mgr: Arc<LockManager>, txn: Arc<Transaction>) -> Self {
        Self { lock_mgr, txn }
    }

    pub fn txn(&self) -> &Arc<Transaction> {
        &self.txn
    }

    pub fn lock_mgr(&self) -> &Arc<LockManager> {
        &self.lock_mgr
    }

    pub fn lock_shared_record(&self, rid: Rid, fd: FileId) -> Result<()> {
        self.lock_mgr.lock_shared_on_record(&self.txn, rid, fd)?;
        Ok(())
    }

    pub fn lock_exclusive_record(&self, rid: Rid, fd: FileId) -> Result<()> {
        self.lock_mgr.lock_exclusive_on_record(&self.txn, rid, fd)?;
        Ok(())
    }

    pub fn lock_shared_table(&self, fd: FileId) -> Result<()> {
        self.lock_mgr.lock_shared_on_table(&self.txn, fd)?;
        Ok(())
    }

    pub fn lock_exclusive_table(&self, fd: FileId) -> Result<()> {
        self.lock_mgr.lock_exclusive_on_table(&self.txn, fd)?;
        Ok(())
    }

    pub fn lock_is_table(&self, fd: FileId) -> Result<()> {
        self.lock_mgr.lock_is_on_table(&self.txn, fd)?;
        Ok(())
    }

    pub fn lock_ix_table(&self, fd: FileId) -> Result<()> {
        self.lock_mgr.lock_ix_on_table(&self.txn, fd)?;
        Ok(())
    }

    pub fn append_write(&self, record: WriteRecord) {
        self.txn.append_write(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_transaction_is_growing_and_empty() {
        let txn = Transaction::new(1, 10);
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.start_ts(), 10);
        assert_eq!(txn.state(), TxnState::Growing);
        assert_eq!(txn.held_lock_count(), 0);
        assert_eq!(txn.undo_len(), 0);
    }

    #[test]
    fn undo_entries_drain_in_insertion_order() {
        let txn = Transaction::new(1, 1);
        txn.append_write(WriteRecord::Insert {
            table: "t".into(),
            rid: Rid::new(1, 0),
        });
        txn.append_write(WriteRecord::Delete {
            table: "t".into(),
            rid: Rid::new(1, 1),
            record: vec![0xAA],
        });
        assert_eq!(txn.undo_len(), 2);

        let writes = txn.take_writes();
        assert_eq!(writes.len(), 2);
        assert!(matches!(writes[0], WriteRecord::Insert { .. }));
        assert!(matches!(writes[1], WriteRecord::Delete { .. }));
        assert_eq!(txn.undo_len(), 0);
    }
}
