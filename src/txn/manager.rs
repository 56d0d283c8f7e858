//! # Transaction Manager
//!
//! Allocates transaction ids and start timestamps from atomic counters,
//! keeps the process-wide registry of live transactions, and drives the
//! two terminal transitions: commit (discard undo, release locks) and
//! abort (replay undo in reverse, release locks).
//!
//! The registry is consulted only by `begin` and by id lookups; commit
//! and abort work purely on the handle they are given. Its lifecycle is
//! bound to the owning engine instance, so tests get a fresh registry
//! per instance.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use log::debug;
use parking_lot::Mutex;

use super::{LockManager, Transaction, TxnId, TxnState, WriteRecord};
use crate::errors::Result;
use crate::system::Catalog;

pub struct TransactionManager {
    next_txn_id: AtomicU32,
    next_ts: AtomicU32,
    lock_mgr: Arc<LockManager>,
    txn_map: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_mgr: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            next_ts: AtomicU32::new(1),
            lock_mgr,
            txn_map: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_mgr(&self) -> &Arc<LockManager> {
        &self.lock_mgr
    }

    /// Starts a fresh transaction in the growing phase and registers it.
    pub fn begin(&self) -> Arc<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let start_ts = self.next_ts.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(id, start_ts));
        self.txn_map.lock().insert(id, Arc::clone(&txn));
        debug!("txn {id} began (ts={start_ts})");
        txn
    }

    /// Registers an externally held transaction handle and (re)enters the
    /// growing phase.
    pub fn begin_with(&self, txn: Arc<Transaction>) -> Arc<Transaction> {
        self.txn_map.lock().insert(txn.id(), Arc::clone(&txn));
        txn.set_state(TxnState::Growing);
        txn
    }

    /// Looks up a live transaction by id.
    pub fn transaction(&self, id: TxnId) -> Option<Arc<Transaction>> {
        self.txn_map.lock().get(&id).cloned()
    }

    /// Commits: the undo log is discarded, every held lock is released,
    /// and the transaction ends COMMITTED.
    pub fn commit(&self, txn: &Transaction) -> Result<()> {
        let discarded = txn.take_writes().len();
        for id in txn.take_locks() {
            self.lock_mgr.unlock(txn, id);
        }
        txn.set_state(TxnState::Committed);
        debug!("txn {} committed ({discarded} undo entries dropped)", txn.id());
        Ok(())
    }

    /// Aborts: the undo log is replayed newest-first through the heap
    /// files (resolved via the catalog), then every held lock is
    /// released and the transaction ends ABORTED.
    ///
    /// Replay passes no context, so it neither takes locks nor appends
    /// further undo entries.
    pub fn abort(&self, txn: &Transaction, catalog: &Catalog) -> Result<()> {
        let writes = txn.take_writes();
        let replayed = writes.len();
        for write in writes.into_iter().rev() {
            match write {
                WriteRecord::Insert { table, rid } => {
                    catalog.table(&table)?.heap().delete(None, rid)?;
                }
                WriteRecord::Delete { table, rid, record } => {
                    catalog.table(&table)?.heap().insert_at(rid, &record)?;
                }
                WriteRecord::Update {
                    table,
                    rid,
                    old_record,
                } => {
                    catalog.table(&table)?.heap().update(None, rid, &old_record)?;
                }
            }
        }
        for id in txn.take_locks() {
            self.lock_mgr.unlock(txn, id);
        }
        txn.set_state(TxnState::Aborted);
        debug!("txn {} aborted ({replayed} undo entries replayed)", txn.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::LockDataId;
    use crate::types::Rid;

    #[test]
    fn begin_allocates_monotonic_ids() {
        let mgr = TransactionManager::new(Arc::new(LockManager::new()));
        let a = mgr.begin();
        let b = mgr.begin();
        assert!(b.id() > a.id());
        assert!(b.start_ts() > a.start_ts());
        assert_eq!(a.state(), TxnState::Growing);
        assert!(mgr.transaction(a.id()).is_some());
        assert!(mgr.transaction(999).is_none());
    }

    #[test]
    fn commit_releases_locks_and_discards_undo() {
        let lock_mgr = Arc::new(LockManager::new());
        let mgr = TransactionManager::new(Arc::clone(&lock_mgr));
        let txn = mgr.begin();

        let rid = Rid::new(1, 0);
        lock_mgr.lock_exclusive_on_record(&txn, rid, 0).unwrap();
        txn.append_write(WriteRecord::Insert {
            table: "t".into(),
            rid,
        });

        mgr.commit(&txn).unwrap();
        assert_eq!(txn.state(), TxnState::Committed);
        assert_eq!(txn.held_lock_count(), 0);
        assert_eq!(txn.undo_len(), 0);
        assert_eq!(lock_mgr.group_mode(LockDataId::Record { fd: 0, rid }), None);

        // The record lock is free for the next transaction.
        let other = mgr.begin();
        assert!(lock_mgr.lock_exclusive_on_record(&other, rid, 0).is_ok());
    }
}
