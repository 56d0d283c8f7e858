//! # Lock Manager
//!
//! Multi-granularity locking over tables and records in five modes, with
//! no-wait deadlock prevention: a request that cannot be granted
//! immediately fails with `DeadlockPrevention` and the caller rolls its
//! transaction back. Nothing ever waits, so no wait-for cycle can form.
//!
//! ## Compatibility Matrix
//!
//! ```text
//!        IS  IX   S   X  SIX
//!   IS    +   +   +   -   +
//!   IX    +   +   -   -   -
//!    S    +   -   +   -   -
//!    X    -   -   -   -   -
//!  SIX    +   -   -   -   -
//! ```
//!
//! ## Mode Strength
//!
//! Upgrades follow the partial order `X > SIX > {S, IX} > IS`. S and IX
//! are incomparable; a transaction holding one and requesting the other
//! is upgraded to their least upper bound, SIX.
//!
//! ## Protocol
//!
//! Every call runs under one manager-wide mutex. A request from a
//! SHRINKING transaction is rejected outright (strict 2PL). A request the
//! transaction already covers succeeds idempotently; otherwise an
//! in-place upgrade is attempted, permitted only when every *other*
//! granted request is compatible with the target mode. A brand-new
//! request is granted iff it is compatible with the queue's cached group
//! mode. Rejections leave the queue untouched.
//!
//! Intention discipline (IS on the table before S on a row, IX before X)
//! is the caller's obligation; the manager does not enforce it.

use hashbrown::HashMap;
use log::{debug, trace};
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::{Transaction, TxnId, TxnState};
use crate::errors::{AbortReason, DbError, Result};
use crate::storage::FileId;
use crate::types::Rid;

/// What a lock covers: a whole table or one record in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDataId {
    Table { fd: FileId },
    Record { fd: FileId, rid: Rid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    /// The compatibility matrix: may `self` (held) coexist with a
    /// `requested` lock from another transaction?
    pub fn compatible_with(self, requested: LockMode) -> bool {
        use LockMode::*;
        match (self, requested) {
            (IntentionShared, Exclusive) | (Exclusive, IntentionShared) => false,
            (IntentionShared, _) | (_, IntentionShared) => true,
            (IntentionExclusive, IntentionExclusive) => true,
            (Shared, Shared) => true,
            _ => false,
        }
    }

    /// Partial order on strength: does holding `self` already satisfy a
    /// request for `other`? S and IX are incomparable.
    pub fn covers(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (Exclusive, _) => true,
            (SharedIntentionExclusive, Exclusive) => false,
            (SharedIntentionExclusive, _) => true,
            (Shared, Shared) | (Shared, IntentionShared) => true,
            (IntentionExclusive, IntentionExclusive) | (IntentionExclusive, IntentionShared) => {
                true
            }
            (IntentionShared, IntentionShared) => true,
            _ => false,
        }
    }

    /// Least upper bound under the strength order. The only incomparable
    /// pair is {S, IX}, whose join is SIX.
    fn lub(self, other: LockMode) -> LockMode {
        if self.covers(other) {
            self
        } else if other.covers(self) {
            other
        } else {
            LockMode::SharedIntentionExclusive
        }
    }

    fn name(self) -> &'static str {
        use LockMode::*;
        match self {
            IntentionShared => "IS",
            IntentionExclusive => "IX",
            Shared => "S",
            SharedIntentionExclusive => "SIX",
            Exclusive => "X",
        }
    }
}

#[derive(Debug)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

/// All requests on one lock data id, plus the cached strongest granted
/// mode ("group mode"). Under no-wait every queued request is granted.
#[derive(Debug, Default)]
struct LockRequestQueue {
    requests: SmallVec<[LockRequest; 4]>,
    group_mode: Option<LockMode>,
}

impl LockRequestQueue {
    fn recompute_group_mode(&mut self) {
        self.group_mode = self
            .requests
            .iter()
            .filter(|r| r.granted)
            .map(|r| r.mode)
            .reduce(LockMode::lub);
    }
}

pub struct LockManager {
    table: Mutex<HashMap<LockDataId, LockRequestQueue>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_shared_on_record(&self, txn: &Transaction, rid: Rid, fd: FileId) -> Result<bool> {
        self.lock(txn, LockDataId::Record { fd, rid }, LockMode::Shared)
    }

    pub fn lock_exclusive_on_record(
        &self,
        txn: &Transaction,
        rid: Rid,
        fd: FileId,
    ) -> Result<bool> {
        self.lock(txn, LockDataId::Record { fd, rid }, LockMode::Exclusive)
    }

    pub fn lock_shared_on_table(&self, txn: &Transaction, fd: FileId) -> Result<bool> {
        self.lock(txn, LockDataId::Table { fd }, LockMode::Shared)
    }

    pub fn lock_exclusive_on_table(&self, txn: &Transaction, fd: FileId) -> Result<bool> {
        self.lock(txn, LockDataId::Table { fd }, LockMode::Exclusive)
    }

    pub fn lock_is_on_table(&self, txn: &Transaction, fd: FileId) -> Result<bool> {
        self.lock(txn, LockDataId::Table { fd }, LockMode::IntentionShared)
    }

    pub fn lock_ix_on_table(&self, txn: &Transaction, fd: FileId) -> Result<bool> {
        self.lock(txn, LockDataId::Table { fd }, LockMode::IntentionExclusive)
    }

    /// The one lock kernel behind every public entry point.
    fn lock(&self, txn: &Transaction, id: LockDataId, mode: LockMode) -> Result<bool> {
        if txn.state() == TxnState::Shrinking {
            return Err(DbError::TxnAbort {
                txn_id: txn.id(),
                reason: AbortReason::LockOnShrinking,
            });
        }

        let mut table = self.table.lock();
        let queue = table.entry(id).or_default();

        if let Some(pos) = queue
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id())
        {
            let held = queue.requests[pos].mode;
            if held.covers(mode) {
                trace!("txn {} re-enters {} on {:?}", txn.id(), mode.name(), id);
                return Ok(true);
            }

            // Upgrade in place to the join of held and requested mode,
            // permitted only when every other granted request tolerates
            // the target.
            let target = held.lub(mode);
            let upgradable = queue
                .requests
                .iter()
                .enumerate()
                .all(|(i, r)| i == pos || !r.granted || r.mode.compatible_with(target));
            if !upgradable {
                debug!(
                    "txn {} upgrade {} -> {} on {:?} denied",
                    txn.id(),
                    held.name(),
                    target.name(),
                    id
                );
                return Err(DbError::TxnAbort {
                    txn_id: txn.id(),
                    reason: AbortReason::DeadlockPrevention,
                });
            }
            queue.requests[pos].mode = target;
            queue.recompute_group_mode();
            trace!(
                "txn {} upgraded {} -> {} on {:?}",
                txn.id(),
                held.name(),
                target.name(),
                id
            );
            return Ok(true);
        }

        if let Some(group) = queue.group_mode {
            if !group.compatible_with(mode) {
                debug!(
                    "txn {} {} on {:?} denied (group mode {})",
                    txn.id(),
                    mode.name(),
                    id,
                    group.name()
                );
                return Err(DbError::TxnAbort {
                    txn_id: txn.id(),
                    reason: AbortReason::DeadlockPrevention,
                });
            }
        }

        queue.requests.push(LockRequest {
            txn_id: txn.id(),
            mode,
            granted: true,
        });
        queue.recompute_group_mode();
        txn.add_lock(id);
        trace!("txn {} granted {} on {:?}", txn.id(), mode.name(), id);
        Ok(true)
    }

    /// Releases the transaction's request on `id` and moves the
    /// transaction into the shrinking phase. Releasing a lock the
    /// transaction does not hold is a no-op returning `false`.
    pub fn unlock(&self, txn: &Transaction, id: LockDataId) -> bool {
        let mut table = self.table.lock();
        let Some(queue) = table.get_mut(&id) else {
            return false;
        };
        let Some(pos) = queue
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id())
        else {
            return false;
        };
        queue.requests.remove(pos);
        queue.recompute_group_mode();
        if queue.requests.is_empty() {
            table.remove(&id);
        }
        txn.set_state(TxnState::Shrinking);
        true
    }

    /// The strongest currently granted mode on `id`, if any.
    pub fn group_mode(&self, id: LockDataId) -> Option<LockMode> {
        self.table.lock().get(&id).and_then(|q| q.group_mode)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
