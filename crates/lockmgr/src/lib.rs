//! Lock Manager: table, record and gap locks with wait-die deadlock
//! avoidance, built around one condition variable per resource.
//!
//! Every request either succeeds immediately, upgrades in place (S→X
//! when the requester is the sole holder), or blocks on that resource's
//! condition variable. Deadlocks are never detected; they are *avoided*
//! by wait-die: an incoming request older than every conflicting holder
//! waits, a younger one aborts immediately with
//! [`common::DbError::TransactionAbort`]. Release is strict two-phase —
//! callers drop every lock a transaction holds in one call, at commit or
//! abort.

use common::{DbError, DbResult, Fd, Iid, RecordId, TransactionId};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

/// Lock modes. `Gap` and `InsertIntent` are not part of the
/// multi-granularity hierarchy; they exist solely to model the
/// non-hierarchical gap lock described in the storage engine
/// specification (an index-scan's gap lock blocks a conflicting insert's
/// momentary intent check, and nothing else).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockMode {
    IS,
    IX,
    S,
    X,
    Gap,
    InsertIntent,
}

/// The resource a lock request names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Resource {
    Table(Fd),
    Record(Fd, RecordId),
    Gap(Fd, Iid),
}

fn compatible(requested: LockMode, held: LockMode) -> bool {
    use LockMode::*;
    matches!(
        (requested, held),
        (IS, IS) | (IS, IX) | (IS, S) | (IX, IS) | (IX, IX) | (S, IS) | (S, S) | (Gap, Gap) | (InsertIntent, InsertIntent)
    )
}

#[derive(Default)]
struct ResourceState {
    holders: Vec<(TransactionId, LockMode)>,
}

struct ResourceLock {
    state: Mutex<ResourceState>,
    cvar: Condvar,
}

impl ResourceLock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ResourceState::default()),
            cvar: Condvar::new(),
        })
    }
}

/// Grants table/record/gap locks with wait-die deadlock avoidance.
pub struct LockManager {
    resources: Mutex<HashMap<Resource, Arc<ResourceLock>>>,
    held_by_txn: Mutex<HashMap<TransactionId, Vec<(Resource, LockMode)>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            held_by_txn: Mutex::new(HashMap::new()),
        }
    }

    fn resource_lock(&self, resource: Resource) -> Arc<ResourceLock> {
        self.resources
            .lock()
            .unwrap()
            .entry(resource)
            .or_insert_with(ResourceLock::new)
            .clone()
    }

    fn record_held(&self, txn: TransactionId, resource: Resource, mode: LockMode) {
        let mut held = self.held_by_txn.lock().unwrap();
        let entry = held.entry(txn).or_default();
        if let Some(slot) = entry.iter_mut().find(|(r, _)| *r == resource) {
            slot.1 = mode;
        } else {
            entry.push((resource, mode));
        }
    }

    /// Acquires `mode` on `resource` for `txn`, blocking (wait-die) on
    /// conflicts. Returns [`DbError::TransactionAbort`] if `txn` is wounded.
    pub fn acquire(&self, resource: Resource, txn: TransactionId, mode: LockMode) -> DbResult<()> {
        let res_lock = self.resource_lock(resource);
        let mut state = res_lock.state.lock().unwrap();
        loop {
            let existing_idx = state.holders.iter().position(|(id, _)| *id == txn);
            if let Some(idx) = existing_idx {
                let held_mode = state.holders[idx].1;
                if held_mode == mode {
                    return Ok(());
                }
                // S -> X upgrade, only legal when this txn is the sole holder.
                if held_mode == LockMode::S && mode == LockMode::X && state.holders.len() == 1 {
                    state.holders[idx].1 = LockMode::X;
                    drop(state);
                    self.record_held(txn, resource, LockMode::X);
                    log::debug!("lockmgr: txn {txn} upgraded S->X on {resource:?}");
                    return Ok(());
                }
            }

            let conflicting: Vec<TransactionId> = state
                .holders
                .iter()
                .enumerate()
                .filter(|(i, (id, held))| Some(*i) != existing_idx && *id != txn && !compatible(mode, *held))
                .map(|(_, (id, _))| *id)
                .collect();

            if conflicting.is_empty() {
                match existing_idx {
                    Some(idx) => state.holders[idx].1 = mode,
                    None => state.holders.push((txn, mode)),
                }
                drop(state);
                self.record_held(txn, resource, mode);
                log::debug!("lockmgr: txn {txn} granted {mode:?} on {resource:?}");
                return Ok(());
            }

            // wait-die: the requester is older than every conflicting
            // holder (lower id) -> wait; otherwise it is wounded.
            if conflicting.iter().all(|&holder| txn < holder) {
                log::debug!("lockmgr: txn {txn} waits for {mode:?} on {resource:?} (held by {conflicting:?})");
                state = res_lock.cvar.wait(state).unwrap();
                continue;
            }
            log::debug!("lockmgr: txn {txn} wounded requesting {mode:?} on {resource:?} (held by {conflicting:?})");
            return Err(DbError::TransactionAbort(txn));
        }
    }

    fn release_one(&self, resource: Resource, txn: TransactionId) {
        let res_lock = self.resource_lock(resource);
        let mut state = res_lock.state.lock().unwrap();
        state.holders.retain(|(id, _)| *id != txn);
        drop(state);
        res_lock.cvar.notify_all();
    }

    /// Acquires the table intention lock a record lock requires (IS for
    /// S, IX for X) if the transaction does not already hold it, then
    /// the record lock itself.
    pub fn lock_record(&self, fd: Fd, rid: RecordId, txn: TransactionId, mode: LockMode) -> DbResult<()> {
        let intention = match mode {
            LockMode::S => LockMode::IS,
            LockMode::X => LockMode::IX,
            other => return Err(DbError::LockRequestIllegal(format!("{other:?} is not a valid record lock mode"))),
        };
        self.acquire(Resource::Table(fd), txn, intention)?;
        self.acquire(Resource::Record(fd, rid), txn, mode)
    }

    pub fn lock_table(&self, fd: Fd, txn: TransactionId, mode: LockMode) -> DbResult<()> {
        self.acquire(Resource::Table(fd), txn, mode)
    }

    /// Acquires a gap lock at `iid`, shared among every transaction that
    /// observed this range (multiple concurrent scanners may each hold
    /// one). Held until the transaction commits or aborts.
    pub fn lock_gap(&self, fd: Fd, iid: Iid, txn: TransactionId) -> DbResult<()> {
        self.acquire(Resource::Gap(fd, iid), txn, LockMode::Gap)
    }

    /// Momentarily checks whether any other transaction holds a gap lock
    /// at `iid`; blocks (or dies) exactly like any other lock request,
    /// but releases immediately instead of being held until commit — an
    /// insert does not itself protect a gap, it only respects one.
    pub fn check_insert_gap(&self, fd: Fd, iid: Iid, txn: TransactionId) -> DbResult<()> {
        self.acquire(Resource::Gap(fd, iid), txn, LockMode::InsertIntent)?;
        self.release_one(Resource::Gap(fd, iid), txn);
        let mut held = self.held_by_txn.lock().unwrap();
        if let Some(entry) = held.get_mut(&txn) {
            entry.retain(|(r, m)| !(*r == Resource::Gap(fd, iid) && *m == LockMode::InsertIntent));
        }
        Ok(())
    }

    /// Strict 2PL release: drops every lock `txn` holds, across every
    /// resource kind, and wakes anyone waiting on them.
    pub fn release_all(&self, txn: TransactionId) {
        let held = self.held_by_txn.lock().unwrap().remove(&txn).unwrap_or_default();
        for (resource, _) in held {
            self.release_one(resource, txn);
        }
        log::debug!("lockmgr: txn {txn} released all locks");
    }

    /// Locks currently held by `txn`, for diagnostics and tests.
    pub fn held_locks(&self, txn: TransactionId) -> Vec<(Resource, LockMode)> {
        self.held_by_txn.lock().unwrap().get(&txn).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn compatible_is_shared_x_exclusive() {
        let lm = LockManager::new();
        lm.lock_table(1, 10, LockMode::S).unwrap();
        lm.lock_table(1, 20, LockMode::S).unwrap();
        assert_eq!(lm.held_locks(10).len(), 1);
        assert_eq!(lm.held_locks(20).len(), 1);
    }

    #[test]
    fn s_then_x_upgrades_for_sole_holder() {
        let lm = LockManager::new();
        lm.acquire(Resource::Record(1, RecordId::new(0, 0)), 5, LockMode::S).unwrap();
        lm.acquire(Resource::Record(1, RecordId::new(0, 0)), 5, LockMode::X).unwrap();
        let locks = lm.held_locks(5);
        assert_eq!(locks, vec![(Resource::Record(1, RecordId::new(0, 0)), LockMode::X)]);
    }

    #[test]
    fn younger_requester_dies_on_conflict() {
        let lm = LockManager::new();
        lm.acquire(Resource::Table(1), 10, LockMode::X).unwrap();
        let err = lm.acquire(Resource::Table(1), 20, LockMode::S).unwrap_err();
        assert!(matches!(err, DbError::TransactionAbort(20)));
    }

    #[test]
    fn older_requester_waits_then_succeeds_after_release() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(Resource::Table(1), 20, LockMode::X).unwrap();

        let waiter = {
            let lm = lm.clone();
            thread::spawn(move || lm.acquire(Resource::Table(1), 10, LockMode::S))
        };
        thread::sleep(Duration::from_millis(50));
        lm.release_all(20);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn gap_lock_blocks_conflicting_insert_intent() {
        let lm = Arc::new(LockManager::new());
        let iid = Iid::new(3, 0);
        // Txn 100 (the scanner) observes the range and holds a gap lock.
        lm.lock_gap(1, iid, 100).unwrap();
        // A younger inserter dies immediately (wait-die).
        let err = lm.check_insert_gap(1, iid, 200).unwrap_err();
        assert!(matches!(err, DbError::TransactionAbort(200)));

        // An older inserter waits until the scanner releases, then proceeds.
        let lm2 = lm.clone();
        let waiter = thread::spawn(move || lm2.check_insert_gap(1, iid, 50));
        thread::sleep(Duration::from_millis(50));
        lm.release_all(100);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn two_scanners_hold_gap_locks_concurrently() {
        let lm = LockManager::new();
        let iid = Iid::new(1, 2);
        lm.lock_gap(9, iid, 1).unwrap();
        lm.lock_gap(9, iid, 2).unwrap();
        assert_eq!(lm.held_locks(1).len(), 1);
        assert_eq!(lm.held_locks(2).len(), 1);
    }

    #[test]
    fn release_all_wakes_every_waiter() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(Resource::Table(7), 5, LockMode::IX).unwrap();
        let waiter = {
            let lm = lm.clone();
            thread::spawn(move || lm.acquire(Resource::Table(7), 1, LockMode::S))
        };
        thread::sleep(Duration::from_millis(30));
        lm.release_all(5);
        assert!(waiter.join().unwrap().is_ok());
    }
}
