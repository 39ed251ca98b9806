//! Transaction Manager: txn lifecycle, write-set for rollback, and
//! commit/abort, built on the log manager and lock manager.
//!
//! This crate knows nothing about heap files or B+-trees. Its `abort`
//! path walks a transaction's write-set in reverse and asks an
//! [`AbortApplier`] — supplied by the engine, which does know about
//! tables and indexes — to physically invert each mutation. This mirrors
//! the storage engine specification's design note about replacing the
//! original's raw global managers with one `Engine` value that managers
//! borrow explicitly: the transaction manager borrows just enough of the
//! engine (through the trait) to undo a write, nothing more.

use common::{DbResult, Lsn, RecordId, TransactionId, NO_LSN};
use lockmgr::LockManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use wal::LogManager;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// One entry in a transaction's write-set, carrying exactly what its
/// inverse operation needs. Mirrors the corresponding `wal::LogRecordBody`
/// variant but does not carry the after-image for inserts — the inverse
/// of an insert is a delete by RID, which needs nothing else.
#[derive(Clone, Debug)]
pub enum WriteOp {
    Insert { rid: RecordId },
    Delete { rid: RecordId, before_image: Vec<u8> },
    Update { rid: RecordId, before_image: Vec<u8> },
}

#[derive(Clone, Debug)]
pub struct WriteSetEntry {
    pub table: String,
    pub op: WriteOp,
}

/// Supplies the physical inverse operations `abort` needs. Implemented by
/// the engine, which is the only layer that knows how to reach a table's
/// heap file and every index built over it.
pub trait AbortApplier {
    /// Inverse of an insert: delete the tuple (and its index entries).
    fn undo_insert(&self, table: &str, rid: RecordId) -> DbResult<()>;
    /// Inverse of a delete: reinsert the tuple (and its index entries).
    fn undo_delete(&self, table: &str, rid: RecordId, before_image: &[u8]) -> DbResult<()>;
    /// Inverse of an update: overwrite with the before-image (and repair
    /// any index entries the update moved).
    fn undo_update(&self, table: &str, rid: RecordId, before_image: &[u8]) -> DbResult<()>;
}

struct TxnEntry {
    state: TxnState,
    last_lsn: Lsn,
    write_set: Vec<WriteSetEntry>,
}

/// Owns every in-flight transaction's bookkeeping. One instance per open
/// database, shared by every connection thread.
pub struct TransactionManager {
    log: Arc<LogManager>,
    locks: Arc<LockManager>,
    next_txn_id: AtomicI64,
    txns: Mutex<HashMap<TransactionId, TxnEntry>>,
}

impl TransactionManager {
    pub fn new(log: Arc<LogManager>, locks: Arc<LockManager>) -> Self {
        Self {
            log,
            locks,
            next_txn_id: AtomicI64::new(1),
            txns: Mutex::new(HashMap::new()),
        }
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Reseeds the next-transaction-id counter. Called by the recovery
    /// manager after analyze, per the restart contract: next-id =
    /// observed-max + 1.
    pub fn set_next_txn_id(&self, next: TransactionId) {
        self.next_txn_id.store(next, Ordering::SeqCst);
    }

    /// Begin: allocates a txn id, writes a BEGIN log record, registers
    /// the transaction as Active.
    pub fn begin(&self) -> DbResult<TransactionId> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let lsn = self.log.append_begin(txn_id)?;
        self.txns.lock().unwrap().insert(
            txn_id,
            TxnEntry {
                state: TxnState::Active,
                last_lsn: lsn,
                write_set: Vec::new(),
            },
        );
        log::debug!("txn: began {txn_id}");
        Ok(txn_id)
    }

    fn last_lsn(&self, txn_id: TransactionId) -> Lsn {
        self.txns.lock().unwrap().get(&txn_id).map(|e| e.last_lsn).unwrap_or(NO_LSN)
    }

    pub fn record_insert(
        &self,
        txn_id: TransactionId,
        table: &str,
        rid: RecordId,
        after_image: &[u8],
    ) -> DbResult<Lsn> {
        let prev = self.last_lsn(txn_id);
        let lsn = self.log.append_insert(txn_id, prev, table, rid, after_image)?;
        let mut txns = self.txns.lock().unwrap();
        if let Some(entry) = txns.get_mut(&txn_id) {
            entry.last_lsn = lsn;
            entry.write_set.push(WriteSetEntry { table: table.to_string(), op: WriteOp::Insert { rid } });
        }
        Ok(lsn)
    }

    pub fn record_delete(
        &self,
        txn_id: TransactionId,
        table: &str,
        rid: RecordId,
        before_image: &[u8],
    ) -> DbResult<Lsn> {
        let prev = self.last_lsn(txn_id);
        let lsn = self.log.append_delete(txn_id, prev, table, rid, before_image)?;
        let mut txns = self.txns.lock().unwrap();
        if let Some(entry) = txns.get_mut(&txn_id) {
            entry.last_lsn = lsn;
            entry.write_set.push(WriteSetEntry {
                table: table.to_string(),
                op: WriteOp::Delete { rid, before_image: before_image.to_vec() },
            });
        }
        Ok(lsn)
    }

    pub fn record_update(
        &self,
        txn_id: TransactionId,
        table: &str,
        rid: RecordId,
        before_image: &[u8],
        after_image: &[u8],
    ) -> DbResult<Lsn> {
        let prev = self.last_lsn(txn_id);
        let lsn = self.log.append_update(txn_id, prev, table, rid, before_image, after_image)?;
        let mut txns = self.txns.lock().unwrap();
        if let Some(entry) = txns.get_mut(&txn_id) {
            entry.last_lsn = lsn;
            entry.write_set.push(WriteSetEntry {
                table: table.to_string(),
                op: WriteOp::Update { rid, before_image: before_image.to_vec() },
            });
        }
        Ok(lsn)
    }

    /// Commit: force-flushes the log up to and including a COMMIT record,
    /// releases every lock the transaction holds, and retires it.
    pub fn commit(&self, txn_id: TransactionId) -> DbResult<()> {
        let prev = self.last_lsn(txn_id);
        self.log.append_commit(txn_id, prev)?;
        self.locks.release_all(txn_id);
        if let Some(entry) = self.txns.lock().unwrap().get_mut(&txn_id) {
            entry.state = TxnState::Committed;
        }
        self.txns.lock().unwrap().remove(&txn_id);
        log::debug!("txn: committed {txn_id}");
        Ok(())
    }

    /// Abort: walks the write-set in reverse, asking `applier` to invert
    /// each entry, then writes a single ABORT record and releases locks.
    pub fn abort(&self, txn_id: TransactionId, applier: &dyn AbortApplier) -> DbResult<()> {
        let write_set = {
            let mut txns = self.txns.lock().unwrap();
            let Some(entry) = txns.get_mut(&txn_id) else {
                return Ok(()); // already retired; nothing to undo
            };
            entry.state = TxnState::Aborted;
            std::mem::take(&mut entry.write_set)
        };
        for entry in write_set.into_iter().rev() {
            match entry.op {
                WriteOp::Insert { rid } => applier.undo_insert(&entry.table, rid)?,
                WriteOp::Delete { rid, before_image } => applier.undo_delete(&entry.table, rid, &before_image)?,
                WriteOp::Update { rid, before_image } => applier.undo_update(&entry.table, rid, &before_image)?,
            }
        }
        let prev = self.last_lsn(txn_id);
        self.log.append_abort(txn_id, prev)?;
        self.locks.release_all(txn_id);
        self.txns.lock().unwrap().remove(&txn_id);
        log::debug!("txn: aborted {txn_id}");
        Ok(())
    }

    pub fn state(&self, txn_id: TransactionId) -> Option<TxnState> {
        self.txns.lock().unwrap().get(&txn_id).map(|e| e.state)
    }

    /// Snapshot of the Active Transaction Table for a checkpoint: every
    /// currently active transaction's id and last-LSN.
    pub fn att_snapshot(&self) -> Vec<(TransactionId, Lsn)> {
        self.txns
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.state == TxnState::Active)
            .map(|(id, e)| (*id, e.last_lsn))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    fn manager() -> (TransactionManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let log = Arc::new(LogManager::open(dir.path().join("db.log"), 4096).unwrap());
        let locks = Arc::new(LockManager::new());
        (TransactionManager::new(log, locks), dir)
    }

    #[derive(Default)]
    struct RecordingApplier {
        calls: StdMutex<RefCell<Vec<String>>>,
    }

    impl AbortApplier for RecordingApplier {
        fn undo_insert(&self, table: &str, rid: RecordId) -> DbResult<()> {
            self.calls.lock().unwrap().borrow_mut().push(format!("undo_insert {table} {rid:?}"));
            Ok(())
        }
        fn undo_delete(&self, table: &str, rid: RecordId, _before: &[u8]) -> DbResult<()> {
            self.calls.lock().unwrap().borrow_mut().push(format!("undo_delete {table} {rid:?}"));
            Ok(())
        }
        fn undo_update(&self, table: &str, rid: RecordId, _before: &[u8]) -> DbResult<()> {
            self.calls.lock().unwrap().borrow_mut().push(format!("undo_update {table} {rid:?}"));
            Ok(())
        }
    }

    #[test]
    fn begin_commit_retires_transaction() {
        let (mgr, _dir) = manager();
        let txn = mgr.begin().unwrap();
        assert_eq!(mgr.state(txn), Some(TxnState::Active));
        mgr.commit(txn).unwrap();
        assert_eq!(mgr.state(txn), None);
    }

    #[test]
    fn abort_undoes_write_set_in_reverse_order() {
        let (mgr, _dir) = manager();
        let txn = mgr.begin().unwrap();
        mgr.record_insert(txn, "t", RecordId::new(0, 0), b"r1").unwrap();
        mgr.record_insert(txn, "t", RecordId::new(0, 1), b"r2").unwrap();

        let applier = RecordingApplier::default();
        mgr.abort(txn, &applier).unwrap();

        let calls = applier.calls.lock().unwrap().borrow().clone();
        assert_eq!(
            calls,
            vec![
                "undo_insert t RecordId { page_no: 0, slot: 1 }".to_string(),
                "undo_insert t RecordId { page_no: 0, slot: 0 }".to_string(),
            ]
        );
        assert_eq!(mgr.state(txn), None);
    }

    #[test]
    fn att_snapshot_only_includes_active_transactions() {
        let (mgr, _dir) = manager();
        let t1 = mgr.begin().unwrap();
        let t2 = mgr.begin().unwrap();
        mgr.commit(t2).unwrap();
        let att = mgr.att_snapshot();
        assert_eq!(att.len(), 1);
        assert_eq!(att[0].0, t1);
    }

    #[test]
    fn locks_are_released_on_commit() {
        let (mgr, _dir) = manager();
        let txn = mgr.begin().unwrap();
        mgr.locks().lock_table(1, txn, lockmgr::LockMode::X).unwrap();
        mgr.commit(txn).unwrap();
        // A different, younger transaction can now take the same lock.
        mgr.locks().lock_table(1, txn + 1, lockmgr::LockMode::X).unwrap();
    }
}
