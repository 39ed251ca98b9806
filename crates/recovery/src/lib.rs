//! Recovery Manager: ARIES-style three-phase restart (analyze, redo,
//! undo), run once at server startup before any client connection is
//! accepted.
//!
//! Unlike a live transaction's [`txn::TransactionManager::abort`], there is
//! no in-memory write-set to replay here — only the log and the tables and
//! indexes on disk. Analyze rebuilds the Active Transaction Table and
//! Dirty Page Table from the most recent checkpoint (or log start); redo
//! reapplies logged mutations an evicted/crashed page never saw, guarded
//! by LSN comparison so nothing is redone twice; undo walks every loser
//! transaction's chain in reverse, physically inverting each write against
//! both the table and its indexes, and mints a fresh ABORT record per
//! transaction since this engine writes no CLRs.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use btree::BTreeIndex;
use buffer::BufferPoolManager;
use catalog::{Catalog, IndexMeta, TableMeta};
use common::{DbError, DbResult, Fd, Lsn, PageId, PageNo, TransactionId, INVALID_TXN_ID, NO_LSN};
use heap::HeapFile;
use storage::page::{read_lsn, write_lsn};
use storage::{tuple, DiskManager};
use types::Value;
use wal::{read_log_file, read_restart_file, LogManager, LogRecord, LogRecordBody};

/// What the caller must reseed its live `TransactionManager` with once
/// recovery returns. The log manager's own next-LSN counter is reseeded
/// internally, before undo mints any fresh ABORT records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveredState {
    pub next_txn_id: TransactionId,
}

/// Opens (and caches) the heap files and index files recovery touches, so
/// repeated log records against the same table reuse one open fd instead
/// of reopening it per record.
struct OpenFiles {
    disk: Arc<DiskManager>,
    pool: Arc<BufferPoolManager>,
    heaps: HashMap<String, Arc<HeapFile>>,
    indexes: HashMap<String, Arc<BTreeIndex>>,
}

impl OpenFiles {
    fn new(disk: Arc<DiskManager>, pool: Arc<BufferPoolManager>) -> Self {
        Self {
            disk,
            pool,
            heaps: HashMap::new(),
            indexes: HashMap::new(),
        }
    }

    fn heap(&mut self, table: &str) -> DbResult<Arc<HeapFile>> {
        if let Some(h) = self.heaps.get(table) {
            return Ok(h.clone());
        }
        let fd = self.disk.open_file(table)?;
        let h = Arc::new(HeapFile::open(self.pool.clone(), fd)?);
        self.heaps.insert(table.to_string(), h.clone());
        Ok(h)
    }

    fn index(&mut self, meta: &IndexMeta) -> DbResult<Arc<BTreeIndex>> {
        if let Some(idx) = self.indexes.get(&meta.name) {
            return Ok(idx.clone());
        }
        let fd = self.disk.open_file(&meta.file_name())?;
        let idx = Arc::new(BTreeIndex::open(self.pool.clone(), fd, meta.key_schema.clone())?);
        self.indexes.insert(meta.name.clone(), idx.clone());
        Ok(idx)
    }

    /// Drops an index file's contents and rebuilds it by scanning the
    /// owning table's heap file: indexes are never redone per-log-record,
    /// only drop-and-recreated once redo finishes touching a table.
    fn rebuild_index(&mut self, table: &TableMeta, meta: &IndexMeta) -> DbResult<()> {
        let name = meta.file_name();
        if let Some(idx) = self.indexes.remove(&meta.name) {
            let fd = idx.fd();
            drop(idx);
            self.pool.remove_all_pages(fd);
            self.disk.close_file(fd)?;
        }
        if self.disk.is_file(&name) {
            self.disk.destroy_file(&name)?;
        }
        self.disk.create_file(&name)?;
        let fd = self.disk.open_file(&name)?;
        let index = BTreeIndex::create(self.pool.clone(), fd, meta.key_schema.clone())?;

        let heap = self.heap(&table.name)?;
        let schema = table.schema.sql_types();
        for entry in heap.scan()? {
            let (rid, bytes) = entry?;
            let values = tuple::decode(&bytes, &schema)?;
            let key: Vec<Value> = meta.key_attrs.iter().map(|&i| values[i as usize].clone()).collect();
            index.insert_entry(&key, rid)?;
        }
        log::info!("recovery: rebuilt index '{}' on table '{}'", meta.name, table.name);
        self.indexes.insert(meta.name.clone(), Arc::new(index));
        Ok(())
    }
}

fn page_lsn(pool: &Arc<BufferPoolManager>, fd: Fd, page_no: PageNo) -> DbResult<Lsn> {
    let guard = pool
        .fetch_page(PageId::new(fd, page_no))?
        .ok_or(DbError::PageNotExist { fd, page_no })?;
    Ok(read_lsn(&guard.read()))
}

fn stamp_page_lsn(pool: &Arc<BufferPoolManager>, fd: Fd, page_no: PageNo, lsn: Lsn) -> DbResult<()> {
    let mut guard = pool
        .fetch_page(PageId::new(fd, page_no))?
        .ok_or(DbError::PageNotExist { fd, page_no })?;
    write_lsn(&mut guard.write(), lsn);
    Ok(())
}

/// Runs the full analyze/redo/undo restart sequence against `db_dir`'s
/// `db.log` and `db.restart`. `catalog` must already be loaded (its tables
/// are looked up by name as the log is replayed); `disk` and `pool` should
/// be freshly constructed, with nothing open yet. On return, every table
/// and index file is left open and consistent, `log`'s next-LSN counter
/// has been reseeded, and the caller must reseed its `TransactionManager`
/// with the returned `next_txn_id`.
pub fn recover(
    db_dir: &Path,
    disk: Arc<DiskManager>,
    pool: Arc<BufferPoolManager>,
    log: &LogManager,
    catalog: &Catalog,
) -> DbResult<RecoveredState> {
    let records = read_log_file(db_dir.join("db.log"))?;
    if records.is_empty() {
        log::info!("recovery: empty log, nothing to recover");
        return Ok(RecoveredState { next_txn_id: 1 });
    }

    let max_lsn = records.iter().map(|r| r.lsn).max().unwrap_or(NO_LSN);
    let max_txn_id = records
        .iter()
        .filter(|r| r.txn_id != INVALID_TXN_ID)
        .map(|r| r.txn_id)
        .max()
        .unwrap_or(INVALID_TXN_ID);
    let by_lsn: HashMap<Lsn, &LogRecord> = records.iter().map(|r| (r.lsn, r)).collect();

    // ---- Analyze ----
    let checkpoint_lsn = read_restart_file(db_dir.join("db.restart"))?;
    let mut att: HashMap<TransactionId, Lsn> = HashMap::new();
    let mut aborted: HashSet<TransactionId> = HashSet::new();
    let mut dpt: HashMap<(String, PageNo), Lsn> = HashMap::new();

    let start_idx = checkpoint_lsn
        .and_then(|lsn| records.iter().position(|r| r.lsn == lsn))
        .map(|pos| {
            if let LogRecordBody::Checkpoint { att: a, aborted: ab, dpt: d, .. } = &records[pos].body {
                att.extend(a.iter().copied());
                aborted.extend(ab.iter().copied());
                dpt.extend(d.iter().map(|(t, p, l)| ((t.clone(), *p), *l)));
            }
            pos + 1
        })
        .unwrap_or(0);

    for record in &records[start_idx..] {
        match &record.body {
            LogRecordBody::Begin => {
                att.insert(record.txn_id, record.lsn);
            }
            LogRecordBody::Commit => {
                att.remove(&record.txn_id);
                aborted.remove(&record.txn_id);
            }
            // No CLRs are written, so an abort that crashed mid-undo must
            // be undone again; keep it in the ATT rather than removing it.
            LogRecordBody::Abort => {
                aborted.insert(record.txn_id);
            }
            LogRecordBody::Insert { table, rid, .. }
            | LogRecordBody::Delete { table, rid, .. }
            | LogRecordBody::Update { table, rid, .. } => {
                att.insert(record.txn_id, record.lsn);
                dpt.entry((table.clone(), rid.page_no)).or_insert(record.lsn);
            }
            LogRecordBody::Checkpoint { att: a, aborted: ab, dpt: d, .. } => {
                att.clear();
                att.extend(a.iter().copied());
                aborted.clear();
                aborted.extend(ab.iter().copied());
                dpt.clear();
                dpt.extend(d.iter().map(|(t, p, l)| ((t.clone(), *p), *l)));
            }
        }
    }
    let already_aborted = att.keys().filter(|txn| aborted.contains(txn)).count();
    log::info!(
        "recovery: analyze found {} loser txn(s) ({} already mid-abort), {} dirty page(s)",
        att.len(),
        already_aborted,
        dpt.len()
    );

    // The log's LSN counter must be strictly ahead of every record on disk
    // before undo starts minting fresh ABORT records.
    log.set_next_lsn(max_lsn + 1);

    // ---- Redo ----
    let mut open = OpenFiles::new(disk.clone(), pool.clone());
    let mut redone_tables: HashSet<String> = HashSet::new();

    if let Some(&min_rec_lsn) = dpt.values().min() {
        for record in records.iter().filter(|r| r.lsn >= min_rec_lsn) {
            let (table, page_no) = match &record.body {
                LogRecordBody::Insert { table, rid, .. }
                | LogRecordBody::Delete { table, rid, .. }
                | LogRecordBody::Update { table, rid, .. } => (table.clone(), rid.page_no),
                _ => continue,
            };
            let Some(&rec_lsn) = dpt.get(&(table.clone(), page_no)) else {
                continue; // page was never dirtied: nothing to redo
            };
            if rec_lsn > record.lsn {
                continue; // page wasn't dirty yet at this point in the log
            }
            let heap = open.heap(&table)?;
            if page_lsn(&pool, heap.fd(), page_no)? >= record.lsn {
                continue; // page-LSN already reflects this record
            }
            match &record.body {
                LogRecordBody::Insert { rid, after_image, .. } => {
                    heap.insert_tuple_at(*rid, after_image)?;
                }
                LogRecordBody::Delete { rid, .. } => {
                    heap.delete_tuple(*rid)?;
                }
                LogRecordBody::Update { rid, after_image, .. } => {
                    heap.update_tuple_in_place(*rid, after_image, None)?;
                }
                _ => unreachable!("filtered to data-bearing records above"),
            }
            stamp_page_lsn(&pool, heap.fd(), page_no, record.lsn)?;
            redone_tables.insert(table);
        }
    }

    for table_name in &redone_tables {
        if let Ok(table) = catalog.table(table_name) {
            for index in &table.indexes {
                open.rebuild_index(table, index)?;
            }
        }
    }
    log::info!("recovery: redo touched {} table(s)", redone_tables.len());

    // ---- Undo ----
    let mut queue: BinaryHeap<(Lsn, TransactionId)> = att.iter().map(|(&txn, &lsn)| (lsn, txn)).collect();
    let mut abort_lsn_of: HashMap<TransactionId, Lsn> = HashMap::new();

    while let Some((lsn, txn)) = queue.pop() {
        let record = *by_lsn
            .get(&lsn)
            .ok_or_else(|| DbError::Internal(format!("recovery: no log record for lsn {lsn}")))?;

        let abort_lsn = match abort_lsn_of.get(&txn) {
            Some(&l) => l,
            None => {
                let new_lsn = log.append_abort(txn, lsn)?;
                log::debug!("recovery: undo emitting fresh ABORT for txn {txn} at lsn {new_lsn}");
                abort_lsn_of.insert(txn, new_lsn);
                new_lsn
            }
        };

        match &record.body {
            LogRecordBody::Insert { table, rid, after_image } => {
                let heap = open.heap(table)?;
                heap.delete_tuple(*rid)?;
                if let Ok(meta) = catalog.table(table) {
                    let schema = meta.schema.sql_types();
                    let values = tuple::decode(after_image, &schema)?;
                    for index in &meta.indexes {
                        let key: Vec<Value> = index.key_attrs.iter().map(|&i| values[i as usize].clone()).collect();
                        open.index(index)?.delete_entry(&key)?;
                    }
                }
                stamp_page_lsn(&pool, heap.fd(), rid.page_no, abort_lsn)?;
            }
            LogRecordBody::Delete { table, rid, before_image } => {
                let heap = open.heap(table)?;
                heap.reinsert_tuple(*rid)?;
                if let Ok(meta) = catalog.table(table) {
                    let schema = meta.schema.sql_types();
                    let values = tuple::decode(before_image, &schema)?;
                    for index in &meta.indexes {
                        let key: Vec<Value> = index.key_attrs.iter().map(|&i| values[i as usize].clone()).collect();
                        open.index(index)?.insert_entry(&key, *rid)?;
                    }
                }
                stamp_page_lsn(&pool, heap.fd(), rid.page_no, abort_lsn)?;
            }
            LogRecordBody::Update { table, rid, before_image, after_image } => {
                let heap = open.heap(table)?;
                heap.restore_tuple(*rid, before_image)?;
                if let Ok(meta) = catalog.table(table) {
                    let schema = meta.schema.sql_types();
                    let before_values = tuple::decode(before_image, &schema)?;
                    let after_values = tuple::decode(after_image, &schema)?;
                    for index in &meta.indexes {
                        let before_key: Vec<Value> =
                            index.key_attrs.iter().map(|&i| before_values[i as usize].clone()).collect();
                        let after_key: Vec<Value> =
                            index.key_attrs.iter().map(|&i| after_values[i as usize].clone()).collect();
                        if before_key != after_key {
                            let idx = open.index(index)?;
                            idx.delete_entry(&after_key)?;
                            idx.insert_entry(&before_key, *rid)?;
                        }
                    }
                }
                stamp_page_lsn(&pool, heap.fd(), rid.page_no, abort_lsn)?;
            }
            LogRecordBody::Begin | LogRecordBody::Commit | LogRecordBody::Abort | LogRecordBody::Checkpoint { .. } => {
                // Nothing physical to invert; just keep walking the chain.
            }
        }

        if record.prev_lsn == NO_LSN {
            log.flush()?;
            log::debug!("recovery: undo finished txn {txn}");
        } else {
            queue.push((record.prev_lsn, txn));
        }
    }

    Ok(RecoveredState {
        next_txn_id: max_txn_id + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::PageId;
    use tempfile::tempdir;
    use types::SqlType;

    fn schema() -> Vec<(String, SqlType)> {
        vec![("id".to_string(), SqlType::Int32), ("name".to_string(), SqlType::Varchar(16))]
    }

    #[test]
    fn uncommitted_insert_is_undone_after_restart() {
        let dir = tempdir().unwrap();
        let db_dir = dir.path();
        let disk = Arc::new(DiskManager::new(db_dir));
        disk.create_dir().unwrap();

        let mut catalog = Catalog::new("test");
        catalog.create_table("t", schema()).unwrap();
        disk.create_file("t").unwrap();

        let log = LogManager::open(db_dir.join("db.log"), 4096).unwrap();
        let row_schema = catalog.table("t").unwrap().schema.sql_types();
        let row = vec![Value::Int32(1), Value::Varchar("a".to_string())];
        let bytes = tuple::encode(&row, &row_schema).unwrap();

        let rid = {
            let pool = BufferPoolManager::new(8, disk.clone());
            let fd = disk.open_file("t").unwrap();
            let heap = HeapFile::create(pool.clone(), fd).unwrap();

            let begin_lsn = log.append_begin(7).unwrap();
            let rid = heap.insert_tuple(&bytes).unwrap();
            let insert_lsn = log.append_insert(7, begin_lsn, "t", rid, &bytes).unwrap();
            // Crash right after the insert: the page is dirtied and logged
            // but never flushed, and no COMMIT record is ever written.
            let mut guard = pool.fetch_page(PageId::new(fd, rid.page_no)).unwrap().unwrap();
            write_lsn(&mut guard.write(), insert_lsn);
            drop(guard);
            pool.flush_all_dirty().unwrap();
            log.flush().unwrap();
            disk.close_file(fd).unwrap();
            rid
        };

        let disk2 = Arc::new(DiskManager::new(db_dir));
        let pool2 = BufferPoolManager::new(8, disk2.clone());
        let recovered = recover(db_dir, disk2.clone(), pool2.clone(), &log, &catalog).unwrap();
        assert_eq!(recovered.next_txn_id, 8);

        let fd = disk2.open_file("t").unwrap();
        let heap = HeapFile::open(pool2, fd).unwrap();
        assert!(heap.get_tuple_meta(rid).unwrap().is_deleted);
    }

    #[test]
    fn committed_insert_survives_restart_via_redo() {
        let dir = tempdir().unwrap();
        let db_dir = dir.path();
        let disk = Arc::new(DiskManager::new(db_dir));
        disk.create_dir().unwrap();

        let mut catalog = Catalog::new("test");
        catalog.create_table("t", schema()).unwrap();
        disk.create_file("t").unwrap();

        let log = LogManager::open(db_dir.join("db.log"), 4096).unwrap();
        let row_schema = catalog.table("t").unwrap().schema.sql_types();
        let row = vec![Value::Int32(9), Value::Varchar("z".to_string())];
        let bytes = tuple::encode(&row, &row_schema).unwrap();

        let rid = {
            // Use a fresh (never-flushed) buffer pool to model a commit
            // whose dirty page hadn't reached disk when the process died.
            let pool = BufferPoolManager::new(8, disk.clone());
            let fd = disk.open_file("t").unwrap();
            let heap = HeapFile::create(pool.clone(), fd).unwrap();

            let begin_lsn = log.append_begin(3).unwrap();
            let rid = heap.insert_tuple(&bytes).unwrap();
            let insert_lsn = log.append_insert(3, begin_lsn, "t", rid, &bytes).unwrap();
            log.append_commit(3, insert_lsn).unwrap();
            // The file header page (page 0) is flushed so the heap file's
            // page count survives, but the data page itself is not — the
            // crash happens before the buffer pool writes it back.
            disk.write_page(fd, 0, &{
                let guard = pool.fetch_page(PageId::new(fd, 0)).unwrap().unwrap();
                guard.read().clone()
            })
            .unwrap();
            disk.close_file(fd).unwrap();
            rid
        };

        let disk2 = Arc::new(DiskManager::new(db_dir));
        let pool2 = BufferPoolManager::new(8, disk2.clone());
        let recovered = recover(db_dir, disk2.clone(), pool2.clone(), &log, &catalog).unwrap();
        assert_eq!(recovered.next_txn_id, 4);

        let fd = disk2.open_file("t").unwrap();
        let heap = HeapFile::open(pool2, fd).unwrap();
        let (meta, tuple_bytes) = heap.get_tuple(rid).unwrap();
        assert!(!meta.is_deleted);
        assert_eq!(tuple_bytes, bytes);
    }

    #[test]
    fn empty_log_recovers_trivially() {
        let dir = tempdir().unwrap();
        let db_dir = dir.path();
        let disk = Arc::new(DiskManager::new(db_dir));
        disk.create_dir().unwrap();
        let pool = BufferPoolManager::new(4, disk.clone());
        let log = LogManager::open(db_dir.join("db.log"), 4096).unwrap();
        let catalog = Catalog::new("test");

        let recovered = recover(db_dir, disk, pool, &log, &catalog).unwrap();
        assert_eq!(recovered.next_txn_id, 1);
    }
}
