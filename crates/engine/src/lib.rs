//! The engine ties every storage-engine component into one value:
//! disk manager, buffer pool, heap files, B+-tree indexes, catalog, lock
//! manager, log manager, transaction manager, and the recovery manager
//! that runs once at open time.
//!
//! This replaces raw global manager pointers reached through process-wide
//! singletons (`DiskManager *`, `BufferPoolManager *`, and friends) with
//! one `Arc<Engine>` that every connection thread shares
//! and every manager borrows explicitly. The transaction manager in
//! particular knows nothing about tables or indexes; it reaches back into
//! the engine only through the narrow [`txn::AbortApplier`] seam (see
//! `abort.rs`).

mod abort;
mod dml;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use btree::BTreeIndex;
use buffer::BufferPoolManager;
use catalog::Catalog;
use common::{Config, DbError, DbResult, Fd, Lsn, PageNo, TransactionId};
use heap::HeapFile;
use lockmgr::LockManager;
use storage::DiskManager;
use txn::TransactionManager;
use types::SqlType;
use wal::LogManager;

pub use dml::IndexBound;

/// One entry in the engine's live Dirty Page Table: which table a dirtied
/// page belongs to, and the LSN of the first log record that dirtied it.
/// Never pruned for the life of the process — the buffer pool evicts
/// pages without telling the engine, so an entry here can outlive the
/// page actually being clean again. An over-inclusive DPT only widens a
/// checkpoint's redo starting point, never narrows it incorrectly, so
/// this is conservative rather than wrong.
struct DptEntry {
    table: String,
    rec_lsn: Lsn,
}

/// The open database: every manager, wired together, shared behind one
/// `Arc` by every connection thread.
pub struct Engine {
    config: Config,
    disk: Arc<DiskManager>,
    pool: Arc<BufferPoolManager>,
    log: Arc<LogManager>,
    locks: Arc<LockManager>,
    txns: Arc<TransactionManager>,
    catalog: RwLock<Catalog>,
    heaps: RwLock<HashMap<String, Arc<HeapFile>>>,
    indexes: RwLock<HashMap<String, Arc<BTreeIndex>>>,
    dpt: Mutex<HashMap<(Fd, PageNo), DptEntry>>,
}

fn meta_path(config: &Config) -> std::path::PathBuf {
    config.data_dir.join("db.meta")
}

fn restart_path(config: &Config) -> std::path::PathBuf {
    config.data_dir.join("db.restart")
}

impl Engine {
    /// Opens (creating if necessary) the database named by `config`'s
    /// `data_dir`, runs crash recovery against whatever log is already
    /// there, and returns a ready-to-use engine with every existing
    /// table's heap file and every index open.
    pub fn open(config: Config) -> DbResult<Arc<Self>> {
        let disk = Arc::new(DiskManager::new(&config.data_dir));
        let is_new = !disk.is_dir();
        if is_new {
            disk.create_dir()?;
        }

        let db_name = config
            .data_dir
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("db")
            .to_string();
        let meta = meta_path(&config);
        let catalog = if meta.is_file() {
            Catalog::load(&meta)?
        } else {
            Catalog::new(db_name)
        };

        let pool = BufferPoolManager::new(config.buffer_pool_frames, disk.clone());
        let log = Arc::new(LogManager::open(config.data_dir.join("db.log"), config.log_buffer_size)?);
        if config.wal_enabled {
            pool.set_log_flusher(log.clone());
        }

        let locks = Arc::new(LockManager::new());
        let txns = Arc::new(TransactionManager::new(log.clone(), locks.clone()));

        if config.wal_enabled {
            let recovered = recovery::recover(&config.data_dir, disk.clone(), pool.clone(), &log, &catalog)?;
            txns.set_next_txn_id(recovered.next_txn_id);
            log::info!("engine: recovery reseeded next txn id to {}", recovered.next_txn_id);
        }

        let mut heaps = HashMap::new();
        let mut indexes = HashMap::new();
        for table in catalog.tables() {
            let fd = disk.open_file(&table.name)?;
            heaps.insert(table.name.clone(), Arc::new(HeapFile::open(pool.clone(), fd)?));
            for index in &table.indexes {
                let ifd = disk.open_file(&index.file_name())?;
                indexes.insert(
                    index.name.clone(),
                    Arc::new(BTreeIndex::open(pool.clone(), ifd, index.key_schema.clone())?),
                );
            }
        }

        if !meta.is_file() {
            catalog.save(&meta)?;
        }

        log::info!("engine: opened database '{}' ({} table(s))", catalog.db_name, heaps.len());
        Ok(Arc::new(Self {
            config,
            disk,
            pool,
            log,
            locks,
            txns,
            catalog: RwLock::new(catalog),
            heaps: RwLock::new(heaps),
            indexes: RwLock::new(indexes),
            dpt: Mutex::new(HashMap::new()),
        }))
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    fn table_heap(&self, table: &str) -> DbResult<Arc<HeapFile>> {
        self.heaps
            .read()
            .unwrap()
            .get(table)
            .cloned()
            .ok_or_else(|| DbError::TableNotFound(table.to_string()))
    }

    fn named_index(&self, name: &str) -> DbResult<Arc<BTreeIndex>> {
        self.indexes
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::IndexNotFound(name.to_string()))
    }

    fn note_dirty(&self, table: &str, fd: Fd, page_no: PageNo, lsn: Lsn) {
        self.dpt
            .lock()
            .unwrap()
            .entry((fd, page_no))
            .or_insert_with(|| DptEntry { table: table.to_string(), rec_lsn: lsn });
    }

    fn stamp_lsn(&self, fd: Fd, page_no: PageNo, lsn: Lsn) -> DbResult<()> {
        let guard = self
            .pool
            .fetch_page(common::PageId::new(fd, page_no))?
            .ok_or(DbError::PageNotExist { fd, page_no })?;
        storage::page::write_lsn(&mut guard.write(), lsn);
        Ok(())
    }

    // ---- Transaction lifecycle ----

    pub fn begin(&self) -> DbResult<TransactionId> {
        self.txns.begin()
    }

    pub fn commit(&self, txn: TransactionId) -> DbResult<()> {
        self.txns.commit(txn)
    }

    pub fn abort(self: &Arc<Self>, txn: TransactionId) -> DbResult<()> {
        self.txns.abort(txn, self.as_ref())
    }

    // ---- DDL ----

    pub fn create_table(&self, name: &str, columns: Vec<(String, SqlType)>) -> DbResult<()> {
        self.disk.create_file(name)?;
        let fd = match self.disk.open_file(name) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = self.disk.destroy_file(name);
                return Err(e);
            }
        };
        let heap = match HeapFile::create(self.pool.clone(), fd) {
            Ok(h) => h,
            Err(e) => {
                self.disk.close_file(fd)?;
                let _ = self.disk.destroy_file(name);
                return Err(e);
            }
        };

        let mut catalog = self.catalog.write().unwrap();
        if let Err(e) = catalog.create_table(name, columns) {
            drop(catalog);
            self.pool.remove_all_pages(fd);
            self.disk.close_file(fd)?;
            let _ = self.disk.destroy_file(name);
            return Err(e);
        }
        self.heaps.write().unwrap().insert(name.to_string(), Arc::new(heap));
        catalog.save(&meta_path(&self.config))?;
        log::info!("engine: created table '{name}'");
        Ok(())
    }

    pub fn drop_table(&self, name: &str) -> DbResult<()> {
        let mut catalog = self.catalog.write().unwrap();
        let meta = catalog.table(name)?.clone();
        catalog.drop_table(name)?;

        let mut heaps = self.heaps.write().unwrap();
        if let Some(heap) = heaps.remove(name) {
            let fd = heap.fd();
            drop(heap);
            self.pool.remove_all_pages(fd);
            self.disk.close_file(fd)?;
            self.disk.destroy_file(name)?;
        }
        drop(heaps);

        let mut indexes = self.indexes.write().unwrap();
        for index_meta in &meta.indexes {
            if let Some(idx) = indexes.remove(&index_meta.name) {
                let fd = idx.fd();
                drop(idx);
                self.pool.remove_all_pages(fd);
                self.disk.close_file(fd)?;
                self.disk.destroy_file(&index_meta.file_name())?;
            }
        }
        drop(indexes);

        catalog.save(&meta_path(&self.config))?;
        log::info!("engine: dropped table '{name}'");
        Ok(())
    }

    pub fn create_index(&self, table: &str, columns: &[&str]) -> DbResult<()> {
        let heap = self.table_heap(table)?;
        let mut catalog = self.catalog.write().unwrap();
        let (_, index_meta) = catalog.create_index(table, columns)?;

        let build = || -> DbResult<BTreeIndex> {
            self.disk.create_file(&index_meta.file_name())?;
            let fd = self.disk.open_file(&index_meta.file_name())?;
            let index = BTreeIndex::create(self.pool.clone(), fd, index_meta.key_schema.clone())?;
            let schema = catalog.table(table)?.schema.sql_types();
            for entry in heap.scan()? {
                let (rid, bytes) = entry?;
                let values = storage::tuple::decode(&bytes, &schema)?;
                let key: Vec<_> = index_meta.key_attrs.iter().map(|&i| values[i as usize].clone()).collect();
                index.insert_entry(&key, rid)?;
            }
            Ok(index)
        };

        match build() {
            Ok(index) => {
                self.indexes.write().unwrap().insert(index_meta.name.clone(), Arc::new(index));
                catalog.save(&meta_path(&self.config))?;
                log::info!("engine: created index '{}' on '{table}'", index_meta.name);
                Ok(())
            }
            Err(e) => {
                let _ = catalog.drop_index(table, &index_meta.name);
                Err(e)
            }
        }
    }

    pub fn drop_index(&self, table: &str, index_name: &str) -> DbResult<()> {
        let mut catalog = self.catalog.write().unwrap();
        catalog.drop_index(table, index_name)?;
        if let Some(idx) = self.indexes.write().unwrap().remove(index_name) {
            let fd = idx.fd();
            drop(idx);
            self.pool.remove_all_pages(fd);
            self.disk.close_file(fd)?;
            self.disk.destroy_file(index_name)?;
        }
        catalog.save(&meta_path(&self.config))?;
        log::info!("engine: dropped index '{index_name}'");
        Ok(())
    }

    pub fn with_catalog<R>(&self, f: impl FnOnce(&Catalog) -> R) -> R {
        f(&self.catalog.read().unwrap())
    }

    // ---- Checkpoint and shutdown ----

    /// Writes a checkpoint record covering the live Active Transaction
    /// Table and Dirty Page Table, then points `db.restart` at it. There
    /// is no dedicated background flusher thread (every WAL flush happens
    /// inline, at commit or at buffer-pool eviction); a checkpoint is
    /// likewise taken only when a caller explicitly asks for one, not on
    /// a timer.
    pub fn checkpoint(&self) -> DbResult<Lsn> {
        let att = self.txns.att_snapshot();
        let dpt_snapshot: Vec<(String, PageNo, Lsn)> = {
            let dpt = self.dpt.lock().unwrap();
            dpt.iter().map(|((_, page_no), e)| (e.table.clone(), *page_no, e.rec_lsn)).collect()
        };
        let min_rec_lsn = dpt_snapshot.iter().map(|(_, _, lsn)| *lsn).min().unwrap_or(self.log.persist_lsn());
        let checkpoint_lsn = self.log.append_checkpoint(att, Vec::new(), dpt_snapshot, min_rec_lsn)?;
        self.log.flush()?;
        wal::write_restart_file(restart_path(&self.config), checkpoint_lsn)?;
        log::info!("engine: checkpoint at lsn {checkpoint_lsn}");
        Ok(checkpoint_lsn)
    }

    /// Flushes every dirty page and the log, and persists the catalog.
    /// Call before the process exits; no background thread does this.
    pub fn shutdown(&self) -> DbResult<()> {
        self.pool.flush_all_dirty()?;
        self.log.flush()?;
        self.catalog.read().unwrap().save(&meta_path(&self.config))?;
        log::info!("engine: shut down cleanly");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use types::Value;

    fn config(dir: &std::path::Path) -> Config {
        Config::builder().data_dir(dir.join("db")).buffer_pool_frames(32).build()
    }

    #[test]
    fn open_create_table_insert_get_commit_round_trips() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        engine
            .create_table("people", vec![("id".into(), SqlType::Int32), ("name".into(), SqlType::Varchar(32))])
            .unwrap();

        let txn = engine.begin().unwrap();
        let rid = engine.insert(txn, "people", &[Value::Int32(1), Value::Varchar("Ada".into())]).unwrap();
        engine.commit(txn).unwrap();

        let txn2 = engine.begin().unwrap();
        let row = engine.get(txn2, "people", rid).unwrap();
        engine.commit(txn2).unwrap();
        assert_eq!(row, vec![Value::Int32(1), Value::Varchar("Ada".into())]);
    }

    #[test]
    fn reopen_after_shutdown_preserves_committed_rows() {
        let dir = tempdir().unwrap();
        let rid;
        {
            let engine = Engine::open(config(dir.path())).unwrap();
            engine.create_table("t", vec![("id".into(), SqlType::Int32)]).unwrap();
            let txn = engine.begin().unwrap();
            rid = engine.insert(txn, "t", &[Value::Int32(42)]).unwrap();
            engine.commit(txn).unwrap();
            engine.shutdown().unwrap();
        }
        let engine = Engine::open(config(dir.path())).unwrap();
        let txn = engine.begin().unwrap();
        let row = engine.get(txn, "t", rid).unwrap();
        engine.commit(txn).unwrap();
        assert_eq!(row, vec![Value::Int32(42)]);
    }

    #[test]
    fn abort_undoes_insert() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        engine.create_table("t", vec![("id".into(), SqlType::Int32)]).unwrap();

        let txn = engine.begin().unwrap();
        let rid = engine.insert(txn, "t", &[Value::Int32(7)]).unwrap();
        engine.abort(txn).unwrap();

        let txn2 = engine.begin().unwrap();
        let err = engine.get(txn2, "t", rid).unwrap_err();
        assert!(matches!(err, DbError::RecordNotFound { .. }));
    }

    #[test]
    fn checkpoint_writes_restart_file() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        engine.create_table("t", vec![("id".into(), SqlType::Int32)]).unwrap();
        let txn = engine.begin().unwrap();
        engine.insert(txn, "t", &[Value::Int32(1)]).unwrap();
        engine.commit(txn).unwrap();

        engine.checkpoint().unwrap();
        assert!(restart_path(&config(dir.path())).is_file());
    }

    #[test]
    fn index_range_scan_respects_bounds() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        engine.create_table("t", vec![("id".into(), SqlType::Int32)]).unwrap();
        engine.create_index("t", &["id"]).unwrap();

        let txn = engine.begin().unwrap();
        for i in 0..10 {
            engine.insert(txn, "t", &[Value::Int32(i)]).unwrap();
        }
        engine.commit(txn).unwrap();

        let txn2 = engine.begin().unwrap();
        let rows = engine
            .index_range_scan(
                txn2,
                "t",
                "t_ididx",
                IndexBound::Inclusive(&[Value::Int32(3)]),
                IndexBound::Exclusive(&[Value::Int32(7)]),
            )
            .unwrap();
        engine.commit(txn2).unwrap();

        let ids: Vec<i32> = rows
            .into_iter()
            .map(|(_, values)| match values[0] {
                Value::Int32(v) => v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec![3, 4, 5, 6]);
    }
}
