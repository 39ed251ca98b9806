//! Row-level data manipulation: insert, delete, update, point lookup,
//! full scan, and index range scan. Every mutation acquires the
//! appropriate lock before touching the heap file or an index, logs the
//! change through the transaction manager, and stamps the touched page's
//! LSN, with the executor's role folded into these methods since that
//! layer is out of this crate's scope.

use common::{DbResult, RecordId, TransactionId};
use lockmgr::LockMode;
use types::{SqlType, Value};

use crate::Engine;

/// A one-sided bound for [`Engine::index_range_scan`]. `Unbounded` maps
/// to the index's `LeafBegin`/`LeafEnd` cursors.
pub enum IndexBound<'a> {
    Unbounded,
    Inclusive(&'a [Value]),
    Exclusive(&'a [Value]),
}

pub(crate) fn project_key(values: &[Value], key_attrs: &[common::ColumnId]) -> Vec<Value> {
    key_attrs.iter().map(|&i| values[i as usize].clone()).collect()
}

fn numeric_projection(values: &[Value]) -> Vec<Option<f64>> {
    values
        .iter()
        .map(|v| match v {
            Value::Int32(n) => Some(*n as f64),
            Value::Int64(n) => Some(*n as f64),
            Value::Float64(n) => Some(*n),
            Value::Date(n) => Some(*n as f64),
            Value::Char(_) | Value::Varchar(_) | Value::Null => None,
        })
        .collect()
}

impl Engine {
    fn table_schema(&self, table: &str) -> DbResult<Vec<SqlType>> {
        Ok(self.catalog.read().unwrap().table(table)?.schema.sql_types())
    }

    /// InsertTuple: encodes `values` against the table's schema, appends
    /// the tuple to its heap file, logs the insert, and adds an entry to
    /// every index built over the table.
    pub fn insert(&self, txn: TransactionId, table: &str, values: &[Value]) -> DbResult<RecordId> {
        let schema = self.table_schema(table)?;
        let bytes = storage::tuple::encode(values, &schema)?;
        let heap = self.table_heap(table)?;

        self.locks.lock_table(heap.fd(), txn, LockMode::IX)?;
        let rid = heap.insert_tuple(&bytes)?;
        self.locks.lock_record(heap.fd(), rid, txn, LockMode::X)?;

        let lsn = self.txns.record_insert(txn, table, rid, &bytes)?;
        self.stamp_lsn(heap.fd(), rid.page_no, lsn)?;
        self.note_dirty(table, heap.fd(), rid.page_no, lsn);

        let index_metas = self.catalog.read().unwrap().table(table)?.indexes.clone();
        for index_meta in &index_metas {
            let index = self.named_index(&index_meta.name)?;
            let key = project_key(values, &index_meta.key_attrs);
            let iid = index.lower_bound(&key)?;
            self.locks.check_insert_gap(index.fd(), iid, txn)?;
            index.insert_entry(&key, rid)?;
        }

        let mut catalog = self.catalog.write().unwrap();
        catalog.table_mut(table)?.stats.record_insert(&numeric_projection(values));
        log::debug!("engine: txn {txn} inserted into '{table}' at {rid:?}");
        Ok(rid)
    }

    /// DeleteTuple: locks the record, reads its current bytes as the
    /// before-image, marks it deleted, logs the delete, and removes its
    /// entry from every index.
    pub fn delete(&self, txn: TransactionId, table: &str, rid: RecordId) -> DbResult<()> {
        let schema = self.table_schema(table)?;
        let heap = self.table_heap(table)?;
        self.locks.lock_record(heap.fd(), rid, txn, LockMode::X)?;

        let (_, before_image) = heap.get_tuple(rid)?;
        heap.delete_tuple(rid)?;

        let lsn = self.txns.record_delete(txn, table, rid, &before_image)?;
        self.stamp_lsn(heap.fd(), rid.page_no, lsn)?;
        self.note_dirty(table, heap.fd(), rid.page_no, lsn);

        let before_values = storage::tuple::decode(&before_image, &schema)?;
        let index_metas = self.catalog.read().unwrap().table(table)?.indexes.clone();
        for index_meta in &index_metas {
            let index = self.named_index(&index_meta.name)?;
            let key = project_key(&before_values, &index_meta.key_attrs);
            index.delete_entry(&key)?;
        }

        let mut catalog = self.catalog.write().unwrap();
        catalog.table_mut(table)?.stats.record_delete();
        log::debug!("engine: txn {txn} deleted from '{table}' at {rid:?}");
        Ok(())
    }

    /// UpdateTupleInPlace: locks the record, reads the before-image,
    /// writes the new encoded tuple (which may only shrink or preserve
    /// the slot's size — growth fails with `InvalidRecordSize`, matching
    /// the record manager's in-place contract), logs the update, and
    /// repairs any index whose key the update actually moved.
    pub fn update(&self, txn: TransactionId, table: &str, rid: RecordId, values: &[Value]) -> DbResult<()> {
        let schema = self.table_schema(table)?;
        let heap = self.table_heap(table)?;
        self.locks.lock_record(heap.fd(), rid, txn, LockMode::X)?;

        let (_, before_image) = heap.get_tuple(rid)?;
        let after_image = storage::tuple::encode(values, &schema)?;
        heap.update_tuple_in_place(rid, &after_image, None)?;

        let lsn = self.txns.record_update(txn, table, rid, &before_image, &after_image)?;
        self.stamp_lsn(heap.fd(), rid.page_no, lsn)?;
        self.note_dirty(table, heap.fd(), rid.page_no, lsn);

        let before_values = storage::tuple::decode(&before_image, &schema)?;
        let index_metas = self.catalog.read().unwrap().table(table)?.indexes.clone();
        for index_meta in &index_metas {
            let index = self.named_index(&index_meta.name)?;
            let before_key = project_key(&before_values, &index_meta.key_attrs);
            let after_key = project_key(values, &index_meta.key_attrs);
            if before_key != after_key {
                index.delete_entry(&before_key)?;
                let iid = index.lower_bound(&after_key)?;
                self.locks.check_insert_gap(index.fd(), iid, txn)?;
                index.insert_entry(&after_key, rid)?;
            }
        }

        let mut catalog = self.catalog.write().unwrap();
        catalog.table_mut(table)?.stats.record_insert(&numeric_projection(values));
        log::debug!("engine: txn {txn} updated '{table}' at {rid:?}");
        Ok(())
    }

    /// GetTuple: shared-locks the record and decodes it against the
    /// table's schema. Errors with `RecordNotFound` for a logically
    /// deleted slot, same as a slot that was never occupied.
    pub fn get(&self, txn: TransactionId, table: &str, rid: RecordId) -> DbResult<Vec<Value>> {
        let schema = self.table_schema(table)?;
        let heap = self.table_heap(table)?;
        self.locks.lock_record(heap.fd(), rid, txn, LockMode::S)?;
        let (meta, bytes) = heap.get_tuple(rid)?;
        if meta.is_deleted {
            return Err(common::DbError::RecordNotFound { page_no: rid.page_no, slot: rid.slot });
        }
        storage::tuple::decode(&bytes, &schema)
    }

    /// Full table scan: shared-locks the table and decodes every live
    /// tuple in physical order.
    pub fn scan(&self, txn: TransactionId, table: &str) -> DbResult<Vec<(RecordId, Vec<Value>)>> {
        let schema = self.table_schema(table)?;
        let heap = self.table_heap(table)?;
        self.locks.lock_table(heap.fd(), txn, LockMode::S)?;
        let mut out = Vec::new();
        for entry in heap.scan()? {
            let (rid, bytes) = entry?;
            out.push((rid, storage::tuple::decode(&bytes, &schema)?));
        }
        Ok(out)
    }

    /// Range scan over a clustered index: shared-locks the table, then
    /// walks leaf entries one cursor position at a time via `read_at`
    /// (rather than the index's own `range` iterator) so a gap lock can
    /// be taken at every position visited, including the one just past
    /// the last entry returned. This prevents phantoms even across a
    /// leaf-to-leaf transition, since a position is locked whether or not
    /// it happens to be the first slot of a new leaf.
    pub fn index_range_scan(
        &self,
        txn: TransactionId,
        table: &str,
        index_name: &str,
        lower: IndexBound<'_>,
        upper: IndexBound<'_>,
    ) -> DbResult<Vec<(RecordId, Vec<Value>)>> {
        let schema = self.table_schema(table)?;
        let heap = self.table_heap(table)?;
        let index = self.named_index(index_name)?;
        self.locks.lock_table(heap.fd(), txn, LockMode::S)?;

        let start = match lower {
            IndexBound::Unbounded => index.leaf_begin()?,
            IndexBound::Inclusive(k) => index.lower_bound(k)?,
            IndexBound::Exclusive(k) => index.upper_bound(k)?,
        };
        let end = match upper {
            IndexBound::Unbounded => index.leaf_end()?,
            IndexBound::Inclusive(k) => index.upper_bound(k)?,
            IndexBound::Exclusive(k) => index.lower_bound(k)?,
        };

        let mut out = Vec::new();
        let mut cursor = start;
        self.locks.lock_gap(index.fd(), cursor, txn)?;
        loop {
            if cursor == end {
                break;
            }
            let Some((_, rid, next)) = index.read_at(cursor)? else { break };
            let (meta, bytes) = heap.get_tuple(rid)?;
            if !meta.is_deleted {
                out.push((rid, storage::tuple::decode(&bytes, &schema)?));
            }
            self.locks.lock_gap(index.fd(), next, txn)?;
            cursor = next;
        }
        Ok(out)
    }
}
