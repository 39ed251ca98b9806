//! The engine's [`txn::AbortApplier`] implementation: the physical
//! inverse of each write-set entry, applied directly against a table's
//! heap file and its indexes. No log records are written here — only
//! the live transaction's single final ABORT record — which mirrors
//! `recovery::recover`'s undo phase in shape but not in logging, since a
//! crash mid-abort is recovered by re-running the same physical
//! inversions again from the log, and every one of them (delete,
//! reinsert, restore, insert/delete-entry) is idempotent under repeat
//! application.

use common::{DbResult, RecordId};
use txn::AbortApplier;

use crate::dml::project_key;
use crate::Engine;

impl AbortApplier for Engine {
    fn undo_insert(&self, table: &str, rid: RecordId) -> DbResult<()> {
        let meta = self.catalog.read().unwrap().table(table)?.clone();
        let heap = self.table_heap(table)?;
        let schema = meta.schema.sql_types();
        let (_, bytes) = heap.get_tuple(rid)?;
        let values = storage::tuple::decode(&bytes, &schema)?;

        heap.delete_tuple(rid)?;
        for index_meta in &meta.indexes {
            let index = self.named_index(&index_meta.name)?;
            let key = project_key(&values, &index_meta.key_attrs);
            index.delete_entry(&key)?;
        }
        Ok(())
    }

    fn undo_delete(&self, table: &str, rid: RecordId, before_image: &[u8]) -> DbResult<()> {
        let meta = self.catalog.read().unwrap().table(table)?.clone();
        let heap = self.table_heap(table)?;
        let schema = meta.schema.sql_types();
        let values = storage::tuple::decode(before_image, &schema)?;

        heap.reinsert_tuple(rid)?;
        for index_meta in &meta.indexes {
            let index = self.named_index(&index_meta.name)?;
            let key = project_key(&values, &index_meta.key_attrs);
            index.insert_entry(&key, rid)?;
        }
        Ok(())
    }

    fn undo_update(&self, table: &str, rid: RecordId, before_image: &[u8]) -> DbResult<()> {
        let meta = self.catalog.read().unwrap().table(table)?.clone();
        let heap = self.table_heap(table)?;
        let schema = meta.schema.sql_types();
        let (_, current_image) = heap.get_tuple(rid)?;
        let before_values = storage::tuple::decode(before_image, &schema)?;
        let current_values = storage::tuple::decode(&current_image, &schema)?;

        heap.restore_tuple(rid, before_image)?;
        for index_meta in &meta.indexes {
            let before_key = project_key(&before_values, &index_meta.key_attrs);
            let current_key = project_key(&current_values, &index_meta.key_attrs);
            if before_key != current_key {
                let index = self.named_index(&index_meta.name)?;
                index.delete_entry(&current_key)?;
                index.insert_entry(&before_key, rid)?;
            }
        }
        Ok(())
    }
}
