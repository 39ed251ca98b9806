//! Persistent database metadata: tables, columns, indexes, and the
//! in-memory statistics the optimizer consumes.
//!
//! The catalog itself never touches a heap file or index file's bytes —
//! it only remembers that they exist, their schema, and (for indexes)
//! which columns they cover. Opening the files those descriptors name is
//! the engine's job, once it has a [`catalog::Catalog`] in hand.
//!
//! On-disk format is a line-oriented text file named `db.meta`:
//! database name, table count, then per table a name, column list, and
//! index list. Statistics are deliberately not part of this format; they
//! are rebuilt in memory as rows are inserted, updated, and deleted.

use common::{ColumnId, DbError, DbResult, IndexId, TableId};
use std::collections::HashMap;
use std::path::Path;
use types::SqlType;

/// One column in a table schema.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: SqlType,
    /// Byte offset of this column's inline field within an encoded tuple
    /// (see `storage::tuple`): `4` (length prefix) + the null bitmap +
    /// the inline bytes of every earlier column.
    pub offset: usize,
}

/// A table's column layout, with name lookup for resolving unqualified
/// column references.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSchema {
    columns: Vec<Column>,
    name_to_ordinal: HashMap<String, ColumnId>,
}

impl TableSchema {
    pub fn new(columns: Vec<(String, SqlType)>) -> DbResult<Self> {
        if columns.is_empty() {
            return Err(DbError::Internal("table must have at least one column".into()));
        }
        let bitmap_len = columns.len().div_ceil(8);
        let mut offset = 4 + bitmap_len;
        let mut built = Vec::with_capacity(columns.len());
        let mut name_to_ordinal = HashMap::new();
        for (idx, (name, ty)) in columns.into_iter().enumerate() {
            if name_to_ordinal.insert(name.clone(), idx as ColumnId).is_some() {
                return Err(DbError::AmbiguousColumn(name));
            }
            built.push(Column { name, ty, offset });
            offset += built.last().unwrap().ty.inline_len();
        }
        Ok(Self {
            columns: built,
            name_to_ordinal,
        })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> DbResult<ColumnId> {
        self.name_to_ordinal
            .get(name)
            .copied()
            .ok_or_else(|| DbError::ColumnNotFound(name.to_string()))
    }

    pub fn column(&self, ordinal: ColumnId) -> DbResult<&Column> {
        self.columns
            .get(ordinal as usize)
            .ok_or_else(|| DbError::ColumnNotFound(format!("ordinal {ordinal}")))
    }

    /// Column types in declaration order, the shape every tuple codec
    /// call needs.
    pub fn sql_types(&self) -> Vec<SqlType> {
        self.columns.iter().map(|c| c.ty).collect()
    }
}

/// Metadata for a B+-tree index declared over one or more columns of a
/// table. The backing file is named `<table>_<col1>_<col2>...idx`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexMeta {
    pub id: IndexId,
    pub name: String,
    pub table_name: String,
    /// Ordinals into the owning table's schema, in key order.
    pub key_attrs: Vec<ColumnId>,
    pub key_schema: Vec<SqlType>,
    pub key_len: usize,
}

impl IndexMeta {
    pub fn file_name(&self) -> String {
        self.name.clone()
    }
}

/// Running statistics for one table, updated incrementally as rows are
/// inserted, updated, and deleted. Never persisted; the optimizer (out of
/// this crate's scope) rebuilds its plans from whatever is resident at
/// query time.
#[derive(Clone, Debug, Default)]
pub struct TableStats {
    pub row_count: i64,
    pub column_stats: Vec<ColumnStats>,
}

#[derive(Clone, Debug, Default)]
pub struct ColumnStats {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub sum: f64,
    pub distinct_count: u64,
}

impl TableStats {
    fn new(ncols: usize) -> Self {
        Self {
            row_count: 0,
            column_stats: vec![ColumnStats::default(); ncols],
        }
    }

    pub fn record_insert(&mut self, numeric_values: &[Option<f64>]) {
        self.row_count += 1;
        for (stat, value) in self.column_stats.iter_mut().zip(numeric_values) {
            let Some(v) = value else { continue };
            stat.min = Some(stat.min.map_or(*v, |m| m.min(*v)));
            stat.max = Some(stat.max.map_or(*v, |m| m.max(*v)));
            stat.sum += v;
        }
    }

    pub fn record_delete(&mut self) {
        self.row_count = (self.row_count - 1).max(0);
    }
}

/// Metadata describing one registered table: its schema, the indexes
/// built over it, and its in-memory statistics.
#[derive(Clone, Debug)]
pub struct TableMeta {
    pub id: TableId,
    pub name: String,
    pub schema: TableSchema,
    pub indexes: Vec<IndexMeta>,
    pub stats: TableStats,
}

impl TableMeta {
    pub fn index(&self, name: &str) -> DbResult<&IndexMeta> {
        self.indexes
            .iter()
            .find(|i| i.name == name)
            .ok_or_else(|| DbError::IndexNotFound(name.to_string()))
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.iter().any(|i| i.name == name)
    }
}

/// The database-wide catalog: every table, its schema, and its indexes.
/// One `Catalog` exists per open database, backed by its `db.meta` file.
#[derive(Clone, Debug)]
pub struct Catalog {
    pub db_name: String,
    tables: Vec<TableMeta>,
    name_to_idx: HashMap<String, usize>,
    next_table_id: u64,
    next_index_id: u64,
}

impl Catalog {
    pub fn new(db_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            tables: Vec::new(),
            name_to_idx: HashMap::new(),
            next_table_id: 1,
            next_index_id: 1,
        }
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.tables.iter()
    }

    pub fn table(&self, name: &str) -> DbResult<&TableMeta> {
        let idx = *self
            .name_to_idx
            .get(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))?;
        Ok(&self.tables[idx])
    }

    pub fn table_mut(&mut self, name: &str) -> DbResult<&mut TableMeta> {
        let idx = *self
            .name_to_idx
            .get(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))?;
        Ok(&mut self.tables[idx])
    }

    pub fn table_by_id(&self, id: TableId) -> DbResult<&TableMeta> {
        self.tables
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| DbError::TableNotFound(format!("id {}", id.0)))
    }

    pub fn create_table(
        &mut self,
        name: &str,
        columns: Vec<(String, SqlType)>,
    ) -> DbResult<TableId> {
        if self.name_to_idx.contains_key(name) {
            return Err(DbError::TableExists(name.to_string()));
        }
        let schema = TableSchema::new(columns)?;
        let ncols = schema.columns().len();
        let id = TableId(self.next_table_id);
        self.next_table_id += 1;
        log::info!("catalog: created table '{name}' (id {})", id.0);
        self.name_to_idx.insert(name.to_string(), self.tables.len());
        self.tables.push(TableMeta {
            id,
            name: name.to_string(),
            schema,
            indexes: Vec::new(),
            stats: TableStats::new(ncols),
        });
        Ok(id)
    }

    pub fn drop_table(&mut self, name: &str) -> DbResult<()> {
        let idx = *self
            .name_to_idx
            .get(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))?;
        self.tables.remove(idx);
        self.rebuild_index();
        log::info!("catalog: dropped table '{name}'");
        Ok(())
    }

    pub fn create_index(
        &mut self,
        table_name: &str,
        columns: &[&str],
    ) -> DbResult<(IndexId, IndexMeta)> {
        if columns.is_empty() {
            return Err(DbError::Internal("index needs at least one column".into()));
        }
        let index_name = format!("{table_name}_{}idx", columns.join("_"));
        let table = self.table(table_name)?;
        if table.has_index(&index_name) {
            return Err(DbError::IndexExists(index_name));
        }
        let mut key_attrs = Vec::with_capacity(columns.len());
        let mut key_schema = Vec::with_capacity(columns.len());
        let mut key_len = 0usize;
        for &col in columns {
            let ordinal = table.schema.column_index(col)?;
            let column = table.schema.column(ordinal)?;
            key_attrs.push(ordinal);
            key_schema.push(column.ty);
            key_len += column.ty.declared_len() as usize;
        }
        let id = IndexId(self.next_index_id);
        self.next_index_id += 1;
        let meta = IndexMeta {
            id,
            name: index_name,
            table_name: table_name.to_string(),
            key_attrs,
            key_schema,
            key_len,
        };
        self.table_mut(table_name)?.indexes.push(meta.clone());
        log::info!("catalog: created index '{}' on '{table_name}'", meta.name);
        Ok((id, meta))
    }

    pub fn drop_index(&mut self, table_name: &str, index_name: &str) -> DbResult<()> {
        let table = self.table_mut(table_name)?;
        let before = table.indexes.len();
        table.indexes.retain(|i| i.name != index_name);
        if table.indexes.len() == before {
            return Err(DbError::IndexNotFound(index_name.to_string()));
        }
        Ok(())
    }

    fn rebuild_index(&mut self) {
        self.name_to_idx.clear();
        for (i, t) in self.tables.iter().enumerate() {
            self.name_to_idx.insert(t.name.clone(), i);
        }
    }

    /// Serializes the catalog into the line-oriented `db.meta` text
    /// format and writes it atomically (write to a temp file, then
    /// rename) so a crash mid-write never corrupts the previous catalog.
    pub fn save(&self, path: &Path) -> DbResult<()> {
        let text = encode(self);
        let tmp = path.with_extension("meta.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> DbResult<Self> {
        let text = std::fs::read_to_string(path)?;
        decode(&text)
    }
}

fn type_tag(ty: SqlType) -> (&'static str, u16) {
    match ty {
        SqlType::Int32 => ("INT32", 0),
        SqlType::Int64 => ("INT64", 0),
        SqlType::Float64 => ("FLOAT64", 0),
        SqlType::Char(n) => ("CHAR", n),
        SqlType::Varchar(n) => ("VARCHAR", n),
        SqlType::Date => ("DATE", 0),
    }
}

fn parse_type(tag: &str, len: u16) -> DbResult<SqlType> {
    Ok(match tag {
        "INT32" => SqlType::Int32,
        "INT64" => SqlType::Int64,
        "FLOAT64" => SqlType::Float64,
        "CHAR" => SqlType::Char(len),
        "VARCHAR" => SqlType::Varchar(len),
        "DATE" => SqlType::Date,
        other => return Err(DbError::Internal(format!("unknown column type tag '{other}'"))),
    })
}

fn encode(catalog: &Catalog) -> String {
    let mut out = String::new();
    out.push_str(&catalog.db_name);
    out.push('\n');
    out.push_str(&catalog.tables.len().to_string());
    out.push('\n');
    for table in &catalog.tables {
        out.push_str(&format!("{} {}\n", table.name, table.id.0));
        out.push_str(&format!("{}\n", table.schema.columns().len()));
        for col in table.schema.columns() {
            let (tag, len) = type_tag(col.ty);
            out.push_str(&format!("{} {tag} {len} {}\n", col.name, col.offset));
        }
        out.push_str(&format!("{}\n", table.indexes.len()));
        for idx in &table.indexes {
            let attrs = idx
                .key_attrs
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&format!(
                "{} {} {} {}\n",
                idx.name, idx.id.0, idx.key_len, attrs
            ));
        }
    }
    out
}

fn decode(text: &str) -> DbResult<Catalog> {
    let mut lines = text.lines();
    let db_name = lines
        .next()
        .ok_or_else(|| DbError::Internal("db.meta: missing database name".into()))?
        .to_string();
    let table_count: usize = lines
        .next()
        .ok_or_else(|| DbError::Internal("db.meta: missing table count".into()))?
        .parse()
        .map_err(|_| DbError::Internal("db.meta: invalid table count".into()))?;

    let mut catalog = Catalog::new(db_name);
    let mut max_table_id = 0u64;
    let mut max_index_id = 0u64;

    for _ in 0..table_count {
        let header = lines
            .next()
            .ok_or_else(|| DbError::Internal("db.meta: truncated table header".into()))?;
        let mut parts = header.split_whitespace();
        let table_name = parts
            .next()
            .ok_or_else(|| DbError::Internal("db.meta: missing table name".into()))?
            .to_string();
        let table_id: u64 = parts
            .next()
            .ok_or_else(|| DbError::Internal("db.meta: missing table id".into()))?
            .parse()
            .map_err(|_| DbError::Internal("db.meta: invalid table id".into()))?;
        max_table_id = max_table_id.max(table_id);

        let col_count: usize = lines
            .next()
            .ok_or_else(|| DbError::Internal("db.meta: missing column count".into()))?
            .parse()
            .map_err(|_| DbError::Internal("db.meta: invalid column count".into()))?;
        let mut columns = Vec::with_capacity(col_count);
        for _ in 0..col_count {
            let line = lines
                .next()
                .ok_or_else(|| DbError::Internal("db.meta: truncated column row".into()))?;
            let mut parts = line.split_whitespace();
            let name = parts
                .next()
                .ok_or_else(|| DbError::Internal("db.meta: missing column name".into()))?
                .to_string();
            let tag = parts
                .next()
                .ok_or_else(|| DbError::Internal("db.meta: missing column type".into()))?;
            let len: u16 = parts
                .next()
                .ok_or_else(|| DbError::Internal("db.meta: missing column length".into()))?
                .parse()
                .map_err(|_| DbError::Internal("db.meta: invalid column length".into()))?;
            let _offset: usize = parts
                .next()
                .ok_or_else(|| DbError::Internal("db.meta: missing column offset".into()))?
                .parse()
                .map_err(|_| DbError::Internal("db.meta: invalid column offset".into()))?;
            columns.push((name, parse_type(tag, len)?));
        }
        let id = catalog.create_table(&table_name, columns)?;
        debug_assert_eq!(id.0, table_id);

        let idx_count: usize = lines
            .next()
            .ok_or_else(|| DbError::Internal("db.meta: missing index count".into()))?
            .parse()
            .map_err(|_| DbError::Internal("db.meta: invalid index count".into()))?;
        for _ in 0..idx_count {
            let line = lines
                .next()
                .ok_or_else(|| DbError::Internal("db.meta: truncated index row".into()))?;
            let mut parts = line.split_whitespace();
            let index_name = parts
                .next()
                .ok_or_else(|| DbError::Internal("db.meta: missing index name".into()))?
                .to_string();
            let index_id: u64 = parts
                .next()
                .ok_or_else(|| DbError::Internal("db.meta: missing index id".into()))?
                .parse()
                .map_err(|_| DbError::Internal("db.meta: invalid index id".into()))?;
            max_index_id = max_index_id.max(index_id);
            let key_len: usize = parts
                .next()
                .ok_or_else(|| DbError::Internal("db.meta: missing index key length".into()))?
                .parse()
                .map_err(|_| DbError::Internal("db.meta: invalid index key length".into()))?;
            let attrs_field = parts.next().unwrap_or("");
            let key_attrs: Vec<ColumnId> = if attrs_field.is_empty() {
                Vec::new()
            } else {
                attrs_field
                    .split(',')
                    .map(|s| {
                        s.parse()
                            .map_err(|_| DbError::Internal("db.meta: invalid key attr".into()))
                    })
                    .collect::<DbResult<_>>()?
            };

            let table = catalog.table(&table_name)?;
            let mut key_schema = Vec::with_capacity(key_attrs.len());
            for &attr in &key_attrs {
                key_schema.push(table.schema.column(attr)?.ty);
            }
            let meta = IndexMeta {
                id: IndexId(index_id),
                name: index_name,
                table_name: table_name.clone(),
                key_attrs,
                key_schema,
                key_len,
            };
            catalog.table_mut(&table_name)?.indexes.push(meta);
        }
    }
    catalog.next_table_id = max_table_id + 1;
    catalog.next_index_id = max_index_id + 1;
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn cols() -> Vec<(String, SqlType)> {
        vec![
            ("id".into(), SqlType::Int32),
            ("name".into(), SqlType::Varchar(16)),
        ]
    }

    #[test]
    fn create_and_lookup_table() {
        let mut catalog = Catalog::new("db1");
        let id = catalog.create_table("t", cols()).unwrap();
        assert_eq!(id, TableId(1));
        let table = catalog.table("t").unwrap();
        assert_eq!(table.schema.column_index("name").unwrap(), 1);
    }

    #[test]
    fn rejects_duplicate_table() {
        let mut catalog = Catalog::new("db1");
        catalog.create_table("t", cols()).unwrap();
        let err = catalog.create_table("t", cols()).unwrap_err();
        assert!(matches!(err, DbError::TableExists(_)));
    }

    #[test]
    fn column_offsets_account_for_null_bitmap() {
        let schema = TableSchema::new(cols()).unwrap();
        // 4-byte length prefix + 1-byte bitmap (2 cols) = offset 5 for col 0.
        assert_eq!(schema.column(0).unwrap().offset, 5);
        assert_eq!(schema.column(1).unwrap().offset, 9);
    }

    #[test]
    fn create_index_derives_file_name_and_key_schema() {
        let mut catalog = Catalog::new("db1");
        catalog.create_table("t", cols()).unwrap();
        let (id, meta) = catalog.create_index("t", &["id"]).unwrap();
        assert_eq!(id, IndexId(1));
        assert_eq!(meta.name, "t_ididx");
        assert_eq!(meta.key_schema, vec![SqlType::Int32]);
        assert_eq!(meta.key_len, 4);
        assert!(catalog.table("t").unwrap().has_index("t_ididx"));
    }

    #[test]
    fn persistence_round_trip() {
        let mut catalog = Catalog::new("db1");
        catalog.create_table("t", cols()).unwrap();
        catalog.create_index("t", &["id"]).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("db.meta");
        catalog.save(&path).unwrap();

        let loaded = Catalog::load(&path).unwrap();
        assert_eq!(loaded.db_name, "db1");
        let table = loaded.table("t").unwrap();
        assert_eq!(table.schema.sql_types(), vec![SqlType::Int32, SqlType::Varchar(16)]);
        assert!(table.has_index("t_ididx"));
    }

    #[test]
    fn drop_table_removes_metadata() {
        let mut catalog = Catalog::new("db1");
        catalog.create_table("t", cols()).unwrap();
        catalog.drop_table("t").unwrap();
        assert!(catalog.table("t").is_err());
        let next = catalog.create_table("u", cols()).unwrap();
        assert_eq!(next, TableId(2));
    }

    #[test]
    fn statistics_track_row_count() {
        let mut catalog = Catalog::new("db1");
        catalog.create_table("t", cols()).unwrap();
        let table = catalog.table_mut("t").unwrap();
        table.stats.record_insert(&[Some(1.0), None]);
        table.stats.record_insert(&[Some(3.0), None]);
        assert_eq!(table.stats.row_count, 2);
        assert_eq!(table.stats.column_stats[0].min, Some(1.0));
        assert_eq!(table.stats.column_stats[0].max, Some(3.0));
        table.stats.record_delete();
        assert_eq!(table.stats.row_count, 1);
    }
}
