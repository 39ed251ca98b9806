//! Identifiers, error taxonomy, and configuration shared by every crate in
//! the storage engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use types::Value;

/// Identifier for a column within a table schema.
pub type ColumnId = u16;

/// Identifier for a table registered in the catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub u64);

/// Identifier for an index registered in the catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexId(pub u64);

/// An open file descriptor as seen by the disk manager. Every on-disk file
/// (a heap file or an index file) is assigned one of these when opened;
/// it is the first half of a [`PageId`].
pub type Fd = i32;

/// A 0-based page number within a single open file.
pub type PageNo = u32;

/// Logical identifier for a page: which open file it lives in, and its
/// offset within that file. Buffer-pool page tables key on the full pair
/// since the pool is shared across every open file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId {
    pub fd: Fd,
    pub page_no: PageNo,
}

impl PageId {
    pub fn new(fd: Fd, page_no: PageNo) -> Self {
        Self { fd, page_no }
    }
}

/// A transaction identifier. Monotonically increasing, assigned by the
/// transaction manager.
pub type TransactionId = i64;

/// A log sequence number. Monotonically increasing, assigned by the log
/// manager. `NO_LSN` marks "no previous record" (the first record of a
/// transaction's chain, or an as-yet-unset page LSN). Stored as a 4-byte
/// field in both the on-disk log header and the page header, matching the
/// original engine's `lsn_t`.
pub type Lsn = i32;

pub const NO_LSN: Lsn = -1;
pub const INVALID_TXN_ID: TransactionId = -1;
pub const INVALID_PAGE_NO: PageNo = u32::MAX;

/// Fully-qualified identifier for a record within a heap file. Stable
/// across the record's lifetime (logical delete does not reuse a slot
/// until an explicit vacuum, which this engine does not perform).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub page_no: PageNo,
    pub slot: u16,
}

impl RecordId {
    pub fn new(page_no: PageNo, slot: u16) -> Self {
        Self { page_no, slot }
    }

    /// Packs `(page_no, slot)` into a single `i64`, matching the original
    /// engine's `RID::Get()`. Used as a sort/hash key wherever a single
    /// scalar is more convenient than the struct.
    pub fn as_packed(&self) -> i64 {
        ((self.page_no as i64) << 32) | (self.slot as i64)
    }
}

/// An index cursor: a leaf page plus a slot index within it. Used as the
/// lock manager's gap-lock resource key and as the anchor for B+-tree
/// range iterators (`LeafBegin`/`LeafEnd`/`LowerBound`/`UpperBound`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Iid {
    pub page_no: PageNo,
    pub slot: u16,
}

impl Iid {
    pub fn new(page_no: PageNo, slot: u16) -> Self {
        Self { page_no, slot }
    }
}

/// Positional row representation backed by [`types::Value`]. A row carries
/// no schema of its own; callers interpret it against a `catalog::Schema`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Row::new(values)
    }
}

/// Canonical error type shared across every storage-engine subsystem. The
/// variant set follows the original engine's exception hierarchy
/// (`common/errors.h`), grouped per the error taxonomy in the storage
/// engine specification.
#[derive(Error, Debug)]
pub enum DbError {
    // --- I/O ---
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("file already exists: {0}")]
    FileAlreadyExists(String),
    #[error("file still open: {0}")]
    FileStillOpen(String),
    #[error("file not open: {0}")]
    FileNotOpen(String),
    #[error("short read on fd {fd} at page {page_no}")]
    ShortRead { fd: Fd, page_no: PageNo },
    #[error("short write on fd {fd} at page {page_no}")]
    ShortWrite { fd: Fd, page_no: PageNo },
    #[error(transparent)]
    Io(#[from] std::io::Error),

    // --- Catalog ---
    #[error("database not found: {0}")]
    DatabaseNotFound(String),
    #[error("database already exists: {0}")]
    DatabaseExists(String),
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("table already exists: {0}")]
    TableExists(String),
    #[error("column not found: {0}")]
    ColumnNotFound(String),
    #[error("ambiguous column: {0}")]
    AmbiguousColumn(String),
    #[error("index not found: {0}")]
    IndexNotFound(String),
    #[error("index already exists: {0}")]
    IndexExists(String),

    // --- Data ---
    #[error("invalid record size: expected {expected}, got {actual}")]
    InvalidRecordSize { expected: usize, actual: usize },
    #[error("invalid column length: column {column} expected at most {max}, got {actual}")]
    InvalidColumnLength {
        column: String,
        max: usize,
        actual: usize,
    },
    #[error("string overflow: {0}")]
    StringOverflow(String),
    #[error("incompatible types: {lhs} vs {rhs}")]
    IncompatibleType { lhs: String, rhs: String },
    #[error("page does not exist: fd {fd} page {page_no}")]
    PageNotExist { fd: Fd, page_no: PageNo },
    #[error("record not found at page {page_no} slot {slot}")]
    RecordNotFound { page_no: PageNo, slot: u16 },
    #[error("index entry not found")]
    IndexEntryNotFound,
    #[error("invalid value count: expected {expected}, got {actual}")]
    InvalidValueCount { expected: usize, actual: usize },

    // --- Concurrency ---
    #[error("transaction {0} aborted (wait-die victim)")]
    TransactionAbort(TransactionId),
    #[error("illegal lock request: {0}")]
    LockRequestIllegal(String),

    // --- Internal ---
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

/// Result alias that carries a `DbError`.
pub type DbResult<T> = Result<T, DbError>;

/// Runtime configuration for the database engine.
///
/// # Example
/// ```
/// use common::Config;
/// use std::path::PathBuf;
///
/// let config = Config::builder()
///     .data_dir(PathBuf::from("./my_db"))
///     .page_size(8192)
///     .buffer_pool_frames(512)
///     .build();
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct Config {
    /// Directory holding the catalog, heap files, index files, WAL and
    /// restart file for one database.
    #[builder(default = PathBuf::from("./db_data"))]
    pub data_dir: PathBuf,
    /// Fixed-size page allocation in bytes.
    #[builder(default = 4096)]
    pub page_size: usize,
    /// Number of frames the buffer pool keeps resident.
    #[builder(default = 256)]
    pub buffer_pool_frames: usize,
    /// Size in bytes of the log manager's in-memory append buffer.
    #[builder(default = (256 + 1) * 4096)]
    pub log_buffer_size: usize,
    /// Controls whether the write-ahead log is enabled. Disabling it is a
    /// test-only escape hatch; recovery is unavailable without it.
    #[builder(default = true)]
    pub wal_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./db_data"),
            page_size: 4096,
            buffer_pool_frames: 256,
            log_buffer_size: (256 + 1) * 4096,
            wal_enabled: true,
        }
    }
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{
        Config, DbError, DbResult, Fd, Iid, IndexId, PageId, PageNo, RecordId, Row, TableId,
        TransactionId,
    };
    pub use types::{SqlType, Value};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.page_size, 4096);
        assert_eq!(cfg.buffer_pool_frames, 256);
        assert!(cfg.wal_enabled);
    }

    #[test]
    fn db_error_formats_cleanly() {
        let err = DbError::TableNotFound("t".into());
        assert!(format!("{err}").contains("table not found"));
    }

    #[test]
    fn io_error_converts() {
        let e = std::io::Error::other("oops");
        let db_err: DbError = e.into();
        assert!(matches!(db_err, DbError::Io(_)));
    }

    #[test]
    fn record_id_packs_page_and_slot() {
        let rid = RecordId::new(7, 3);
        assert_eq!(rid.as_packed(), (7i64 << 32) | 3);
    }

    #[test]
    fn page_id_equality_considers_both_fields() {
        let a = PageId::new(1, 5);
        let b = PageId::new(2, 5);
        assert_ne!(a, b);
        assert_eq!(a, PageId::new(1, 5));
    }
}
