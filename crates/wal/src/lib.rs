//! ARIES-style write-ahead log: an append-only binary file, an in-memory
//! append buffer, and atomic LSN assignment. The log manager never
//! rewrites or truncates log bytes; all mutation happens by append.
//!
//! Every record shares a fixed header { type, LSN, total-length,
//! transaction-id, prev-LSN } followed by a type-specific body, matching
//! the on-disk layout the storage engine specification describes for
//! `db.log`. [`LogManager`] also implements [`buffer::LogFlusher`], so
//! the buffer pool can force a flush up to a page's LSN before evicting
//! a dirty frame (log force-at-eviction).

use common::{DbResult, Lsn, PageNo, RecordId, TransactionId, INVALID_TXN_ID, NO_LSN};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

const HEADER_LEN: usize = 4 + 4 + 4 + 8 + 4;
/// Trailing CRC32 over a record's header+body, written after every record.
/// A crash mid-append can leave a truncated or torn final record on disk;
/// the checksum lets `read_log_file` tell that apart from a genuine record
/// and treat it the same way as a short read — the scan simply ends.
const CRC_LEN: usize = 4;

const TAG_BEGIN: u32 = 0;
const TAG_COMMIT: u32 = 1;
const TAG_ABORT: u32 = 2;
const TAG_INSERT: u32 = 3;
const TAG_DELETE: u32 = 4;
const TAG_UPDATE: u32 = 5;
const TAG_CHECKPOINT: u32 = 6;

#[derive(Clone, Debug, PartialEq)]
pub enum LogRecordBody {
    Begin,
    Commit,
    Abort,
    Insert {
        table: String,
        rid: RecordId,
        after_image: Vec<u8>,
    },
    Delete {
        table: String,
        rid: RecordId,
        before_image: Vec<u8>,
    },
    Update {
        table: String,
        rid: RecordId,
        before_image: Vec<u8>,
        after_image: Vec<u8>,
    },
    Checkpoint {
        att: Vec<(TransactionId, Lsn)>,
        aborted: Vec<TransactionId>,
        dpt: Vec<(String, PageNo, Lsn)>,
        min_rec_lsn: Lsn,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TransactionId,
    pub prev_lsn: Lsn,
    pub body: LogRecordBody,
}

fn encode_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn decode_str(buf: &[u8], pos: &mut usize) -> String {
    let len = u16::from_le_bytes(buf[*pos..*pos + 2].try_into().unwrap()) as usize;
    *pos += 2;
    let s = String::from_utf8_lossy(&buf[*pos..*pos + len]).into_owned();
    *pos += len;
    s
}

fn encode_bytes(out: &mut Vec<u8>, b: &[u8]) {
    out.extend_from_slice(&(b.len() as u32).to_le_bytes());
    out.extend_from_slice(b);
}

fn decode_bytes(buf: &[u8], pos: &mut usize) -> Vec<u8> {
    let len = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap()) as usize;
    *pos += 4;
    let v = buf[*pos..*pos + len].to_vec();
    *pos += len;
    v
}

fn encode_rid(out: &mut Vec<u8>, rid: RecordId) {
    out.extend_from_slice(&rid.page_no.to_le_bytes());
    out.extend_from_slice(&rid.slot.to_le_bytes());
}

fn decode_rid(buf: &[u8], pos: &mut usize) -> RecordId {
    let page_no = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    let slot = u16::from_le_bytes(buf[*pos..*pos + 2].try_into().unwrap());
    *pos += 2;
    RecordId::new(page_no, slot)
}

fn type_tag(body: &LogRecordBody) -> u32 {
    match body {
        LogRecordBody::Begin => TAG_BEGIN,
        LogRecordBody::Commit => TAG_COMMIT,
        LogRecordBody::Abort => TAG_ABORT,
        LogRecordBody::Insert { .. } => TAG_INSERT,
        LogRecordBody::Delete { .. } => TAG_DELETE,
        LogRecordBody::Update { .. } => TAG_UPDATE,
        LogRecordBody::Checkpoint { .. } => TAG_CHECKPOINT,
    }
}

fn encode_body(body: &LogRecordBody) -> Vec<u8> {
    let mut out = Vec::new();
    match body {
        LogRecordBody::Begin | LogRecordBody::Commit | LogRecordBody::Abort => {}
        LogRecordBody::Insert { table, rid, after_image } => {
            encode_str(&mut out, table);
            encode_rid(&mut out, *rid);
            encode_bytes(&mut out, after_image);
        }
        LogRecordBody::Delete { table, rid, before_image } => {
            encode_str(&mut out, table);
            encode_rid(&mut out, *rid);
            encode_bytes(&mut out, before_image);
        }
        LogRecordBody::Update { table, rid, before_image, after_image } => {
            encode_str(&mut out, table);
            encode_rid(&mut out, *rid);
            encode_bytes(&mut out, before_image);
            encode_bytes(&mut out, after_image);
        }
        LogRecordBody::Checkpoint { att, aborted, dpt, min_rec_lsn } => {
            out.extend_from_slice(&(att.len() as u32).to_le_bytes());
            for (txn_id, lsn) in att {
                out.extend_from_slice(&txn_id.to_le_bytes());
                out.extend_from_slice(&lsn.to_le_bytes());
            }
            out.extend_from_slice(&(aborted.len() as u32).to_le_bytes());
            for txn_id in aborted {
                out.extend_from_slice(&txn_id.to_le_bytes());
            }
            out.extend_from_slice(&(dpt.len() as u32).to_le_bytes());
            for (table, page_no, lsn) in dpt {
                encode_str(&mut out, table);
                out.extend_from_slice(&page_no.to_le_bytes());
                out.extend_from_slice(&lsn.to_le_bytes());
            }
            out.extend_from_slice(&min_rec_lsn.to_le_bytes());
        }
    }
    out
}

fn decode_body(tag: u32, buf: &[u8]) -> DbResult<LogRecordBody> {
    let mut pos = 0usize;
    Ok(match tag {
        TAG_BEGIN => LogRecordBody::Begin,
        TAG_COMMIT => LogRecordBody::Commit,
        TAG_ABORT => LogRecordBody::Abort,
        TAG_INSERT => {
            let table = decode_str(buf, &mut pos);
            let rid = decode_rid(buf, &mut pos);
            let after_image = decode_bytes(buf, &mut pos);
            LogRecordBody::Insert { table, rid, after_image }
        }
        TAG_DELETE => {
            let table = decode_str(buf, &mut pos);
            let rid = decode_rid(buf, &mut pos);
            let before_image = decode_bytes(buf, &mut pos);
            LogRecordBody::Delete { table, rid, before_image }
        }
        TAG_UPDATE => {
            let table = decode_str(buf, &mut pos);
            let rid = decode_rid(buf, &mut pos);
            let before_image = decode_bytes(buf, &mut pos);
            let after_image = decode_bytes(buf, &mut pos);
            LogRecordBody::Update { table, rid, before_image, after_image }
        }
        TAG_CHECKPOINT => {
            let att_len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            let mut att = Vec::with_capacity(att_len);
            for _ in 0..att_len {
                let txn_id = TransactionId::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
                pos += 8;
                let lsn = Lsn::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
                pos += 4;
                att.push((txn_id, lsn));
            }
            let aborted_len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            let mut aborted = Vec::with_capacity(aborted_len);
            for _ in 0..aborted_len {
                let txn_id = TransactionId::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
                pos += 8;
                aborted.push(txn_id);
            }
            let dpt_len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            let mut dpt = Vec::with_capacity(dpt_len);
            for _ in 0..dpt_len {
                let table = decode_str(buf, &mut pos);
                let page_no = PageNo::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
                pos += 4;
                let lsn = Lsn::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
                pos += 4;
                dpt.push((table, page_no, lsn));
            }
            let min_rec_lsn = Lsn::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
            LogRecordBody::Checkpoint { att, aborted, dpt, min_rec_lsn }
        }
        other => return Err(common::DbError::Internal(format!("unknown log record tag {other}"))),
    })
}

fn write_header(out: &mut Vec<u8>, tag: u32, lsn: Lsn, total_len: u32, txn_id: TransactionId, prev_lsn: Lsn) {
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&lsn.to_le_bytes());
    out.extend_from_slice(&total_len.to_le_bytes());
    out.extend_from_slice(&txn_id.to_le_bytes());
    out.extend_from_slice(&prev_lsn.to_le_bytes());
}

fn read_header(buf: &[u8]) -> (u32, Lsn, u32, TransactionId, Lsn) {
    let tag = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let lsn = Lsn::from_le_bytes(buf[4..8].try_into().unwrap());
    let total_len = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    let txn_id = TransactionId::from_le_bytes(buf[12..20].try_into().unwrap());
    let prev_lsn = Lsn::from_le_bytes(buf[20..24].try_into().unwrap());
    (tag, lsn, total_len, txn_id, prev_lsn)
}

struct BufferState {
    buffer: Vec<u8>,
    persist_lsn: Lsn,
    /// LSN of the most recent record appended to `buffer`, if any. This is
    /// what `flush_locked` advances `persist_lsn` to — never the global
    /// counter, which may already have been bumped for a record still
    /// pending append (the overflow path in `append_internal` flushes
    /// before appending the record that triggered it).
    buffered_lsn: Option<Lsn>,
}

/// Append-only log file plus in-memory append buffer and atomic LSN
/// counter. Safe to share across threads: every append and flush takes
/// the same internal lock, so the buffer's byte order always matches
/// LSN assignment order.
pub struct LogManager {
    file: Mutex<File>,
    state: Mutex<BufferState>,
    global_lsn: AtomicI32,
    buffer_capacity: usize,
}

impl LogManager {
    pub fn open(path: impl AsRef<Path>, buffer_capacity: usize) -> DbResult<Self> {
        let file = OpenOptions::new().create(true).read(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            state: Mutex::new(BufferState {
                buffer: Vec::with_capacity(buffer_capacity),
                persist_lsn: NO_LSN,
                buffered_lsn: None,
            }),
            global_lsn: AtomicI32::new(0),
            buffer_capacity,
        })
    }

    /// Reseeds the next-LSN counter. Called by the recovery manager after
    /// analyze, per the restart contract: next-LSN = observed-max + 1.
    pub fn set_next_lsn(&self, next: Lsn) {
        self.global_lsn.store(next, Ordering::SeqCst);
    }

    pub fn persist_lsn(&self) -> Lsn {
        self.state.lock().unwrap().persist_lsn
    }

    fn append_internal(&self, tag: u32, txn_id: TransactionId, prev_lsn: Lsn, body: &[u8], force: bool) -> DbResult<Lsn> {
        let mut state = self.state.lock().unwrap();
        let lsn = self.global_lsn.fetch_add(1, Ordering::SeqCst);
        let total_len = (HEADER_LEN + body.len()) as u32;
        let mut record = Vec::with_capacity(total_len as usize + CRC_LEN);
        write_header(&mut record, tag, lsn, total_len, txn_id, prev_lsn);
        record.extend_from_slice(body);
        let crc = crc32fast::hash(&record);
        record.extend_from_slice(&crc.to_le_bytes());

        if state.buffer.len() + record.len() > self.buffer_capacity {
            self.flush_locked(&mut state)?;
        }
        state.buffer.extend_from_slice(&record);
        state.buffered_lsn = Some(lsn);
        log::debug!("wal: buffered lsn {lsn} (tag {tag}, {} bytes)", record.len());
        if force {
            self.flush_locked(&mut state)?;
        }
        Ok(lsn)
    }

    fn flush_locked(&self, state: &mut BufferState) -> DbResult<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        let mut file = self.file.lock().unwrap();
        file.write_all(&state.buffer)?;
        file.sync_data()?;
        if let Some(lsn) = state.buffered_lsn.take() {
            state.persist_lsn = lsn;
        }
        state.buffer.clear();
        log::debug!("wal: flushed log to disk, persist_lsn now {}", state.persist_lsn);
        Ok(())
    }

    /// Flushes the buffer unconditionally.
    pub fn flush(&self) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        self.flush_locked(&mut state)
    }

    pub fn append_begin(&self, txn_id: TransactionId) -> DbResult<Lsn> {
        self.append_internal(TAG_BEGIN, txn_id, NO_LSN, &[], false)
    }

    /// Force-flushed: commit only returns once the log is durable.
    pub fn append_commit(&self, txn_id: TransactionId, prev_lsn: Lsn) -> DbResult<Lsn> {
        self.append_internal(TAG_COMMIT, txn_id, prev_lsn, &[], true)
    }

    pub fn append_abort(&self, txn_id: TransactionId, prev_lsn: Lsn) -> DbResult<Lsn> {
        self.append_internal(TAG_ABORT, txn_id, prev_lsn, &[], true)
    }

    pub fn append_insert(
        &self,
        txn_id: TransactionId,
        prev_lsn: Lsn,
        table: &str,
        rid: RecordId,
        after_image: &[u8],
    ) -> DbResult<Lsn> {
        let body = encode_body(&LogRecordBody::Insert {
            table: table.to_string(),
            rid,
            after_image: after_image.to_vec(),
        });
        self.append_internal(TAG_INSERT, txn_id, prev_lsn, &body, false)
    }

    pub fn append_delete(
        &self,
        txn_id: TransactionId,
        prev_lsn: Lsn,
        table: &str,
        rid: RecordId,
        before_image: &[u8],
    ) -> DbResult<Lsn> {
        let body = encode_body(&LogRecordBody::Delete {
            table: table.to_string(),
            rid,
            before_image: before_image.to_vec(),
        });
        self.append_internal(TAG_DELETE, txn_id, prev_lsn, &body, false)
    }

    pub fn append_update(
        &self,
        txn_id: TransactionId,
        prev_lsn: Lsn,
        table: &str,
        rid: RecordId,
        before_image: &[u8],
        after_image: &[u8],
    ) -> DbResult<Lsn> {
        let body = encode_body(&LogRecordBody::Update {
            table: table.to_string(),
            rid,
            before_image: before_image.to_vec(),
            after_image: after_image.to_vec(),
        });
        self.append_internal(TAG_UPDATE, txn_id, prev_lsn, &body, false)
    }

    /// Checkpoints are self-contained: each one ignores any prior
    /// checkpoint's contents, matching the source engine's behavior.
    pub fn append_checkpoint(
        &self,
        att: Vec<(TransactionId, Lsn)>,
        aborted: Vec<TransactionId>,
        dpt: Vec<(String, PageNo, Lsn)>,
        min_rec_lsn: Lsn,
    ) -> DbResult<Lsn> {
        let body = encode_body(&LogRecordBody::Checkpoint { att, aborted, dpt, min_rec_lsn });
        self.append_internal(TAG_CHECKPOINT, INVALID_TXN_ID, NO_LSN, &body, true)
    }
}

impl buffer::LogFlusher for LogManager {
    fn flush_up_to(&self, lsn: Lsn) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.persist_lsn >= lsn {
            return Ok(());
        }
        self.flush_locked(&mut state)
    }
}

/// Reads every record from an on-disk log file in append order. Used by
/// the recovery manager's analyze/redo/undo passes.
pub fn read_log_file(path: impl AsRef<Path>) -> DbResult<Vec<LogRecord>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + HEADER_LEN <= bytes.len() {
        let (tag, lsn, total_len, txn_id, prev_lsn) = read_header(&bytes[pos..pos + HEADER_LEN]);
        let total_len = total_len as usize;
        if total_len < HEADER_LEN || pos + total_len + CRC_LEN > bytes.len() {
            break;
        }
        let record_bytes = &bytes[pos..pos + total_len];
        let stored_crc = u32::from_le_bytes(bytes[pos + total_len..pos + total_len + CRC_LEN].try_into().unwrap());
        if crc32fast::hash(record_bytes) != stored_crc {
            log::warn!("wal: crc mismatch at offset {pos}, treating as end of log (torn write)");
            break;
        }
        let body = decode_body(tag, &record_bytes[HEADER_LEN..])?;
        out.push(LogRecord { lsn, txn_id, prev_lsn, body });
        pos += total_len + CRC_LEN;
    }
    Ok(out)
}

/// Writes `db.restart`: a tiny file holding the most recent checkpoint's
/// LSN, written atomically (temp file + rename).
pub fn write_restart_file(path: impl AsRef<Path>, checkpoint_lsn: Lsn) -> DbResult<()> {
    let path = path.as_ref();
    let tmp = path.with_extension("restart.tmp");
    std::fs::write(&tmp, checkpoint_lsn.to_le_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_restart_file(path: impl AsRef<Path>) -> DbResult<Option<Lsn>> {
    match std::fs::read(path.as_ref()) {
        Ok(bytes) if bytes.len() == 4 => Ok(Some(Lsn::from_le_bytes(bytes.try_into().unwrap()))),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buffer::LogFlusher;
    use pretty_assertions::assert_eq;

    #[test]
    fn append_and_read_back_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("db.log");
        let mgr = LogManager::open(&log_path, 4096).unwrap();

        let begin_lsn = mgr.append_begin(1).unwrap();
        let insert_lsn = mgr
            .append_insert(1, begin_lsn, "t1", RecordId::new(0, 0), b"hello")
            .unwrap();
        mgr.append_commit(1, insert_lsn).unwrap();
        mgr.flush().unwrap();

        let records = read_log_file(&log_path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].body, LogRecordBody::Begin);
        match &records[1].body {
            LogRecordBody::Insert { table, rid, after_image } => {
                assert_eq!(table, "t1");
                assert_eq!(*rid, RecordId::new(0, 0));
                assert_eq!(after_image, b"hello");
            }
            other => panic!("unexpected body: {other:?}"),
        }
        assert_eq!(records[2].body, LogRecordBody::Commit);
    }

    #[test]
    fn commit_force_flushes_even_with_room_left_in_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("db.log");
        let mgr = LogManager::open(&log_path, 1 << 20).unwrap();
        let lsn = mgr.append_begin(1).unwrap();
        mgr.append_commit(1, lsn).unwrap();
        assert!(mgr.persist_lsn() >= lsn + 1);
    }

    #[test]
    fn buffer_overflow_triggers_flush_before_append() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("db.log");
        let mgr = LogManager::open(&log_path, 64).unwrap();
        for i in 0..20 {
            mgr.append_insert(1, NO_LSN, "t1", RecordId::new(i, 0), b"xx").unwrap();
        }
        mgr.flush().unwrap();
        let records = read_log_file(&log_path).unwrap();
        assert_eq!(records.len(), 20);
    }

    #[test]
    fn flush_up_to_is_a_noop_when_already_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("db.log");
        let mgr = LogManager::open(&log_path, 4096).unwrap();
        let lsn = mgr.append_begin(1).unwrap();
        mgr.append_commit(1, lsn).unwrap();
        let persisted = mgr.persist_lsn();
        mgr.flush_up_to(persisted).unwrap();
        assert_eq!(mgr.persist_lsn(), persisted);
    }

    #[test]
    fn checkpoint_round_trips_att_and_dpt() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("db.log");
        let mgr = LogManager::open(&log_path, 4096).unwrap();
        mgr.append_checkpoint(
            vec![(1, 10), (2, 12)],
            vec![3],
            vec![("t1".to_string(), 0, 5)],
            5,
        )
        .unwrap();

        let records = read_log_file(&log_path).unwrap();
        match &records[0].body {
            LogRecordBody::Checkpoint { att, aborted, dpt, min_rec_lsn } => {
                assert_eq!(att, &vec![(1, 10), (2, 12)]);
                assert_eq!(aborted, &vec![3]);
                assert_eq!(dpt, &vec![("t1".to_string(), 0, 5)]);
                assert_eq!(*min_rec_lsn, 5);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn restart_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.restart");
        assert_eq!(read_restart_file(&path).unwrap(), None);
        write_restart_file(&path, 42).unwrap();
        assert_eq!(read_restart_file(&path).unwrap(), Some(42));
    }
}
