//! Clustered B+-tree index: order-N tree with leaf chaining, split/merge,
//! and range iterators, built directly on the buffer pool.
//!
//! Interior nodes store `(key, child page)` pairs; leaves store
//! `(key, RID)` pairs and are doubly linked for range scans. Structural
//! mutations (`insert_entry`, `delete_entry`) are serialized by one
//! index-level root latch; pure lookups (`get_value`, the bound
//! finders, and leaf iteration) only ever take a frame's shared read
//! latch, so they proceed concurrently with each other and are blocked
//! only by a page actually being written.

mod key;
mod layout;

use buffer::{BufferPoolManager, PageGuard};
use common::{DbError, DbResult, Fd, PageId, PageNo, RecordId, INVALID_PAGE_NO};
use layout::{IndexFileHeader, NodeHeader, NodePage};
use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use types::{SqlType, Value};

pub use layout::{max_size as order_max_size, min_size as order_min_size};

#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

enum InsertResult {
    Duplicate,
    Done,
    Split { split_key: Vec<u8>, new_page_no: PageNo },
}

enum DeleteResult {
    NotFound,
    Done,
    Underflow,
}

/// A cursor into a B+-tree leaf: the leaf's page number and a slot index
/// within it. Re-exported as `Iid` (index id), used by range iterators
/// and as the lock manager's gap-lock resource key.
pub type Iid = common::Iid;

pub struct BTreeIndex {
    pool: Arc<BufferPoolManager>,
    fd: Fd,
    key_schema: Vec<SqlType>,
    key_len: usize,
    max_size: usize,
    min_size: usize,
    root_latch: Mutex<()>,
}

impl BTreeIndex {
    /// Creates a brand-new, empty index file: page 0 is the file header,
    /// page 1 is the (empty) root leaf.
    pub fn create(pool: Arc<BufferPoolManager>, fd: Fd, key_schema: Vec<SqlType>) -> DbResult<Self> {
        let key_len = key::key_len(&key_schema);
        let max_size = layout::max_size(key_len);
        let min_size = layout::min_size(max_size);

        let (header_page, mut header_guard) = Self::alloc_raw(&pool, fd)?;
        debug_assert_eq!(header_page, 0);
        let (root_page, mut root_guard) = Self::alloc_raw(&pool, fd)?;
        {
            let mut buf = root_guard.write();
            let mut np = NodePage::new(&mut buf, key_len, max_size);
            np.set_header(NodeHeader::empty_leaf());
        }
        {
            let mut buf = header_guard.write();
            IndexFileHeader {
                root_page_no: root_page,
                first_leaf: root_page,
                last_leaf: root_page,
                key_len: key_len as u16,
                is_empty: true,
            }
            .write(&mut buf);
        }
        log::info!("btree: created index on fd {fd} (key_len {key_len}, order {max_size})");
        Ok(Self {
            pool,
            fd,
            key_schema,
            key_len,
            max_size,
            min_size,
            root_latch: Mutex::new(()),
        })
    }

    /// Opens an existing index file, reading its header from page 0.
    pub fn open(pool: Arc<BufferPoolManager>, fd: Fd, key_schema: Vec<SqlType>) -> DbResult<Self> {
        let key_len = key::key_len(&key_schema);
        let max_size = layout::max_size(key_len);
        let min_size = layout::min_size(max_size);
        Ok(Self {
            pool,
            fd,
            key_schema,
            key_len,
            max_size,
            min_size,
            root_latch: Mutex::new(()),
        })
    }

    pub fn fd(&self) -> Fd {
        self.fd
    }

    fn alloc_raw(pool: &Arc<BufferPoolManager>, fd: Fd) -> DbResult<(PageNo, PageGuard)> {
        let (page_id, guard) = pool
            .new_page(fd)?
            .ok_or_else(|| DbError::Internal("buffer pool exhausted while building index".into()))?;
        Ok((page_id.page_no, guard))
    }

    fn alloc(&self) -> DbResult<(PageNo, PageGuard)> {
        Self::alloc_raw(&self.pool, self.fd)
    }

    fn fetch(&self, page_no: PageNo) -> DbResult<PageGuard> {
        self.pool
            .fetch_page(PageId::new(self.fd, page_no))?
            .ok_or_else(|| DbError::Internal("buffer pool exhausted fetching index page".into()))
    }

    fn read_header(&self) -> DbResult<IndexFileHeader> {
        let guard = self.fetch(0)?;
        Ok(IndexFileHeader::read(&guard.read()))
    }

    fn write_header(&self, header: &IndexFileHeader) -> DbResult<()> {
        let mut guard = self.fetch(0)?;
        header.write(&mut guard.write());
        Ok(())
    }

    fn set_parent(&self, child: PageNo, parent: PageNo) -> DbResult<()> {
        let mut guard = self.fetch(child)?;
        let mut buf = guard.write();
        let mut h = NodeHeader::read(&buf);
        h.parent = parent;
        h.write(&mut buf);
        Ok(())
    }

    fn leaf_search(&self, guard: &PageGuard, key_count: u16, key_bytes: &[u8]) -> (u16, bool) {
        let buf = guard.read();
        let mut idx = 0u16;
        while idx < key_count {
            match key::compare(layout::key_at_ro(&buf, idx, self.key_len, self.max_size), key_bytes) {
                Ordering::Less => idx += 1,
                Ordering::Equal => return (idx, true),
                Ordering::Greater => break,
            }
        }
        (idx, false)
    }

    fn interior_child_index(&self, guard: &PageGuard, key_count: u16, key_bytes: &[u8]) -> u16 {
        let buf = guard.read();
        let mut idx = 0u16;
        while idx < key_count
            && key::compare(layout::key_at_ro(&buf, idx, self.key_len, self.max_size), key_bytes)
                != Ordering::Greater
        {
            idx += 1;
        }
        idx
    }

    // ---- Lookups ----

    pub fn get_value(&self, key: &[Value]) -> DbResult<Option<RecordId>> {
        let key_bytes = key::encode(key, &self.key_schema);
        let header = self.read_header()?;
        if header.is_empty {
            return Ok(None);
        }
        let leaf_no = self.find_leaf_ro(header.root_page_no, &key_bytes)?;
        let guard = self.fetch(leaf_no)?;
        let buf = guard.read();
        let h = NodeHeader::read(&buf);
        for i in 0..h.key_count {
            let k = layout::key_at_ro(&buf, i, self.key_len, self.max_size);
            match key::compare(k, &key_bytes) {
                Ordering::Equal => return Ok(Some(layout::rid_at_ro(&buf, i, self.key_len, self.max_size))),
                Ordering::Greater => break,
                Ordering::Less => {}
            }
        }
        Ok(None)
    }

    fn find_leaf_ro(&self, mut page_no: PageNo, key_bytes: &[u8]) -> DbResult<PageNo> {
        loop {
            let guard = self.fetch(page_no)?;
            let buf = guard.read();
            let h = NodeHeader::read(&buf);
            if h.is_leaf {
                return Ok(page_no);
            }
            let mut idx = 0u16;
            while idx < h.key_count
                && key::compare(layout::key_at_ro(&buf, idx, self.key_len, self.max_size), key_bytes)
                    != Ordering::Greater
            {
                idx += 1;
            }
            page_no = layout::child_at_ro(&buf, idx, self.key_len, self.max_size);
        }
    }

    /// Lowest slot whose key is `>= key`, rolling forward to the next
    /// leaf if the bound lands past the last entry (unless this is the
    /// final leaf, in which case the cursor equals `LeafEnd`).
    pub fn lower_bound(&self, key: &[Value]) -> DbResult<Iid> {
        let key_bytes = key::encode(key, &self.key_schema);
        let header = self.read_header()?;
        if header.is_empty {
            return Ok(Iid::new(header.last_leaf, 0));
        }
        let leaf_no = self.find_leaf_ro(header.root_page_no, &key_bytes)?;
        self.bound_within_leaf(leaf_no, &key_bytes, false)
    }

    /// Lowest slot whose key is `> key`.
    pub fn upper_bound(&self, key: &[Value]) -> DbResult<Iid> {
        let key_bytes = key::encode(key, &self.key_schema);
        let header = self.read_header()?;
        if header.is_empty {
            return Ok(Iid::new(header.last_leaf, 0));
        }
        let leaf_no = self.find_leaf_ro(header.root_page_no, &key_bytes)?;
        self.bound_within_leaf(leaf_no, &key_bytes, true)
    }

    fn bound_within_leaf(&self, leaf_no: PageNo, key_bytes: &[u8], strict: bool) -> DbResult<Iid> {
        let guard = self.fetch(leaf_no)?;
        let buf = guard.read();
        let h = NodeHeader::read(&buf);
        let mut idx = 0u16;
        while idx < h.key_count {
            let k = layout::key_at_ro(&buf, idx, self.key_len, self.max_size);
            let past = if strict {
                key::compare(k, key_bytes) != Ordering::Greater
            } else {
                key::compare(k, key_bytes) == Ordering::Less
            };
            if !past {
                break;
            }
            idx += 1;
        }
        if idx == h.key_count && h.next_leaf != INVALID_PAGE_NO {
            return Ok(Iid::new(h.next_leaf, 0));
        }
        Ok(Iid::new(leaf_no, idx))
    }

    pub fn leaf_begin(&self) -> DbResult<Iid> {
        let header = self.read_header()?;
        Ok(Iid::new(header.first_leaf, 0))
    }

    pub fn leaf_end(&self) -> DbResult<Iid> {
        let header = self.read_header()?;
        let guard = self.fetch(header.last_leaf)?;
        let h = NodeHeader::read(&guard.read());
        Ok(Iid::new(header.last_leaf, h.key_count))
    }

    /// Reads the `(key, RID)` pair at `iid` along with the cursor one
    /// step past it (rolling onto the next leaf as needed), or `None` if
    /// `iid` is already at `LeafEnd`.
    pub fn read_at(&self, iid: Iid) -> DbResult<Option<(Vec<Value>, RecordId, Iid)>> {
        let guard = self.fetch(iid.page_no)?;
        let buf = guard.read();
        let h = NodeHeader::read(&buf);
        if iid.slot >= h.key_count {
            return Ok(None);
        }
        let key_bytes = layout::key_at_ro(&buf, iid.slot, self.key_len, self.max_size).to_vec();
        let rid = layout::rid_at_ro(&buf, iid.slot, self.key_len, self.max_size);
        let next = if iid.slot + 1 < h.key_count {
            Iid::new(iid.page_no, iid.slot + 1)
        } else if h.next_leaf != INVALID_PAGE_NO {
            Iid::new(h.next_leaf, 0)
        } else {
            Iid::new(iid.page_no, h.key_count)
        };
        Ok(Some((key::decode(&key_bytes, &self.key_schema), rid, next)))
    }

    /// Iterates `[start, end)` in non-decreasing key order.
    pub fn range(&self, start: Iid, end: Iid) -> RangeIter<'_> {
        RangeIter {
            index: self,
            cursor: Some(start),
            end,
        }
    }

    // ---- Insertion ----

    pub fn insert_entry(&self, key: &[Value], rid: RecordId) -> DbResult<InsertOutcome> {
        let _guard = self.root_latch.lock().unwrap();
        let key_bytes = key::encode(key, &self.key_schema);
        let mut header = self.read_header()?;

        if header.is_empty {
            self.leaf_insert_direct(header.root_page_no, &key_bytes, rid)?;
            header.is_empty = false;
            self.write_header(&header)?;
            return Ok(InsertOutcome::Inserted);
        }

        match self.insert_recursive(header.root_page_no, &key_bytes, rid)? {
            InsertResult::Duplicate => Ok(InsertOutcome::Duplicate),
            InsertResult::Done => Ok(InsertOutcome::Inserted),
            InsertResult::Split { split_key, new_page_no } => {
                let (new_root_no, mut guard) = self.alloc()?;
                {
                    let mut buf = guard.write();
                    let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
                    np.set_header(NodeHeader::empty_interior());
                    np.set_key_at(0, &split_key);
                    np.set_child_at(0, header.root_page_no);
                    np.set_child_at(1, new_page_no);
                    let mut h = np.header();
                    h.key_count = 1;
                    np.set_header(h);
                }
                drop(guard);
                self.set_parent(header.root_page_no, new_root_no)?;
                self.set_parent(new_page_no, new_root_no)?;
                header.root_page_no = new_root_no;
                self.write_header(&header)?;
                log::debug!("btree: grew a new root on fd {}", self.fd);
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    fn leaf_insert_direct(&self, page_no: PageNo, key_bytes: &[u8], rid: RecordId) -> DbResult<()> {
        let mut guard = self.fetch(page_no)?;
        let mut buf = guard.write();
        let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
        np.set_key_at(0, key_bytes);
        np.set_rid_at(0, rid);
        let mut h = np.header();
        h.key_count = 1;
        np.set_header(h);
        Ok(())
    }

    fn insert_recursive(&self, page_no: PageNo, key_bytes: &[u8], rid: RecordId) -> DbResult<InsertResult> {
        let guard = self.fetch(page_no)?;
        let header = NodeHeader::read(&guard.read());

        if header.is_leaf {
            let (idx, found) = self.leaf_search(&guard, header.key_count, key_bytes);
            if found {
                return Ok(InsertResult::Duplicate);
            }
            {
                let mut buf = guard.write();
                let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
                np.shift_keys_right(idx, header.key_count);
                np.shift_rids_right(idx, header.key_count);
                np.set_key_at(idx, key_bytes);
                np.set_rid_at(idx, rid);
                let mut h = np.header();
                h.key_count += 1;
                np.set_header(h);
            }
            drop(guard);
            let new_count = header.key_count + 1;
            if (new_count as usize) < self.max_size {
                return Ok(InsertResult::Done);
            }
            self.split_leaf(page_no)
        } else {
            let idx = self.interior_child_index(&guard, header.key_count, key_bytes);
            let child_no = layout::child_at_ro(&guard.read(), idx, self.key_len, self.max_size);
            drop(guard);
            match self.insert_recursive(child_no, key_bytes, rid)? {
                InsertResult::Duplicate => Ok(InsertResult::Duplicate),
                InsertResult::Done => Ok(InsertResult::Done),
                InsertResult::Split { split_key, new_page_no } => {
                    self.interior_insert(page_no, idx, &split_key, new_page_no)
                }
            }
        }
    }

    fn interior_insert(
        &self,
        page_no: PageNo,
        idx: u16,
        split_key: &[u8],
        new_page_no: PageNo,
    ) -> DbResult<InsertResult> {
        let mut guard = self.fetch(page_no)?;
        let header = NodeHeader::read(&guard.read());
        {
            let mut buf = guard.write();
            let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
            np.shift_keys_right(idx, header.key_count);
            np.set_key_at(idx, split_key);
            np.shift_children_right(idx + 1, header.key_count + 1);
            np.set_child_at(idx + 1, new_page_no);
            let mut h = np.header();
            h.key_count += 1;
            np.set_header(h);
        }
        drop(guard);
        self.set_parent(new_page_no, page_no)?;
        let new_count = header.key_count + 1;
        if (new_count as usize) < self.max_size {
            return Ok(InsertResult::Done);
        }
        self.split_interior(page_no)
    }

    fn split_leaf(&self, page_no: PageNo) -> DbResult<InsertResult> {
        let mut left_guard = self.fetch(page_no)?;
        let header = NodeHeader::read(&left_guard.read());
        let total = header.key_count;
        let mid = total / 2;

        let (mut right_keys, mut right_rids) = (Vec::new(), Vec::new());
        {
            let buf = left_guard.read();
            for i in mid..total {
                right_keys.push(layout::key_at_ro(&buf, i, self.key_len, self.max_size).to_vec());
                right_rids.push(layout::rid_at_ro(&buf, i, self.key_len, self.max_size));
            }
        }

        let (right_no, mut right_guard) = self.alloc()?;
        {
            let mut buf = right_guard.write();
            let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
            np.set_header(NodeHeader {
                parent: header.parent,
                key_count: right_keys.len() as u16,
                is_leaf: true,
                prev_leaf: page_no,
                next_leaf: header.next_leaf,
            });
            for (i, (k, r)) in right_keys.iter().zip(right_rids.iter()).enumerate() {
                np.set_key_at(i as u16, k);
                np.set_rid_at(i as u16, *r);
            }
        }
        drop(right_guard);

        if header.next_leaf != INVALID_PAGE_NO {
            let mut next_guard = self.fetch(header.next_leaf)?;
            let mut nb = next_guard.write();
            let mut nh = NodeHeader::read(&nb);
            nh.prev_leaf = right_no;
            nh.write(&mut nb);
        } else {
            let mut fh = self.read_header()?;
            fh.last_leaf = right_no;
            self.write_header(&fh)?;
        }

        {
            let mut buf = left_guard.write();
            let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
            let mut h = np.header();
            h.key_count = mid;
            h.next_leaf = right_no;
            np.set_header(h);
        }

        let split_key = right_keys.first().cloned().unwrap_or_default();
        Ok(InsertResult::Split { split_key, new_page_no: right_no })
    }

    fn split_interior(&self, page_no: PageNo) -> DbResult<InsertResult> {
        let mut left_guard = self.fetch(page_no)?;
        let header = NodeHeader::read(&left_guard.read());
        let total = header.key_count;
        let mid = total / 2;

        let split_key = layout::key_at_ro(&left_guard.read(), mid, self.key_len, self.max_size).to_vec();
        let (mut right_keys, mut right_children) = (Vec::new(), Vec::new());
        {
            let buf = left_guard.read();
            for i in (mid + 1)..total {
                right_keys.push(layout::key_at_ro(&buf, i, self.key_len, self.max_size).to_vec());
            }
            for i in (mid + 1)..=total {
                right_children.push(layout::child_at_ro(&buf, i, self.key_len, self.max_size));
            }
        }

        let (right_no, mut right_guard) = self.alloc()?;
        {
            let mut buf = right_guard.write();
            let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
            np.set_header(NodeHeader {
                parent: header.parent,
                key_count: right_keys.len() as u16,
                is_leaf: false,
                prev_leaf: INVALID_PAGE_NO,
                next_leaf: INVALID_PAGE_NO,
            });
            for (i, k) in right_keys.iter().enumerate() {
                np.set_key_at(i as u16, k);
            }
            for (i, c) in right_children.iter().enumerate() {
                np.set_child_at(i as u16, *c);
            }
        }
        drop(right_guard);

        for &c in &right_children {
            self.set_parent(c, right_no)?;
        }

        {
            let mut buf = left_guard.write();
            let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
            let mut h = np.header();
            h.key_count = mid;
            np.set_header(h);
        }

        Ok(InsertResult::Split { split_key, new_page_no: right_no })
    }

    // ---- Deletion ----

    pub fn delete_entry(&self, key: &[Value]) -> DbResult<bool> {
        let _guard = self.root_latch.lock().unwrap();
        let key_bytes = key::encode(key, &self.key_schema);
        let mut header = self.read_header()?;
        if header.is_empty {
            return Ok(false);
        }

        let result = self.delete_recursive(header.root_page_no, None, &key_bytes)?;
        if matches!(result, DeleteResult::NotFound) {
            return Ok(false);
        }

        let root_header = NodeHeader::read(&self.fetch(header.root_page_no)?.read());
        if root_header.is_leaf {
            if root_header.key_count == 0 {
                header.is_empty = true;
                self.write_header(&header)?;
            }
        } else if root_header.key_count == 0 {
            let only_child = layout::child_at_ro(
                &self.fetch(header.root_page_no)?.read(),
                0,
                self.key_len,
                self.max_size,
            );
            self.set_parent(only_child, INVALID_PAGE_NO)?;
            header.root_page_no = only_child;
            self.write_header(&header)?;
            log::debug!("btree: collapsed a root on fd {}", self.fd);
        }
        Ok(true)
    }

    fn delete_recursive(
        &self,
        page_no: PageNo,
        parent_ctx: Option<(PageNo, u16)>,
        key_bytes: &[u8],
    ) -> DbResult<DeleteResult> {
        let guard = self.fetch(page_no)?;
        let header = NodeHeader::read(&guard.read());

        if header.is_leaf {
            let (idx, found) = self.leaf_search(&guard, header.key_count, key_bytes);
            if !found {
                return Ok(DeleteResult::NotFound);
            }
            {
                let mut buf = guard.write();
                let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
                np.shift_keys_left(idx, header.key_count);
                np.shift_rids_left(idx, header.key_count);
                let mut h = np.header();
                h.key_count -= 1;
                np.set_header(h);
            }
            let new_count = header.key_count - 1;

            if idx == 0 && new_count > 0 {
                if let Some((parent_no, child_idx)) = parent_ctx {
                    if child_idx > 0 {
                        let new_first =
                            layout::key_at_ro(&guard.read(), 0, self.key_len, self.max_size).to_vec();
                        drop(guard);
                        self.fix_separator(parent_no, child_idx, &new_first)?;
                        if parent_ctx.is_none() || (new_count as usize) >= self.min_size {
                            return Ok(DeleteResult::Done);
                        }
                        return Ok(DeleteResult::Underflow);
                    }
                }
            }

            if parent_ctx.is_none() || (new_count as usize) >= self.min_size {
                Ok(DeleteResult::Done)
            } else {
                Ok(DeleteResult::Underflow)
            }
        } else {
            let idx = self.interior_child_index(&guard, header.key_count, key_bytes);
            let child_no = layout::child_at_ro(&guard.read(), idx, self.key_len, self.max_size);
            drop(guard);
            match self.delete_recursive(child_no, Some((page_no, idx)), key_bytes)? {
                DeleteResult::NotFound => Ok(DeleteResult::NotFound),
                DeleteResult::Done => Ok(DeleteResult::Done),
                DeleteResult::Underflow => self.resolve_underflow(page_no, idx, child_no, parent_ctx),
            }
        }
    }

    fn fix_separator(&self, parent_no: PageNo, child_idx: u16, new_key: &[u8]) -> DbResult<()> {
        let mut g = self.fetch(parent_no)?;
        let mut buf = g.write();
        let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
        np.set_key_at(child_idx - 1, new_key);
        Ok(())
    }

    fn resolve_underflow(
        &self,
        parent_no: PageNo,
        child_idx: u16,
        child_no: PageNo,
        parent_ctx: Option<(PageNo, u16)>,
    ) -> DbResult<DeleteResult> {
        let parent_header = NodeHeader::read(&self.fetch(parent_no)?.read());

        if child_idx > 0 {
            let left_no =
                layout::child_at_ro(&self.fetch(parent_no)?.read(), child_idx - 1, self.key_len, self.max_size);
            let left_header = NodeHeader::read(&self.fetch(left_no)?.read());
            if (left_header.key_count as usize) > self.min_size {
                self.redistribute_from_left(parent_no, child_idx, left_no, child_no)?;
                return Ok(DeleteResult::Done);
            }
        }
        if child_idx < parent_header.key_count {
            let right_no =
                layout::child_at_ro(&self.fetch(parent_no)?.read(), child_idx + 1, self.key_len, self.max_size);
            let right_header = NodeHeader::read(&self.fetch(right_no)?.read());
            if (right_header.key_count as usize) > self.min_size {
                self.redistribute_from_right(parent_no, child_idx, child_no, right_no)?;
                return Ok(DeleteResult::Done);
            }
        }

        if child_idx > 0 {
            let left_no =
                layout::child_at_ro(&self.fetch(parent_no)?.read(), child_idx - 1, self.key_len, self.max_size);
            self.coalesce(parent_no, child_idx - 1, left_no, child_no)?;
        } else {
            let right_no =
                layout::child_at_ro(&self.fetch(parent_no)?.read(), child_idx + 1, self.key_len, self.max_size);
            self.coalesce(parent_no, child_idx, child_no, right_no)?;
        }

        let new_parent_header = NodeHeader::read(&self.fetch(parent_no)?.read());
        if parent_ctx.is_none() || (new_parent_header.key_count as usize) >= self.min_size {
            Ok(DeleteResult::Done)
        } else {
            Ok(DeleteResult::Underflow)
        }
    }

    fn redistribute_from_left(
        &self,
        parent_no: PageNo,
        child_idx: u16,
        left_no: PageNo,
        right_no: PageNo,
    ) -> DbResult<()> {
        let left_guard = self.fetch(left_no)?;
        let right_guard = self.fetch(right_no)?;
        let left_header = NodeHeader::read(&left_guard.read());
        let right_header = NodeHeader::read(&right_guard.read());

        if left_header.is_leaf {
            let (last_key, last_rid) = {
                let buf = left_guard.read();
                (
                    layout::key_at_ro(&buf, left_header.key_count - 1, self.key_len, self.max_size).to_vec(),
                    layout::rid_at_ro(&buf, left_header.key_count - 1, self.key_len, self.max_size),
                )
            };
            {
                let mut buf = left_guard.write();
                let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
                let mut h = np.header();
                h.key_count -= 1;
                np.set_header(h);
            }
            {
                let mut buf = right_guard.write();
                let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
                np.shift_keys_right(0, right_header.key_count);
                np.shift_rids_right(0, right_header.key_count);
                np.set_key_at(0, &last_key);
                np.set_rid_at(0, last_rid);
                let mut h = np.header();
                h.key_count += 1;
                np.set_header(h);
            }
            let mut pg = self.fetch(parent_no)?;
            let mut pbuf = pg.write();
            let mut pnp = NodePage::new(&mut pbuf, self.key_len, self.max_size);
            pnp.set_key_at(child_idx - 1, &last_key);
        } else {
            let (last_key, last_child) = {
                let buf = left_guard.read();
                (
                    layout::key_at_ro(&buf, left_header.key_count - 1, self.key_len, self.max_size).to_vec(),
                    layout::child_at_ro(&buf, left_header.key_count, self.key_len, self.max_size),
                )
            };
            let sep_key = {
                let pg = self.fetch(parent_no)?;
                layout::key_at_ro(&pg.read(), child_idx - 1, self.key_len, self.max_size).to_vec()
            };
            {
                let mut buf = left_guard.write();
                let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
                let mut h = np.header();
                h.key_count -= 1;
                np.set_header(h);
            }
            {
                let mut buf = right_guard.write();
                let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
                np.shift_keys_right(0, right_header.key_count);
                np.shift_children_right(0, right_header.key_count + 1);
                np.set_key_at(0, &sep_key);
                np.set_child_at(0, last_child);
                let mut h = np.header();
                h.key_count += 1;
                np.set_header(h);
            }
            {
                let mut pg = self.fetch(parent_no)?;
                let mut pbuf = pg.write();
                let mut pnp = NodePage::new(&mut pbuf, self.key_len, self.max_size);
                pnp.set_key_at(child_idx - 1, &last_key);
            }
            drop(left_guard);
            drop(right_guard);
            self.set_parent(last_child, right_no)?;
        }
        Ok(())
    }

    fn redistribute_from_right(
        &self,
        parent_no: PageNo,
        child_idx: u16,
        left_no: PageNo,
        right_no: PageNo,
    ) -> DbResult<()> {
        let left_guard = self.fetch(left_no)?;
        let right_guard = self.fetch(right_no)?;
        let left_header = NodeHeader::read(&left_guard.read());
        let right_header = NodeHeader::read(&right_guard.read());

        if left_header.is_leaf {
            let (first_key, first_rid) = {
                let buf = right_guard.read();
                (
                    layout::key_at_ro(&buf, 0, self.key_len, self.max_size).to_vec(),
                    layout::rid_at_ro(&buf, 0, self.key_len, self.max_size),
                )
            };
            {
                let mut buf = left_guard.write();
                let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
                np.set_key_at(left_header.key_count, &first_key);
                np.set_rid_at(left_header.key_count, first_rid);
                let mut h = np.header();
                h.key_count += 1;
                np.set_header(h);
            }
            {
                let mut buf = right_guard.write();
                let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
                np.shift_keys_left(0, right_header.key_count);
                np.shift_rids_left(0, right_header.key_count);
                let mut h = np.header();
                h.key_count -= 1;
                np.set_header(h);
            }
            let new_right_first = layout::key_at_ro(&right_guard.read(), 0, self.key_len, self.max_size).to_vec();
            let mut pg = self.fetch(parent_no)?;
            let mut pbuf = pg.write();
            let mut pnp = NodePage::new(&mut pbuf, self.key_len, self.max_size);
            pnp.set_key_at(child_idx, &new_right_first);
        } else {
            let (first_key, first_child) = {
                let buf = right_guard.read();
                (
                    layout::key_at_ro(&buf, 0, self.key_len, self.max_size).to_vec(),
                    layout::child_at_ro(&buf, 0, self.key_len, self.max_size),
                )
            };
            let sep_key = {
                let pg = self.fetch(parent_no)?;
                layout::key_at_ro(&pg.read(), child_idx, self.key_len, self.max_size).to_vec()
            };
            {
                let mut buf = left_guard.write();
                let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
                np.set_key_at(left_header.key_count, &sep_key);
                np.set_child_at(left_header.key_count + 1, first_child);
                let mut h = np.header();
                h.key_count += 1;
                np.set_header(h);
            }
            {
                let mut buf = right_guard.write();
                let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
                np.shift_keys_left(0, right_header.key_count);
                np.shift_children_left(0, right_header.key_count + 1);
                let mut h = np.header();
                h.key_count -= 1;
                np.set_header(h);
            }
            {
                let mut pg = self.fetch(parent_no)?;
                let mut pbuf = pg.write();
                let mut pnp = NodePage::new(&mut pbuf, self.key_len, self.max_size);
                pnp.set_key_at(child_idx, &first_key);
            }
            drop(left_guard);
            drop(right_guard);
            self.set_parent(first_child, left_no)?;
        }
        Ok(())
    }

    /// Merges `right_no` into `left_no` and removes the separator at
    /// `left_child_idx` (and the now-redundant child pointer) from
    /// `parent_no`. `right_no` is left as an orphaned, unreferenced page;
    /// this engine does not reclaim index pages, matching the heap
    /// file's own non-goal of physical vacuum.
    fn coalesce(&self, parent_no: PageNo, left_child_idx: u16, left_no: PageNo, right_no: PageNo) -> DbResult<()> {
        let left_guard = self.fetch(left_no)?;
        let right_guard = self.fetch(right_no)?;
        let left_header = NodeHeader::read(&left_guard.read());
        let right_header = NodeHeader::read(&right_guard.read());

        if left_header.is_leaf {
            let (mut keys, mut rids) = (Vec::new(), Vec::new());
            {
                let buf = right_guard.read();
                for i in 0..right_header.key_count {
                    keys.push(layout::key_at_ro(&buf, i, self.key_len, self.max_size).to_vec());
                    rids.push(layout::rid_at_ro(&buf, i, self.key_len, self.max_size));
                }
            }
            {
                let mut buf = left_guard.write();
                let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
                for (i, (k, r)) in keys.iter().zip(rids.iter()).enumerate() {
                    let pos = left_header.key_count + i as u16;
                    np.set_key_at(pos, k);
                    np.set_rid_at(pos, *r);
                }
                let mut h = np.header();
                h.key_count = left_header.key_count + right_header.key_count;
                h.next_leaf = right_header.next_leaf;
                np.set_header(h);
            }
            drop(left_guard);
            drop(right_guard);
            if right_header.next_leaf != INVALID_PAGE_NO {
                let mut ng = self.fetch(right_header.next_leaf)?;
                let mut nb = ng.write();
                let mut nh = NodeHeader::read(&nb);
                nh.prev_leaf = left_no;
                nh.write(&mut nb);
            } else {
                let mut fh = self.read_header()?;
                fh.last_leaf = left_no;
                self.write_header(&fh)?;
            }
        } else {
            let sep_key = {
                let pg = self.fetch(parent_no)?;
                layout::key_at_ro(&pg.read(), left_child_idx, self.key_len, self.max_size).to_vec()
            };
            let mut keys = vec![sep_key];
            let mut children = Vec::new();
            {
                let buf = right_guard.read();
                for i in 0..right_header.key_count {
                    keys.push(layout::key_at_ro(&buf, i, self.key_len, self.max_size).to_vec());
                }
                for i in 0..=right_header.key_count {
                    children.push(layout::child_at_ro(&buf, i, self.key_len, self.max_size));
                }
            }
            {
                let mut buf = left_guard.write();
                let mut np = NodePage::new(&mut buf, self.key_len, self.max_size);
                for (i, k) in keys.iter().enumerate() {
                    np.set_key_at(left_header.key_count + i as u16, k);
                }
                for (i, c) in children.iter().enumerate() {
                    np.set_child_at(left_header.key_count + 1 + i as u16, *c);
                }
                let mut h = np.header();
                h.key_count = left_header.key_count + keys.len() as u16;
                np.set_header(h);
            }
            drop(left_guard);
            drop(right_guard);
            for &c in &children {
                self.set_parent(c, left_no)?;
            }
        }

        let parent_header = NodeHeader::read(&self.fetch(parent_no)?.read());
        let mut pg = self.fetch(parent_no)?;
        let mut pbuf = pg.write();
        let mut pnp = NodePage::new(&mut pbuf, self.key_len, self.max_size);
        pnp.shift_keys_left(left_child_idx, parent_header.key_count);
        pnp.shift_children_left(left_child_idx + 1, parent_header.key_count + 1);
        let mut h = pnp.header();
        h.key_count -= 1;
        pnp.set_header(h);
        Ok(())
    }
}

/// Forward iterator over `[start, end)` leaf cursor positions.
pub struct RangeIter<'a> {
    index: &'a BTreeIndex,
    cursor: Option<Iid>,
    end: Iid,
}

impl Iterator for RangeIter<'_> {
    type Item = DbResult<(Vec<Value>, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = self.cursor?;
        if cursor == self.end {
            self.cursor = None;
            return None;
        }
        match self.index.read_at(cursor) {
            Ok(Some((key, rid, next))) => {
                self.cursor = Some(next);
                Some(Ok((key, rid)))
            }
            Ok(None) => {
                self.cursor = None;
                None
            }
            Err(e) => {
                self.cursor = None;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests;
