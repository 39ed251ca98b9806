//! Raw byte layout of B+-tree pages.
//!
//! Page 0 of every index file is the index header (root/first-leaf/
//! last-leaf pointers, key schema, order). Every other page shares one
//! node header (parent, key count, leaf flag, prev/next leaf) followed by
//! a parallel key array and a child array. This module only manipulates
//! byte slices; [`crate::BTreeIndex`] is the layer that knows about
//! pinning and latching.

use common::{PageNo, RecordId, INVALID_PAGE_NO};
use storage::page::PAGE_HEADER_SIZE;
use storage::PAGE_SIZE;

/// Bytes used to store one leaf child (a [`RecordId`]): page_no(4) + slot(2).
pub const CHILD_SLOT_SIZE: usize = 6;
const NODE_HEADER_SIZE: usize = 4 + 2 + 1 + 1 + 4 + 4; // parent, key_count, is_leaf, pad, prev, next
const NODE_BODY_OFFSET: usize = PAGE_HEADER_SIZE + NODE_HEADER_SIZE;

/// Computes the maximum number of keys a node may hold for a given key
/// width, from the order formula `header + (key_len + sizeof(RID)) *
/// (order+1) <= PAGE_SIZE`. Two slots of slack are
/// reserved in the key/child arrays themselves (see
/// [`keys_capacity`]/[`children_capacity`]) so a node can transiently
/// hold one entry past `max_size` between an overflowing insert and the
/// split that follows it.
pub fn max_size(key_len: usize) -> usize {
    let available = PAGE_SIZE - NODE_BODY_OFFSET;
    let per_entry = key_len + CHILD_SLOT_SIZE;
    let raw = available / per_entry;
    raw.saturating_sub(2).max(3)
}

pub fn min_size(max_size: usize) -> usize {
    max_size.div_ceil(2)
}

fn keys_capacity(max_size: usize) -> usize {
    max_size + 1
}

fn children_capacity(max_size: usize) -> usize {
    max_size + 2
}

fn keys_offset_of(_key_len: usize, _max_size: usize) -> usize {
    NODE_BODY_OFFSET
}

fn children_offset_of(key_len: usize, max_size: usize) -> usize {
    NODE_BODY_OFFSET + keys_capacity(max_size) * key_len
}

/// Read-only key access for callers holding only a shared latch (a
/// [`buffer::PageGuard::read`] guard), used by pure-lookup traversals
/// (`GetValue`, `LowerBound`/`UpperBound`) that never mutate a page.
pub fn key_at_ro(buf: &[u8], idx: u16, key_len: usize, max_size: usize) -> &[u8] {
    let off = keys_offset_of(key_len, max_size) + idx as usize * key_len;
    &buf[off..off + key_len]
}

pub fn rid_at_ro(buf: &[u8], idx: u16, key_len: usize, max_size: usize) -> RecordId {
    let off = children_offset_of(key_len, max_size) + idx as usize * CHILD_SLOT_SIZE;
    let page_no = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
    let slot = u16::from_le_bytes(buf[off + 4..off + 6].try_into().unwrap());
    RecordId::new(page_no, slot)
}

pub fn child_at_ro(buf: &[u8], idx: u16, key_len: usize, max_size: usize) -> PageNo {
    let off = children_offset_of(key_len, max_size) + idx as usize * CHILD_SLOT_SIZE;
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeHeader {
    pub parent: PageNo,
    pub key_count: u16,
    pub is_leaf: bool,
    pub prev_leaf: PageNo,
    pub next_leaf: PageNo,
}

impl NodeHeader {
    pub fn empty_leaf() -> Self {
        Self {
            parent: INVALID_PAGE_NO,
            key_count: 0,
            is_leaf: true,
            prev_leaf: INVALID_PAGE_NO,
            next_leaf: INVALID_PAGE_NO,
        }
    }

    pub fn empty_interior() -> Self {
        Self {
            parent: INVALID_PAGE_NO,
            key_count: 0,
            is_leaf: false,
            prev_leaf: INVALID_PAGE_NO,
            next_leaf: INVALID_PAGE_NO,
        }
    }

    pub fn read(buf: &[u8]) -> Self {
        let b = &buf[PAGE_HEADER_SIZE..];
        Self {
            parent: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            key_count: u16::from_le_bytes(b[4..6].try_into().unwrap()),
            is_leaf: b[6] != 0,
            prev_leaf: u32::from_le_bytes(b[8..12].try_into().unwrap()),
            next_leaf: u32::from_le_bytes(b[12..16].try_into().unwrap()),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        let b = &mut buf[PAGE_HEADER_SIZE..];
        b[0..4].copy_from_slice(&self.parent.to_le_bytes());
        b[4..6].copy_from_slice(&self.key_count.to_le_bytes());
        b[6] = self.is_leaf as u8;
        b[7] = 0;
        b[8..12].copy_from_slice(&self.prev_leaf.to_le_bytes());
        b[12..16].copy_from_slice(&self.next_leaf.to_le_bytes());
    }
}

/// A view over one node page's key/child arrays. Borrows a pinned
/// frame's raw bytes.
pub struct NodePage<'a> {
    buf: &'a mut [u8],
    key_len: usize,
    max_size: usize,
}

impl<'a> NodePage<'a> {
    pub fn new(buf: &'a mut [u8], key_len: usize, max_size: usize) -> Self {
        Self {
            buf,
            key_len,
            max_size,
        }
    }

    pub fn header(&self) -> NodeHeader {
        NodeHeader::read(self.buf)
    }

    pub fn set_header(&mut self, header: NodeHeader) {
        header.write(self.buf);
    }

    fn keys_offset(&self) -> usize {
        NODE_BODY_OFFSET
    }

    fn children_offset(&self) -> usize {
        NODE_BODY_OFFSET + keys_capacity(self.max_size) * self.key_len
    }

    pub fn key_at(&self, idx: u16) -> &[u8] {
        let off = self.keys_offset() + idx as usize * self.key_len;
        &self.buf[off..off + self.key_len]
    }

    pub fn set_key_at(&mut self, idx: u16, key: &[u8]) {
        debug_assert_eq!(key.len(), self.key_len);
        let off = self.keys_offset() + idx as usize * self.key_len;
        self.buf[off..off + self.key_len].copy_from_slice(key);
    }

    /// Copies keys `[src_start, key_count)` one slot to the left,
    /// overwriting `src_start - 1`. Used by remove-at-index.
    pub fn shift_keys_left(&mut self, from: u16, key_count: u16) {
        for i in from..key_count {
            let bytes = self.key_at(i + 1).to_vec();
            self.set_key_at(i, &bytes);
        }
    }

    pub fn shift_keys_right(&mut self, from: u16, key_count: u16) {
        let mut i = key_count;
        while i > from {
            let bytes = self.key_at(i - 1).to_vec();
            self.set_key_at(i, &bytes);
            i -= 1;
        }
    }

    pub fn rid_at(&self, idx: u16) -> RecordId {
        let off = self.children_offset() + idx as usize * CHILD_SLOT_SIZE;
        let page_no = u32::from_le_bytes(self.buf[off..off + 4].try_into().unwrap());
        let slot = u16::from_le_bytes(self.buf[off + 4..off + 6].try_into().unwrap());
        RecordId::new(page_no, slot)
    }

    pub fn set_rid_at(&mut self, idx: u16, rid: RecordId) {
        let off = self.children_offset() + idx as usize * CHILD_SLOT_SIZE;
        self.buf[off..off + 4].copy_from_slice(&rid.page_no.to_le_bytes());
        self.buf[off + 4..off + 6].copy_from_slice(&rid.slot.to_le_bytes());
    }

    pub fn child_at(&self, idx: u16) -> PageNo {
        let off = self.children_offset() + idx as usize * CHILD_SLOT_SIZE;
        u32::from_le_bytes(self.buf[off..off + 4].try_into().unwrap())
    }

    pub fn set_child_at(&mut self, idx: u16, page_no: PageNo) {
        let off = self.children_offset() + idx as usize * CHILD_SLOT_SIZE;
        self.buf[off..off + 4].copy_from_slice(&page_no.to_le_bytes());
    }

    pub fn shift_rids_left(&mut self, from: u16, key_count: u16) {
        for i in from..key_count {
            let rid = self.rid_at(i + 1);
            self.set_rid_at(i, rid);
        }
    }

    pub fn shift_rids_right(&mut self, from: u16, key_count: u16) {
        let mut i = key_count;
        while i > from {
            let rid = self.rid_at(i - 1);
            self.set_rid_at(i, rid);
            i -= 1;
        }
    }

    /// Shifts children `[from, child_count)` one slot left (used when
    /// removing interior entry at `from - 1`).
    pub fn shift_children_left(&mut self, from: u16, child_count: u16) {
        for i in from..child_count {
            let c = self.child_at(i + 1);
            self.set_child_at(i, c);
        }
    }

    pub fn shift_children_right(&mut self, from: u16, child_count: u16) {
        let mut i = child_count;
        while i > from {
            let c = self.child_at(i - 1);
            self.set_child_at(i, c);
            i -= 1;
        }
    }
}

/// Index file header, stored in page 0. Holds the root pointer, the leaf
/// chain endpoints, and the total encoded key width (`key_len`), recorded
/// for on-disk self-description but not read back by `BTreeIndex::open`:
/// column types are never persisted here, so `open` (like `create`) takes
/// a `key_schema: Vec<SqlType>` from the caller's catalog lookup and
/// recomputes `key_len` from it directly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexFileHeader {
    pub root_page_no: PageNo,
    pub first_leaf: PageNo,
    pub last_leaf: PageNo,
    pub key_len: u16,
    pub is_empty: bool,
}

impl IndexFileHeader {
    pub const ENCODED_LEN: usize = 4 + 4 + 4 + 2 + 1;

    pub fn read(buf: &[u8]) -> Self {
        let b = &buf[PAGE_HEADER_SIZE..];
        Self {
            root_page_no: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            first_leaf: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            last_leaf: u32::from_le_bytes(b[8..12].try_into().unwrap()),
            key_len: u16::from_le_bytes(b[12..14].try_into().unwrap()),
            is_empty: b[14] != 0,
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        let b = &mut buf[PAGE_HEADER_SIZE..];
        b[0..4].copy_from_slice(&self.root_page_no.to_le_bytes());
        b[4..8].copy_from_slice(&self.first_leaf.to_le_bytes());
        b[8..12].copy_from_slice(&self.last_leaf.to_le_bytes());
        b[12..14].copy_from_slice(&self.key_len.to_le_bytes());
        b[14] = self.is_empty as u8;
    }
}
