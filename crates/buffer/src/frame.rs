//! A buffer pool frame: the in-memory slot that holds one page's bytes
//! plus the bookkeeping (pin count, dirty flag) the pool needs to decide
//! when it may be reused.

use common::PageId;
use std::sync::{Arc, RwLock};
use storage::PAGE_SIZE;

/// The per-frame read/write latch protects the byte contents independent
/// of the pool's own metadata mutex, so that a held [`crate::PageGuard`]
/// can read or write page bytes without serializing on unrelated frames.
pub type FrameBytes = Arc<RwLock<Vec<u8>>>;

pub(crate) struct Frame {
    pub bytes: FrameBytes,
    pub page_id: Option<PageId>,
    pub pin_count: usize,
    pub is_dirty: bool,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            bytes: Arc::new(RwLock::new(vec![0u8; PAGE_SIZE])),
            page_id: None,
            pin_count: 0,
            is_dirty: false,
        }
    }

    pub fn reset(&mut self) {
        self.page_id = None;
        self.pin_count = 0;
        self.is_dirty = false;
        self.bytes.write().unwrap().fill(0);
    }
}
