//! RAII pin guard: owns a buffer-pool pin for its lifetime and releases it
//! automatically on drop, so a mutation that returns early via `?` can
//! never leak a pin. This replaces the raw `Page*` the original engine
//! hands out, whose lifetime was tracked only by a manually-paired pin
//! count.

use crate::frame::FrameBytes;
use crate::pool::BufferPoolManager;
use common::PageId;
use std::cell::Cell;
use std::sync::{Arc, RwLockReadGuard, RwLockWriteGuard};

pub struct PageGuard {
    pool: Arc<BufferPoolManager>,
    page_id: PageId,
    bytes: FrameBytes,
    dirty: Cell<bool>,
}

impl PageGuard {
    pub(crate) fn new(pool: Arc<BufferPoolManager>, page_id: PageId, bytes: FrameBytes) -> Self {
        Self {
            pool,
            page_id,
            bytes,
            dirty: Cell::new(false),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Acquires the frame's read latch.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.bytes.read().unwrap()
    }

    /// Acquires the frame's write latch and marks the frame dirty; the
    /// dirty flag is propagated to the pool when this guard drops.
    pub fn write(&mut self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.dirty.set(true);
        self.bytes.write().unwrap()
    }

    /// Marks the page dirty without necessarily taking a write latch right
    /// now (used by callers that mutate through a separately-held latch,
    /// e.g. B+-tree crabbing).
    pub fn mark_dirty(&self) {
        self.dirty.set(true);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        // Best-effort: a failure here (page table already missing the
        // mapping) cannot be surfaced from `Drop`; it only happens if the
        // pool was torn down out from under an outstanding guard, which
        // would itself be a bug in the caller.
        let _ = self.pool.unpin_page(self.page_id, self.dirty.get());
    }
}
