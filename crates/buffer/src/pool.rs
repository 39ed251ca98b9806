//! The Buffer Pool: a fixed set of frames, a page table, a free list, and
//! an LRU replacer restricted to unpinned frames.

use crate::frame::Frame;
use crate::guard::PageGuard;
use crate::replacer::LruReplacer;
use common::{DbError, DbResult, Fd, Lsn, PageId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use storage::{page, DiskManager, PAGE_SIZE};

/// Implemented by the log manager so the buffer pool can enforce
/// write-ahead logging's central rule without depending on the `wal`
/// crate directly: a dirty page's log record must reach disk before the
/// page itself does.
pub trait LogFlusher: Send + Sync {
    fn flush_up_to(&self, lsn: Lsn) -> DbResult<()>;
}

struct Inner {
    frames: Vec<Frame>,
    page_table: HashMap<PageId, usize>,
    free_list: VecDeque<usize>,
    replacer: LruReplacer,
}

pub struct BufferPoolManager {
    disk: Arc<DiskManager>,
    inner: Mutex<Inner>,
    log_flusher: Mutex<Option<Arc<dyn LogFlusher>>>,
}

impl BufferPoolManager {
    pub fn new(num_frames: usize, disk: Arc<DiskManager>) -> Arc<Self> {
        let frames = (0..num_frames).map(|_| Frame::new()).collect();
        let free_list = (0..num_frames).collect();
        Arc::new(Self {
            disk,
            inner: Mutex::new(Inner {
                frames,
                page_table: HashMap::new(),
                free_list,
                replacer: LruReplacer::new(),
            }),
            log_flusher: Mutex::new(None),
        })
    }

    pub fn set_log_flusher(&self, flusher: Arc<dyn LogFlusher>) {
        *self.log_flusher.lock().unwrap() = Some(flusher);
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }

    fn evict_victim(&self, inner: &mut Inner) -> DbResult<Option<usize>> {
        let frame_id = match inner.free_list.pop_front() {
            Some(id) => id,
            None => match inner.replacer.evict() {
                Some(id) => id,
                None => return Ok(None),
            },
        };

        let frame = &mut inner.frames[frame_id];
        if frame.is_dirty {
            if let Some(old_page_id) = frame.page_id {
                let lsn = page::read_lsn(&frame.bytes.read().unwrap());
                if let Some(flusher) = self.log_flusher.lock().unwrap().as_ref() {
                    flusher.flush_up_to(lsn)?;
                }
                self.disk
                    .write_page(old_page_id.fd, old_page_id.page_no, &frame.bytes.read().unwrap())?;
                log::debug!("buffer pool: flushed dirty victim {old_page_id:?} before reuse");
            }
        }
        if let Some(old_page_id) = frame.page_id.take() {
            inner.page_table.remove(&old_page_id);
        }
        inner.replacer.remove(frame_id);
        Ok(Some(frame_id))
    }

    /// Fetch(page_id): pins and returns the frame holding `page_id`,
    /// reading it from disk if it is not already resident. Returns `Ok(None)`
    /// if every frame is pinned and no victim can be found.
    pub fn fetch_page(self: &Arc<Self>, page_id: PageId) -> DbResult<Option<PageGuard>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            inner.frames[frame_id].pin_count += 1;
            inner.replacer.set_evictable(frame_id, false);
            let bytes = inner.frames[frame_id].bytes.clone();
            drop(inner);
            return Ok(Some(PageGuard::new(self.clone(), page_id, bytes)));
        }

        let Some(frame_id) = self.evict_victim(&mut inner)? else {
            return Ok(None);
        };
        let bytes = inner.frames[frame_id].bytes.clone();
        self.disk
            .read_page(page_id.fd, page_id.page_no, &mut bytes.write().unwrap())?;
        inner.frames[frame_id].page_id = Some(page_id);
        inner.frames[frame_id].pin_count = 1;
        inner.frames[frame_id].is_dirty = false;
        inner.page_table.insert(page_id, frame_id);
        drop(inner);
        Ok(Some(PageGuard::new(self.clone(), page_id, bytes)))
    }

    /// NewPage: allocates a fresh page number on `fd` and returns a pinned,
    /// zeroed frame for it. Returns `Ok(None)` if no victim is available.
    pub fn new_page(self: &Arc<Self>, fd: Fd) -> DbResult<Option<(PageId, PageGuard)>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(frame_id) = self.evict_victim(&mut inner)? else {
            return Ok(None);
        };
        let page_no = self.disk.allocate_page(fd)?;
        let page_id = PageId::new(fd, page_no);

        let frame = &mut inner.frames[frame_id];
        frame.bytes.write().unwrap().fill(0);
        frame.page_id = Some(page_id);
        frame.pin_count = 1;
        frame.is_dirty = false;
        let bytes = frame.bytes.clone();
        inner.page_table.insert(page_id, frame_id);
        drop(inner);
        Ok(Some((page_id, PageGuard::new(self.clone(), page_id, bytes))))
    }

    /// Unpin(page_id, is_dirty): called automatically when a [`PageGuard`]
    /// drops. Returns `Ok(false)` if the pin count was already zero.
    pub(crate) fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> DbResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return Ok(false);
        };
        let frame = &mut inner.frames[frame_id];
        if frame.pin_count == 0 {
            return Ok(false);
        }
        frame.pin_count -= 1;
        frame.is_dirty |= is_dirty;
        if frame.pin_count == 0 {
            inner.replacer.set_evictable(frame_id, true);
        }
        Ok(true)
    }

    pub fn flush_page(&self, page_id: PageId) -> DbResult<()> {
        let inner = self.inner.lock().unwrap();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return Ok(());
        };
        let frame = &inner.frames[frame_id];
        if frame.is_dirty {
            self.disk
                .write_page(page_id.fd, page_id.page_no, &frame.bytes.read().unwrap())?;
        }
        drop(inner);
        self.inner.lock().unwrap().frames[frame_id].is_dirty = false;
        Ok(())
    }

    pub fn flush_all(&self, fd: Fd) -> DbResult<()> {
        let page_ids: Vec<PageId> = {
            let inner = self.inner.lock().unwrap();
            inner
                .page_table
                .keys()
                .filter(|p| p.fd == fd)
                .copied()
                .collect()
        };
        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    pub fn flush_all_dirty(&self) -> DbResult<()> {
        let page_ids: Vec<PageId> = {
            let inner = self.inner.lock().unwrap();
            inner
                .page_table
                .iter()
                .filter(|(_, &fid)| inner.frames[fid].is_dirty)
                .map(|(p, _)| *p)
                .collect()
        };
        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Delete(page_id): refuses while pinned. Otherwise flushes if dirty
    /// and returns the frame to the free list.
    pub fn delete_page(&self, page_id: PageId) -> DbResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return Ok(true);
        };
        if inner.frames[frame_id].pin_count > 0 {
            return Ok(false);
        }
        if inner.frames[frame_id].is_dirty {
            self.disk
                .write_page(page_id.fd, page_id.page_no, &inner.frames[frame_id].bytes.read().unwrap())?;
        }
        inner.page_table.remove(&page_id);
        inner.replacer.remove(frame_id);
        inner.frames[frame_id].reset();
        inner.free_list.push_back(frame_id);
        Ok(true)
    }

    /// RemoveAllPages(fd): drops every frame belonging to `fd` without
    /// flushing, so that closing and reusing an fd never exposes a
    /// previous table's stale page contents.
    pub fn remove_all_pages(&self, fd: Fd) {
        let mut inner = self.inner.lock().unwrap();
        let stale: Vec<PageId> = inner
            .page_table
            .keys()
            .filter(|p| p.fd == fd)
            .copied()
            .collect();
        for page_id in stale {
            if let Some(frame_id) = inner.page_table.remove(&page_id) {
                inner.replacer.remove(frame_id);
                inner.frames[frame_id].reset();
                inner.free_list.push_back(frame_id);
            }
        }
    }

    /// Number of frames currently pinned; used by tests asserting
    /// quiescence (every frame at pin-count zero).
    pub fn pinned_frame_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.frames.iter().filter(|f| f.pin_count > 0).count()
    }
}

const _: () = assert!(PAGE_SIZE > 0);

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup(num_frames: usize) -> (Arc<BufferPoolManager>, Fd) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path()));
        disk.create_dir().unwrap();
        disk.create_file("t1").unwrap();
        let fd = disk.open_file("t1").unwrap();
        std::mem::forget(dir); // keep the tempdir alive for the test's duration
        (BufferPoolManager::new(num_frames, disk), fd)
    }

    #[test]
    fn new_page_then_fetch_returns_same_bytes() {
        let (pool, fd) = setup(4);
        let (page_id, mut guard) = pool.new_page(fd).unwrap().unwrap();
        guard.write()[0] = 42;
        drop(guard);

        let guard2 = pool.fetch_page(page_id).unwrap().unwrap();
        assert_eq!(guard2.read()[0], 42);
    }

    #[test]
    fn fetch_fails_when_every_frame_is_pinned() {
        let (pool, fd) = setup(2);
        let (p1, g1) = pool.new_page(fd).unwrap().unwrap();
        let (_p2, g2) = pool.new_page(fd).unwrap().unwrap();
        // both frames pinned; a third page cannot be fetched
        let result = pool.new_page(fd).unwrap();
        assert!(result.is_none());
        drop(g1);
        drop(g2);

        // after unpinning, eviction succeeds
        let guard = pool.fetch_page(p1).unwrap();
        assert!(guard.is_some());
    }

    #[test]
    fn delete_refuses_while_pinned() {
        let (pool, fd) = setup(2);
        let (page_id, guard) = pool.new_page(fd).unwrap().unwrap();
        assert_eq!(pool.delete_page(page_id).unwrap(), false);
        drop(guard);
        assert_eq!(pool.delete_page(page_id).unwrap(), true);
    }

    #[test]
    fn pin_count_reaches_zero_after_drop() {
        let (pool, fd) = setup(2);
        let (_page_id, guard) = pool.new_page(fd).unwrap().unwrap();
        assert_eq!(pool.pinned_frame_count(), 1);
        drop(guard);
        assert_eq!(pool.pinned_frame_count(), 0);
    }
}
