//! Buffer Pool Manager: a fixed set of frames, a page table, a free list,
//! and an LRU replacer restricted to unpinned frames. Sits directly on
//! top of [`storage::DiskManager`]; every higher layer (heap, B+-tree)
//! reads and writes pages exclusively through this pool, never through
//! the disk manager directly.
//!
//! # Example
//!
//! ```no_run
//! use buffer::BufferPoolManager;
//! use storage::DiskManager;
//! use std::sync::Arc;
//!
//! let disk = Arc::new(DiskManager::new("/tmp/mydb"));
//! disk.create_dir().unwrap();
//! disk.create_file("t1").unwrap();
//! let fd = disk.open_file("t1").unwrap();
//!
//! let pool = BufferPoolManager::new(64, disk);
//! let (page_id, mut guard) = pool.new_page(fd).unwrap().unwrap();
//! guard.write()[0] = 7;
//! ```

mod frame;
mod guard;
mod pool;
mod replacer;

pub use guard::PageGuard;
pub use pool::{BufferPoolManager, LogFlusher};
