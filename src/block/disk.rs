//! Disk-backed block manager with an LRU page cache.
//!
//! The backing file is a flat sequence of 4096-byte pages, page `id` at byte
//! offset `id * 4096`, no file header and no checksums. The file is
//! truncated at open; dirty pages reach it on eviction and on `flush`, so
//! content is only complete after a final flush.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::block::lru::LruList;
use crate::block::{BlockManager, BlockRead, BlockWrite, Frame, IoStats};
use crate::error::Result;
use crate::node::Node;
use crate::types::{PageAllocator, PageId, PAGE_SIZE};

struct CacheInner {
    frames: HashMap<u32, Arc<RwLock<Frame>>>,
    lru: LruList,
}

/// Block manager over a backing file with a fixed-capacity frame cache
pub struct DiskBlockManager {
    file: Mutex<File>,
    capacity: usize,
    ids: PageAllocator,
    inner: Mutex<CacheInner>,
    ctr_writes: AtomicU64,
    ctr_dirty_marks: AtomicU64,
}

impl DiskBlockManager {
    /// Open (and truncate) the backing file, caching up to `capacity` pages
    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            capacity,
            ids: PageAllocator::new(),
            inner: Mutex::new(CacheInner {
                frames: HashMap::with_capacity(capacity),
                lru: LruList::new(capacity),
            }),
            ctr_writes: AtomicU64::new(0),
            ctr_dirty_marks: AtomicU64::new(0),
        })
    }

    fn write_page(&self, node: &Node) -> Result<()> {
        let mut buf = [0u8; PAGE_SIZE];
        node.encode(&mut buf);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(node.id.file_offset()))?;
        file.write_all(&buf)?;
        self.ctr_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_page(&self, id: PageId) -> Result<Node> {
        let mut buf = [0u8; PAGE_SIZE];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(id.file_offset()))?;
        file.read_exact(&mut buf)?;
        drop(file);
        Node::decode(&buf)
    }

    /// Make room for one more frame. Pinned frames (any outstanding guard
    /// keeps a strong reference) are skipped; when everything is pinned the
    /// insert proceeds over capacity and eviction is retried on later misses.
    fn evict_for_insert(&self, inner: &mut CacheInner) -> Result<()> {
        if inner.frames.len() < self.capacity {
            return Ok(());
        }
        let mut skipped = Vec::new();
        let mut victim = None;
        while let Some(page) = inner.lru.pop_lru() {
            let pinned = inner
                .frames
                .get(&page)
                .map(|f| Arc::strong_count(f) > 1)
                .unwrap_or(false);
            if pinned {
                skipped.push(page);
            } else {
                victim = Some(page);
                break;
            }
        }
        // skipped frames stay cached; re-touching in pop order keeps the
        // oldest nearest the eviction end
        for page in skipped {
            inner.lru.touch(page);
        }
        if let Some(page) = victim {
            if let Some(frame) = inner.frames.remove(&page) {
                let guard = frame.read();
                if guard.dirty {
                    self.write_page(&guard.node)?;
                }
                tracing::trace!(page, dirty = guard.dirty, "evicted page");
            }
        }
        Ok(())
    }

    /// Look up or load the frame for `id`
    fn fetch(&self, id: PageId) -> Result<Arc<RwLock<Frame>>> {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get(&id.value()) {
            let frame = Arc::clone(frame);
            inner.lru.touch(id.value());
            return Ok(frame);
        }

        self.evict_for_insert(&mut inner)?;
        let node = self.read_page(id)?;
        let frame = Arc::new(RwLock::new(Frame::new(node, false)));
        inner.frames.insert(id.value(), Arc::clone(&frame));
        inner.lru.touch(id.value());
        Ok(frame)
    }
}

impl BlockManager for DiskBlockManager {
    fn allocate(&self) -> Result<PageId> {
        let id = self.ids.next_id();
        let mut inner = self.inner.lock();
        self.evict_for_insert(&mut inner)?;
        // fresh pages are born dirty so an eviction before first use still
        // leaves a decodable page on disk
        let frame = Arc::new(RwLock::new(Frame::new(Node::new_leaf(id), true)));
        inner.frames.insert(id.value(), frame);
        inner.lru.touch(id.value());
        Ok(id)
    }

    fn read_block(&self, id: PageId) -> Result<BlockRead> {
        Ok(self.fetch(id)?.read_arc())
    }

    fn write_block(&self, id: PageId) -> Result<BlockWrite> {
        let frame = self.fetch(id)?;
        let mut guard = frame.write_arc();
        guard.dirty = true;
        self.ctr_dirty_marks.fetch_add(1, Ordering::Relaxed);
        Ok(guard)
    }

    fn flush(&self) -> Result<()> {
        // snapshot the frame set first: waiting on a frame lock while
        // holding the cache mutex would deadlock against a pinned writer
        let frames: Vec<Arc<RwLock<Frame>>> = {
            let inner = self.inner.lock();
            inner.frames.values().cloned().collect()
        };
        for frame in frames {
            let mut guard = frame.write();
            if guard.dirty {
                self.write_page(&guard.node)?;
                guard.dirty = false;
            }
        }
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn io_stats(&self) -> IoStats {
        IoStats {
            writes: self.ctr_writes.load(Ordering::Relaxed),
            dirty_marks: self.ctr_dirty_marks.load(Ordering::Relaxed),
        }
    }
}
