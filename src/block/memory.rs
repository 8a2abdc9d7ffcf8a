//! Pure in-memory block manager.
//!
//! Degrades the page cache to direct indexing: every allocated page stays
//! resident, nothing is evicted, and there is no backing file. Allocation
//! past the configured capacity fails with `CapacityExceeded`.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::block::{BlockManager, BlockRead, BlockWrite, Frame, IoStats};
use crate::error::{EngineError, Result};
use crate::node::Node;
use crate::types::PageId;

/// Block manager backed entirely by memory
pub struct MemoryBlockManager {
    capacity: usize,
    frames: RwLock<Vec<Arc<RwLock<Frame>>>>,
}

impl MemoryBlockManager {
    /// Create a manager that can hold up to `capacity` pages
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            frames: RwLock::new(Vec::with_capacity(capacity)),
        }
    }

    fn frame(&self, id: PageId) -> Arc<RwLock<Frame>> {
        let frames = self.frames.read();
        Arc::clone(&frames[id.index()])
    }
}

impl BlockManager for MemoryBlockManager {
    fn allocate(&self) -> Result<PageId> {
        let mut frames = self.frames.write();
        if frames.len() >= self.capacity {
            return Err(EngineError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        // ids are dense, so the next id is the next slot
        let id = PageId::from_index(frames.len());
        frames.push(Arc::new(RwLock::new(Frame::new(Node::new_leaf(id), false))));
        Ok(id)
    }

    fn read_block(&self, id: PageId) -> Result<BlockRead> {
        Ok(self.frame(id).read_arc())
    }

    fn write_block(&self, id: PageId) -> Result<BlockWrite> {
        Ok(self.frame(id).write_arc())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn io_stats(&self) -> IoStats {
        IoStats::default()
    }
}
