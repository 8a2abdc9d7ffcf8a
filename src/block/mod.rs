//! Block manager: fixed-size page allocation, pinning, and write-back.
//!
//! Pages are owned exclusively by the block manager. Callers borrow them
//! through RAII guards that double as the per-node reader/writer latches:
//! a shared guard pins the frame and permits reads, an exclusive guard pins
//! it and permits mutation. A pinned frame is never evicted.

mod disk;
mod lru;
mod memory;

pub use disk::DiskBlockManager;
pub use memory::MemoryBlockManager;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use crate::error::Result;
use crate::node::Node;
use crate::types::PageId;

/// A cached page frame: the decoded node plus its dirty flag
pub struct Frame {
    /// Decoded node contents
    pub node: Node,
    pub(crate) dirty: bool,
}

impl Frame {
    pub(crate) fn new(node: Node, dirty: bool) -> Self {
        Self { node, dirty }
    }
}

impl std::ops::Deref for Frame {
    type Target = Node;

    fn deref(&self) -> &Self::Target {
        &self.node
    }
}

impl std::ops::DerefMut for Frame {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.node
    }
}

/// Shared (read) guard over a page frame; holding one pins the frame
pub type BlockRead = ArcRwLockReadGuard<RawRwLock, Frame>;

/// Exclusive (write) guard over a page frame; holding one pins the frame
pub type BlockWrite = ArcRwLockWriteGuard<RawRwLock, Frame>;

/// I/O counters reported in the statistics stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    /// Pages written to the backing file
    pub writes: u64,
    /// Exclusive block acquisitions (pending-modification marks)
    pub dirty_marks: u64,
}

/// Page allocation, access, and persistence.
///
/// `write_block` marks the page dirty as a side effect; `flush` writes every
/// dirty page back and clears the dirty set.
pub trait BlockManager: Send + Sync + 'static {
    /// Allocate the next page id and install an empty leaf frame for it
    fn allocate(&self) -> Result<PageId>;

    /// Fetch a page for reading; blocks while a writer holds it
    fn read_block(&self, id: PageId) -> Result<BlockRead>;

    /// Fetch a page for writing; blocks while any other holder remains
    fn write_block(&self, id: PageId) -> Result<BlockWrite>;

    /// Write every dirty page back and clear the dirty set
    fn flush(&self) -> Result<()>;

    /// Current I/O counters
    fn io_stats(&self) -> IoStats;
}
