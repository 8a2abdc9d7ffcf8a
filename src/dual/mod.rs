//! Dual-tree coordinator.
//!
//! Composes two trees of the same engine: a *sorted* tree tuned for
//! sequential append (wide split fraction, Quit fast path) and an *outlier*
//! tree for the keys the detector diverts (balanced split, last-insert fast
//! path). An optional bounded min-heap smooths tiny local disorder before
//! keys reach the router.

mod heap;

pub use heap::StagingHeap;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::{BlockManager, DiskBlockManager, MemoryBlockManager};
use crate::config::EngineConfig;
use crate::detector::OutlierDetector;
use crate::error::Result;
use crate::tree::{BPlusTree, TreeStats};
use crate::types::{FastPathPolicy, Key, TreeOptions, Value, LEAF_CAPACITY};

/// Two-tree coordinator routing keys by sortedness
pub struct DualTree<M: BlockManager> {
    sorted: BPlusTree<M>,
    outlier: BPlusTree<M>,
    detector: Option<Arc<Mutex<dyn OutlierDetector>>>,
    heap: Option<Mutex<StagingHeap>>,
    lazy_move: bool,
}

impl DualTree<MemoryBlockManager> {
    /// Build a memory-backed coordinator from a configuration
    pub fn in_memory(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let half = config.blocks_in_memory / 2;
        Self::build(
            Arc::new(MemoryBlockManager::new(half)),
            Arc::new(MemoryBlockManager::new(half)),
            config,
        )
    }
}

impl DualTree<DiskBlockManager> {
    /// Build a disk-backed coordinator over two backing files
    pub fn open(sorted_path: &Path, outlier_path: &Path, config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let half = config.blocks_in_memory / 2;
        Self::build(
            Arc::new(DiskBlockManager::open(sorted_path, half)?),
            Arc::new(DiskBlockManager::open(outlier_path, half)?),
            config,
        )
    }
}

impl<M: BlockManager> DualTree<M> {
    fn build(sorted_manager: Arc<M>, outlier_manager: Arc<M>, config: &EngineConfig) -> Result<Self> {
        let detector = config.build_detector();
        let sorted = BPlusTree::with_detector(
            sorted_manager,
            TreeOptions::new(config.sorted_tree_split_frac, FastPathPolicy::Quit),
            detector.clone(),
        )?;
        let outlier = BPlusTree::new(
            outlier_manager,
            TreeOptions::new(config.unsorted_tree_split_frac, FastPathPolicy::LastInsert),
        )?;
        Ok(Self {
            sorted,
            outlier,
            detector,
            heap: config.build_heap().map(Mutex::new),
            lazy_move: config.enable_lazy_move,
        })
    }

    /// The primary (near-sorted) tree
    pub fn sorted(&self) -> &BPlusTree<M> {
        &self.sorted
    }

    /// The secondary (outlier) tree
    pub fn outlier(&self) -> &BPlusTree<M> {
        &self.outlier
    }

    /// Keys held across both trees and the staging buffer
    pub fn size(&self) -> u64 {
        let buffered = self.heap.as_ref().map_or(0, |h| h.lock().len() as u64);
        self.sorted.size() + self.outlier.size() + buffered
    }

    /// Insert a pair, staging it in the heap buffer when one is configured
    pub fn insert(&self, key: Key, value: Value) -> Result<()> {
        let (key, value) = match &self.heap {
            Some(heap) => {
                let mut heap = heap.lock();
                if !heap.is_full() {
                    heap.push(key, value);
                    return Ok(());
                }
                match heap.peek_min() {
                    // displace the buffer minimum and route it instead
                    Some((min, _)) if key > min => {
                        let released = heap.pop_min().unwrap_or((key, value));
                        heap.push(key, value);
                        released
                    }
                    _ => (key, value),
                }
            }
            None => (key, value),
        };
        self.route(key, value)
    }

    /// Route a pair between the sorted and outlier trees
    fn route(&self, key: Key, value: Value) -> Result<()> {
        if self.sorted.size() == 0 {
            self.sorted.insert(key, value)?;
            if let Some(detector) = &self.detector {
                detector.lock().prime(key);
            }
            return Ok(());
        }

        let Some((tail_min, tail_max, tail_size)) = self.sorted.tail_snapshot()? else {
            self.sorted.insert(key, value)?;
            return Ok(());
        };

        if key < tail_min {
            // behind the tail leaf: the sorted tree stays append-ordered
            self.outlier.insert(key, value)?;
            return Ok(());
        }

        if key > tail_max {
            // the detector is consulted only for would-be tail appends
            if let Some(detector) = &self.detector {
                if detector.lock().is_outlier(key) {
                    self.outlier.insert(key, value)?;
                    return Ok(());
                }
            }
            self.sorted.insert(key, value)?;
            return Ok(());
        }

        if self.lazy_move && key < tail_max && tail_size == LEAF_CAPACITY {
            // keep the new key in place, push the old tail maximum out
            if let Some((evicted_key, evicted_value)) = self.sorted.swap_tail_max(key, value)? {
                self.outlier.insert(evicted_key, evicted_value)?;
            }
            return Ok(());
        }

        self.sorted.insert(key, value)?;
        Ok(())
    }

    /// Look up a key: staging buffer first, then the larger sub-tree
    pub fn get(&self, key: Key) -> Result<Option<Value>> {
        if let Some(heap) = &self.heap {
            if let Some(value) = heap.lock().get(key) {
                return Ok(Some(value));
            }
        }
        let (first, second) = if self.sorted.size() > self.outlier.size() {
            (&self.sorted, &self.outlier)
        } else {
            (&self.outlier, &self.sorted)
        };
        if let Some(value) = first.get(key)? {
            return Ok(Some(value));
        }
        second.get(key)
    }

    /// Check whether a key is present
    pub fn contains(&self, key: Key) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Write both trees' dirty pages back
    pub fn flush(&self) -> Result<()> {
        self.sorted.flush()?;
        self.outlier.flush()
    }

    /// Combined statistics snapshot
    pub fn stats(&self) -> DualStats {
        DualStats {
            sorted: self.sorted.stats(),
            outlier: self.outlier.stats(),
        }
    }
}

/// Statistics of both sub-trees
#[derive(Debug, Clone)]
pub struct DualStats {
    /// Primary tree statistics
    pub sorted: TreeStats,
    /// Outlier tree statistics
    pub outlier: TreeStats,
}

impl fmt::Display for DualStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DUAL, {}, {}", self.sorted, self.outlier)
    }
}
