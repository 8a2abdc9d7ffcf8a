//! # Near-Sorted B+-Tree Storage Engine
//!
//! A paged B+-tree storage engine tuned for key streams that arrive mostly
//! in ascending order with occasional out-of-order outliers.
//!
//! ## Architecture
//!
//! The engine is composed of modular layers, leaves first:
//!
//! - **Block Layer** (`block`): fixed-size page allocation with an
//!   LRU-cached disk backend and a direct-indexed memory backend
//! - **Node Layer** (`node`): typed view over a 4 KiB page, leaf or internal
//! - **Tree Layer** (`tree`): the B+-tree with pluggable fast-path policies
//!   that bypass root-to-leaf descent on hot inserts
//! - **Detectors** (`detector`): distance, stdev, and IQR outlier policies
//! - **Dual Coordinator** (`dual`): a sorted tree and an outlier tree
//!   composed behind one insert surface
//!
//! ## Usage
//!
//! ```rust,ignore
//! use nearsort_btree::{BPlusTree, FastPathPolicy, MemoryBlockManager, TreeOptions};
//! use std::sync::Arc;
//!
//! let manager = Arc::new(MemoryBlockManager::new(4096));
//! let tree = BPlusTree::new(manager, TreeOptions::default().policy(FastPathPolicy::Tail))?;
//!
//! tree.insert(42, 420)?;
//! assert!(tree.contains(42)?);
//! assert_eq!(tree.get(42)?, Some(420));
//! println!("{}", tree.stats());
//! ```

pub mod block;
pub mod config;
pub mod detector;
pub mod dual;
pub mod error;
pub mod node;
pub mod tree;
pub mod types;

pub use block::{BlockManager, DiskBlockManager, IoStats, MemoryBlockManager};
pub use config::{DetectorType, EngineConfig};
pub use detector::{DistanceDetector, LeafSummary, OutlierDetector, StdevDetector};
pub use dual::{DualStats, DualTree, StagingHeap};
pub use error::{EngineError, Result};
pub use tree::{BPlusTree, InsertOutcome, LeafCursor, TreeStats};
pub use types::{FastPathPolicy, Key, PageId, TreeOptions, Value, PAGE_SIZE};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tree(policy: FastPathPolicy) -> BPlusTree<MemoryBlockManager> {
        let manager = Arc::new(MemoryBlockManager::new(4096));
        BPlusTree::new(manager, TreeOptions::default().policy(policy)).unwrap()
    }

    #[test]
    fn scenario_point_membership() {
        let tree = tree(FastPathPolicy::None);
        tree.insert(5, 50).unwrap();
        tree.insert(3, 30).unwrap();
        tree.insert(7, 70).unwrap();
        assert!(tree.contains(3).unwrap());
        assert!(!tree.contains(4).unwrap());
    }

    #[test]
    fn scenario_range_after_bulk_load() {
        let tree = tree(FastPathPolicy::Tail);
        for k in 1..=1000u64 {
            tree.insert(k, k).unwrap();
        }
        let hits = tree.scan_range(100, 199).unwrap();
        assert_eq!(hits.len(), 100);
        assert!(hits.windows(2).all(|w| w[0].0 < w[1].0));
        tree.assert_invariants();
    }

    #[test]
    fn scenario_reinsert_is_an_update() {
        let tree = tree(FastPathPolicy::None);
        tree.insert(1, 1).unwrap();
        tree.insert(2, 2).unwrap();
        assert_eq!(tree.insert(1, 99).unwrap(), InsertOutcome::Updated);
        assert_eq!(tree.get(1).unwrap(), Some(99));
        assert_eq!(tree.size(), 2);
    }

    #[test]
    fn scenario_every_key_retrievable_after_mixed_workload() {
        let tree = tree(FastPathPolicy::Locality);
        for k in 0..3000u64 {
            tree.insert(k, k).unwrap();
        }
        for k in (0..3000u64).step_by(3) {
            tree.insert(k, k + 1_000_000).unwrap();
        }
        for k in 0..3000u64 {
            let expected = if k % 3 == 0 { k + 1_000_000 } else { k };
            assert_eq!(tree.get(k).unwrap(), Some(expected));
        }
        assert_eq!(tree.size(), 3000);
        tree.assert_invariants();
    }

    #[test]
    fn scenario_dual_outlier_lives_apart_and_tail_advances() {
        let config = EngineConfig {
            blocks_in_memory: 2048,
            outlier_detector_type: DetectorType::Distance,
            ..EngineConfig::default()
        };
        let dual = DualTree::in_memory(&config).unwrap();
        for k in 1..=1000u64 {
            dual.insert(k, k).unwrap();
        }
        dual.insert(1_000_000_000, 7).unwrap();
        dual.insert(1001, 1001).unwrap();
        dual.insert(1002, 1002).unwrap();

        assert!(dual.outlier().contains(1_000_000_000).unwrap());
        let (_, tail_max, _) = dual.sorted().tail_snapshot().unwrap().unwrap();
        assert_eq!(tail_max, 1002);
        assert_eq!(dual.get(1_000_000_000).unwrap(), Some(7));
    }

    #[test]
    fn scenario_concurrent_halves_meet_in_one_tree() {
        let manager = Arc::new(MemoryBlockManager::new(4096));
        let tree = Arc::new(BPlusTree::new(manager, TreeOptions::default()).unwrap());
        let n = 100_000u64;
        std::thread::scope(|scope| {
            let left = Arc::clone(&tree);
            scope.spawn(move || {
                for k in 1..=n / 2 {
                    left.insert(k, k).unwrap();
                }
            });
            let right = Arc::clone(&tree);
            scope.spawn(move || {
                for k in n / 2 + 1..=n {
                    right.insert(k, k).unwrap();
                }
            });
        });
        assert_eq!(tree.size(), n);
        tree.assert_invariants();
    }
}
