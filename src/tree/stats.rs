//! Per-tree statistics counters and the comma-separated statistics line.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::block::IoStats;
use crate::types::FastPathPolicy;

/// Live counters updated by the insert path
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub size: AtomicU64,
    pub internal_nodes: AtomicU64,
    pub leaf_nodes: AtomicU64,
    pub fp_hits: AtomicU64,
    pub fp_splits: AtomicU64,
    pub iqr_moves: AtomicU64,
    pub soft_advances: AtomicU64,
    pub hard_resets: AtomicU64,
    pub redistributions: AtomicU64,
}

/// Point-in-time statistics snapshot.
///
/// Renders as one comma-separated line in stable field order:
/// `size, depth, writes, dirty_marks, internal, leaves, redistributions,
/// splits, iqr_moves, soft_advances, hard_resets, fastpath_hits`. Counters
/// the active policy does not maintain render as empty fields.
#[derive(Debug, Clone, Serialize)]
pub struct TreeStats {
    /// Number of live keys
    pub size: u64,
    /// Tree levels from the root down to the leaves
    pub depth: u32,
    /// Pages written by the block manager
    pub writes: u64,
    /// Dirty marks recorded by the block manager
    pub dirty_marks: u64,
    /// Internal nodes allocated
    pub internal_nodes: u64,
    /// Leaf nodes allocated
    pub leaf_nodes: u64,
    /// Redistributions into the previous sibling (Quit)
    pub redistributions: Option<u64>,
    /// Splits of the fast-path leaf (Locality / Quit)
    pub fp_splits: Option<u64>,
    /// Fast-path moves admitted by the IQR bound (Locality / Quit)
    pub iqr_moves: Option<u64>,
    /// Soft advances onto the successor leaf (Locality / Quit)
    pub soft_advances: Option<u64>,
    /// Hard resets after repeated fast-path misses (Locality / Quit)
    pub hard_resets: Option<u64>,
    /// Inserts served by the fast path without a split
    pub fp_hits: Option<u64>,
}

impl TreeStats {
    pub(crate) fn snapshot(
        counters: &Counters,
        policy: FastPathPolicy,
        internal_depth: u8,
        io: IoStats,
    ) -> Self {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let fast = policy != FastPathPolicy::None;
        let locality = matches!(policy, FastPathPolicy::Locality | FastPathPolicy::Quit);
        Self {
            size: load(&counters.size),
            depth: internal_depth as u32 + 1,
            writes: io.writes,
            dirty_marks: io.dirty_marks,
            internal_nodes: load(&counters.internal_nodes),
            leaf_nodes: load(&counters.leaf_nodes),
            redistributions: (policy == FastPathPolicy::Quit)
                .then(|| load(&counters.redistributions)),
            fp_splits: locality.then(|| load(&counters.fp_splits)),
            iqr_moves: locality.then(|| load(&counters.iqr_moves)),
            soft_advances: locality.then(|| load(&counters.soft_advances)),
            hard_resets: locality.then(|| load(&counters.hard_resets)),
            fp_hits: fast.then(|| load(&counters.fp_hits)),
        }
    }
}

fn field(f: &mut fmt::Formatter<'_>, value: Option<u64>) -> fmt::Result {
    match value {
        Some(v) => write!(f, ", {}", v),
        None => write!(f, ", "),
    }
}

impl fmt::Display for TreeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}, {}, {}",
            self.size, self.depth, self.writes, self.dirty_marks, self.internal_nodes,
            self.leaf_nodes
        )?;
        field(f, self.redistributions)?;
        field(f, self.fp_splits)?;
        field(f, self.iqr_moves)?;
        field(f, self.soft_advances)?;
        field(f, self.hard_resets)?;
        field(f, self.fp_hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters_with_size(n: u64) -> Counters {
        let counters = Counters::default();
        counters.size.store(n, Ordering::Relaxed);
        counters.fp_hits.store(7, Ordering::Relaxed);
        counters
    }

    #[test]
    fn test_simple_tree_renders_empty_fast_fields() {
        let stats = TreeStats::snapshot(
            &counters_with_size(3),
            FastPathPolicy::None,
            1,
            IoStats::default(),
        );
        assert_eq!(format!("{}", stats), "3, 2, 0, 0, 0, 0, , , , , , ");
    }

    #[test]
    fn test_tail_tree_renders_hits_only() {
        let stats = TreeStats::snapshot(
            &counters_with_size(3),
            FastPathPolicy::Tail,
            1,
            IoStats::default(),
        );
        assert_eq!(format!("{}", stats), "3, 2, 0, 0, 0, 0, , , , , , 7");
    }

    #[test]
    fn test_quit_tree_renders_all_fields_in_order() {
        let counters = counters_with_size(1);
        counters.redistributions.store(1, Ordering::Relaxed);
        counters.fp_splits.store(2, Ordering::Relaxed);
        counters.iqr_moves.store(3, Ordering::Relaxed);
        counters.soft_advances.store(4, Ordering::Relaxed);
        counters.hard_resets.store(5, Ordering::Relaxed);
        let stats = TreeStats::snapshot(
            &counters,
            FastPathPolicy::Quit,
            2,
            IoStats {
                writes: 5,
                dirty_marks: 9,
            },
        );
        // redistributions directly after the node counts, hits last
        assert_eq!(format!("{}", stats), "1, 3, 5, 9, 0, 0, 1, 2, 3, 4, 5, 7");
    }
}
