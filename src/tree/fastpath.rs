//! Fast-path state: the cached hot-leaf triple and its reset counter.

use crate::types::{FastPathPolicy, Key, PageId, LEAF_CAPACITY};

/// Consecutive fast-path misses tolerated before a hard reset promotes the
/// descended leaf (`⌊√leaf_capacity⌋`)
pub(crate) const RESET_THRESHOLD: u8 = {
    let mut r = 1u32;
    while (r + 1) * (r + 1) <= LEAF_CAPACITY as u32 {
        r += 1;
    }
    r as u8
};

/// Miss counter driving hard resets (Locality / Quit)
#[derive(Debug)]
pub(crate) struct ResetCounter {
    fails: u8,
    threshold: u8,
}

impl ResetCounter {
    pub fn new(threshold: u8) -> Self {
        Self {
            fails: 0,
            threshold,
        }
    }

    /// A fast-path hit clears the streak
    pub fn success(&mut self) {
        self.fails = 0;
    }

    /// A miss; returns true once the streak reaches the threshold
    pub fn failure(&mut self) -> bool {
        self.fails += 1;
        self.fails >= self.threshold
    }

    pub fn reset(&mut self) {
        self.fails = 0;
    }
}

/// The cached fast-path triple plus the previous-sibling statistics the
/// IQR bound feeds on.
///
/// The range test keeps open bounds at the chain ends: at the head any key
/// below `fp_min` still belongs to the hot leaf, at the tail any key at or
/// above `fp_max` does.
#[derive(Debug)]
pub(crate) struct FastPath {
    pub policy: FastPathPolicy,
    pub fp_id: PageId,
    pub fp_min: Key,
    pub fp_max: Key,
    /// Size of the hot leaf (Locality / Quit)
    pub fp_size: usize,
    /// Previous sibling of the hot leaf; INVALID when unknown
    pub prev_id: PageId,
    pub prev_min: Key,
    pub prev_size: usize,
    pub reset: ResetCounter,
}

impl FastPath {
    pub fn new(policy: FastPathPolicy, head_id: PageId) -> Self {
        Self {
            policy,
            fp_id: head_id,
            fp_min: 0,
            fp_max: 0,
            fp_size: 0,
            prev_id: PageId::INVALID,
            prev_min: 0,
            prev_size: 0,
            reset: ResetCounter::new(RESET_THRESHOLD),
        }
    }

    /// Does `key` belong to the hot leaf?
    pub fn hit(&self, key: Key, head_id: PageId, tail_id: PageId) -> bool {
        (self.fp_id == head_id || self.fp_min <= key)
            && (self.fp_id == tail_id || key < self.fp_max)
    }

    /// Whether this policy maintains previous-sibling statistics
    pub fn tracks_prev(&self) -> bool {
        matches!(
            self.policy,
            FastPathPolicy::Locality | FastPathPolicy::Quit
        )
    }
}
