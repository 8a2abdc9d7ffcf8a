//! B+-tree engine: core structure, fast-path policies, and statistics.

mod cursor;
pub(crate) mod fastpath;
mod stats;
mod tree;

pub use cursor::LeafCursor;
pub use stats::TreeStats;
pub use tree::{BPlusTree, InsertOutcome};
