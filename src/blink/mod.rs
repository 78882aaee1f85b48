//! Package implement a concurrent B+ tree with right-sibling links.
//!
//! Writers latch one node at a time, never more than two, descending
//! without locks and claiming the leaf's write latch at the bottom.
//! Readers never latch, they validate version words and, when a split
//! moved their key sideways, chase the right-sibling link instead of
//! retraversing from the root.
//!
//! Every node carries a high-key fence as its last record; the fence's
//! value slot holds the right sibling. The right-most node of each level
//! fences with an "infinity" key, [MAX_KEY_SIZE][crate::MAX_KEY_SIZE]
//! bytes of 0xFF, so the move-right test is uniform.
//!
//! Reference: Efficient Locking for Concurrent Operations on B-Trees.

mod node;
mod tree;

pub use tree::Index;

pub(crate) use node::{BlinkNode, LeafRd, LeafWr};
