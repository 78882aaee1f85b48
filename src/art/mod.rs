//! Package implement an adaptive radix tree.
//!
//! Keys descend one byte at a time through nodes whose fan-out adapts to
//! their population: 4, 16, 48 or 256 children, each variant preserving
//! the byte-to-child map of the previous one. Runs of single-child bytes
//! collapse into an 8-byte inline prefix per node; longer runs chain
//! nodes.
//!
//! Leaves are tagged pointer-words, the low bit distinguishes a leaf
//! allocation from an interior node so that an empty slot can be claimed
//! with a bare CAS and no latch at all.
//!
//! Concurrency follows the version-word protocol with one addition: a
//! prefix change is neither an insert nor a split, so it gets its own
//! expand counter, and nodes replaced by a bigger variant are marked
//! dead-but-readable rather than freed. Readers treat any skew, expand
//! included, as transient and retry from the root.
//!
//! Reference: The Adaptive Radix Tree: ARTful Indexing for Main-Memory
//! Databases.

mod node;
mod tree;

pub use tree::Index;
