//! Package implement a bulk-synchronous B+ tree, after the PALM design.
//!
//! Operations are packed into a sorted [Batch] and submitted to a pool of
//! workers wired in a chain. Every worker sees every batch; a batch runs
//! through four stages separated by point-to-point synchronization:
//!
//! 1. **Descend** — each worker walks its contiguous share of the batch
//!    from a fixed root snapshot down to the owning leaves, recording
//!    full ancestor paths.
//! 2. **Leaves** — workers trade boundary leaves with their neighbors;
//!    a leaf touched by two workers belongs to the left one. Each worker
//!    then applies its share serially, no latches anywhere, collecting a
//!    fence per split.
//! 3. **Branches** — fences propagate upward one level per round, with
//!    the same trade-and-own rule applied to parent nodes and two fence
//!    buffers alternated by level parity.
//! 4. **Root** — worker zero alone folds any remaining fences into a new
//!    root and publishes it.
//!
//! Since redistribution partitions nodes across workers and stages are
//! separated by synchronization, no node is ever touched by two workers
//! at once; the tree needs no per-node latches at all.
//!
//! Reference: Parallel Architecture-Friendly Latch-Free Modifications to
//! B+ Trees on Many-Core Processors.

mod batch;
mod tree;
mod worker;

pub use batch::{Batch, Op};
pub use tree::{Descend, Tree};
