//! Package implement a Masstree, a trie of B+ trees keyed by 8-byte
//! key slices.
//!
//! Keys are consumed 8 bytes at a time, each chunk interpreted as a
//! big-endian word so that word comparison equals byte comparison. One
//! layer is a B+ tree of [border][node] (leaf) and interior nodes over the
//! key's current slice; keys that agree on a whole slice but differ later
//! push the conflict into a deeper layer, itself a full B+ tree over the
//! next slice.
//!
//! All nodes follow the version-word protocol of [crate::version]; border
//! records publish through an atomic permutation word, so a plain insert
//! is invisible until the permutation lands and needs no version bump at
//! all. Slot recycling and link replacement are the two places that need
//! the insert bit and the unstable marker respectively.
//!
//! Reference: Cache Craftiness for Fast Multicore Key-Value Storage.

mod node;
mod tree;

pub use tree::Index;
