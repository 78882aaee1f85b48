//! Module `version` implement the versioned-node protocol, useful for
//! non-blocking concurrency.
//!
//! Every concurrent node embeds a [Latch], a 32-bit version word updated
//! with atomic operations:
//!
//! ```text
//!    lock  insert  split  delete  root  border  unused  vsplit  vinsert
//!   |  1  |  1   |  1   |  1    |  1  |  1    |  2    |  8    |  16    |
//! ```
//!
//! A writer owns a node by CAS-ing the lock bit. Before touching the node's
//! structure it flips the insert or split bit, and on unlock the flipped
//! bit is folded into the matching counter. The counters are the version
//! proof used by readers:
//!
//! * A reader snapshots a [stable][Latch::stable] version, one without the
//!   insert/split bits set, does its lookup and re-reads the version.
//! * If nothing but the lock bit changed, the lookup is proven good.
//! * If `vsplit` moved, keys may have migrated to a sibling; the reader
//!   must restart from the tree root, or walk the sibling chain.
//! * If only `vinsert` moved, keys are where they were; re-reading the
//!   current node is enough.
//!
//! Both counters wrap around, a reader parked long enough to observe a
//! full wrap is indistinguishable from an unchanged version; with 16/8 bit
//! counters and short lookups this is not observed in practice.

use std::{
    fmt, result,
    sync::atomic::{
        AtomicU32,
        Ordering::{AcqRel, Acquire, Relaxed, Release},
    },
};

pub(crate) const LOCK_BIT: u32 = 1 << 31;
pub(crate) const INSERT_BIT: u32 = 1 << 30;
pub(crate) const SPLIT_BIT: u32 = 1 << 29;
pub(crate) const DELETE_BIT: u32 = 1 << 28;
pub(crate) const ROOT_BIT: u32 = 1 << 27;
pub(crate) const BORDER_BIT: u32 = 1 << 26;

const VSPLIT_MASK: u32 = 0x00ff_0000;
const VSPLIT_ONE: u32 = 0x0001_0000;
const VINSERT_MASK: u32 = 0x0000_ffff;

/// A point-in-time value of a node's version word.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Version(u32);

impl Version {
    #[inline]
    pub fn is_locked(&self) -> bool {
        (self.0 & LOCK_BIT) != 0
    }

    #[inline]
    pub fn is_inserting(&self) -> bool {
        (self.0 & INSERT_BIT) != 0
    }

    #[inline]
    pub fn is_splitting(&self) -> bool {
        (self.0 & SPLIT_BIT) != 0
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        (self.0 & DELETE_BIT) != 0
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        (self.0 & ROOT_BIT) != 0
    }

    #[inline]
    pub fn is_border(&self) -> bool {
        (self.0 & BORDER_BIT) != 0
    }

    #[inline]
    pub fn is_interior(&self) -> bool {
        !self.is_border()
    }

    /// Split counter, 8 bits, wrapping.
    #[inline]
    pub fn vsplit(&self) -> u32 {
        (self.0 & VSPLIT_MASK) >> 16
    }

    /// Insert counter, 16 bits, wrapping.
    #[inline]
    pub fn vinsert(&self) -> u32 {
        self.0 & VINSERT_MASK
    }

    /// Whether a version re-read as `self` still proves a lookup made at
    /// `v0`. A difference confined to the lock bit means the writer had
    /// not touched the data the reader saw.
    #[inline]
    pub fn same_data(&self, v0: Version) -> bool {
        let diff = self.0 ^ v0.0;
        diff == 0 || diff == LOCK_BIT
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            "Version<{:x} lk:{} in:{} sp:{} rt:{} bd:{} vs:{} vi:{}>",
            self.0,
            self.is_locked() as u32,
            self.is_inserting() as u32,
            self.is_splitting() as u32,
            self.is_root() as u32,
            self.is_border() as u32,
            self.vsplit(),
            self.vinsert(),
        )
    }
}

/// Latch implement the version word with latch-and-spin writer exclusion.
///
/// Writers spin on CAS of the lock bit. Only the lock owner may mutate the
/// word, all other threads observe it through [Latch::load] and
/// [Latch::stable].
pub struct Latch {
    word: AtomicU32,
    locks: AtomicU32,
    conflicts: AtomicU32,
}

impl Latch {
    /// Create a new latch; `bits` seed the flag bits, typically
    /// root/border markers.
    pub fn new(bits: u32) -> Latch {
        Latch {
            word: AtomicU32::new(bits),
            locks: AtomicU32::new(0),
            conflicts: AtomicU32::new(0),
        }
    }

    /// Latest version of the word.
    #[inline]
    pub fn load(&self) -> Version {
        Version(self.word.load(Acquire))
    }

    /// Spin until the version is stable, one without the insert/split
    /// bits set.
    pub fn stable(&self) -> Version {
        loop {
            let v = Version(self.word.load(Acquire));
            if !v.is_inserting() && !v.is_splitting() {
                break v;
            }
        }
    }

    /// Spin until the lock bit is claimed by this thread. Returns the
    /// locked version.
    pub fn lock(&self) -> Version {
        loop {
            let old = self.word.load(Acquire);
            if (old & LOCK_BIT) == 0 {
                if self
                    .word
                    .compare_exchange_weak(old, old | LOCK_BIT, AcqRel, Relaxed)
                    .is_ok()
                {
                    if cfg!(feature = "debug") {
                        self.locks.fetch_add(1, Relaxed);
                    }
                    break Version(old | LOCK_BIT);
                }
            }
            if cfg!(feature = "debug") {
                self.conflicts.fetch_add(1, Relaxed);
            }
        }
    }

    /// Release the lock bit, folding a set insert/split bit into its
    /// counter. Only the lock owner may call this.
    pub fn unlock(&self) {
        let mut v = self.word.load(Relaxed);
        assert!((v & LOCK_BIT) != 0, "unlock on unlocked latch");

        if (v & INSERT_BIT) != 0 {
            v = (v & !VINSERT_MASK) | (v.wrapping_add(1) & VINSERT_MASK);
            v &= !INSERT_BIT;
        }
        if (v & SPLIT_BIT) != 0 {
            v = (v & !VSPLIT_MASK) | (v.wrapping_add(VSPLIT_ONE) & VSPLIT_MASK);
            v &= !SPLIT_BIT;
        }

        self.word.store(v & !LOCK_BIT, Release);
    }

    /// Announce a key insert to concurrent readers. Only the lock owner
    /// may call this.
    pub fn set_inserting(&self) {
        let v = self.word.load(Relaxed);
        debug_assert!((v & LOCK_BIT) != 0);
        self.word.store(v | INSERT_BIT, Release);
    }

    /// Announce a structural split to concurrent readers. Only the lock
    /// owner may call this.
    pub fn set_splitting(&self) {
        let v = self.word.load(Relaxed);
        debug_assert!((v & LOCK_BIT) != 0);
        self.word.store(v | SPLIT_BIT, Release);
    }

    /// Mark this node as logically dead; descenders holding a reference
    /// must re-read their slot. Only the lock owner may call this, the
    /// bit is never cleared.
    pub fn set_deleted(&self) {
        let v = self.word.load(Relaxed);
        debug_assert!((v & LOCK_BIT) != 0);
        self.word.store(v | DELETE_BIT, Release);
    }

    /// Mark/unmark this node as the root of its (sub)tree. Only the lock
    /// owner, or a thread initializing a fresh node, may call this.
    pub fn set_root(&self, root: bool) {
        let v = self.word.load(Relaxed);
        let v = if root { v | ROOT_BIT } else { v & !ROOT_BIT };
        self.word.store(v, Release);
    }

    /// Overwrite the word wholesale. Meant for initializing a fresh node
    /// from its split sibling, before the node is published.
    pub fn set(&self, version: Version) {
        self.word.store(version.0, Release);
    }

    pub fn to_stats(&self) -> Stats {
        Stats {
            version: Version(self.word.load(Relaxed)),
            locks: self.locks.load(Relaxed) as usize,
            conflicts: self.conflicts.load(Relaxed) as usize,
        }
    }
}

/// Statistic type, to capture [Latch] metrics. Lock and conflict counts
/// are maintained only when the `debug` feature is on.
pub struct Stats {
    pub version: Version,
    pub locks: usize,
    pub conflicts: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            "{{ version = {:?}, locks = {}, conflicts = {} }}",
            self.version, self.locks, self.conflicts,
        )
    }
}

#[cfg(test)]
#[path = "version_test.rs"]
mod version_test;
