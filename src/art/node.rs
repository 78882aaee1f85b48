//! Module `node` implement the four radix node variants and the tagged
//! leaf word.
//!
//! The version latch doubles its split machinery for prefix expansion:
//! the split bit flags an in-flight prefix change and the vsplit counter
//! is the expand counter readers validate against. The delete bit marks
//! a node superseded by a bigger variant; any thread that observes it
//! re-reads the slot it came through.

use std::sync::atomic::{
    AtomicU64, AtomicU8,
    Ordering::{Acquire, Relaxed, Release},
};

use crate::version::Latch;

const LEAF_TAG: u64 = 1;

/// Leaf allocation: the full key and its value.
pub(crate) struct ArtLeaf {
    pub key: Vec<u8>,
    pub value: u64,
}

impl ArtLeaf {
    pub(crate) fn new_word(key: &[u8], value: u64) -> u64 {
        Box::into_raw(Box::new(ArtLeaf { key: key.to_vec(), value })) as u64 | LEAF_TAG
    }

    pub(crate) fn from_word<'a>(word: u64) -> &'a ArtLeaf {
        debug_assert!(is_leaf(word));
        unsafe { &*((word & !LEAF_TAG) as *const ArtLeaf) }
    }

    pub(crate) unsafe fn free_word(word: u64) {
        drop(Box::from_raw((word & !LEAF_TAG) as *mut ArtLeaf));
    }
}

#[inline]
pub(crate) fn is_leaf(word: u64) -> bool {
    (word & LEAF_TAG) != 0
}

enum Body {
    N4 { key: [AtomicU8; 4], child: [AtomicU64; 4] },
    N16 { key: [AtomicU8; 16], child: [AtomicU64; 16] },
    // dense byte map: index[byte] is child slot + 1, zero for absent.
    N48 { index: [AtomicU8; 256], child: [AtomicU64; 48] },
    N256 { child: [AtomicU64; 256] },
}

fn atomic_u8_array<const N: usize>() -> [AtomicU8; N] {
    [(); N].map(|_| AtomicU8::new(0))
}

fn atomic_u64_array<const N: usize>() -> [AtomicU64; N] {
    [(); N].map(|_| AtomicU64::new(0))
}

/// A radix node of any fan-out.
pub(crate) struct ArtNode {
    pub(crate) latch: Latch,
    count: AtomicU8,
    prefix_len: AtomicU8,
    prefix: [AtomicU8; 8],
    body: Body,
}

impl ArtNode {
    fn new(body: Body) -> u64 {
        let node = ArtNode {
            latch: Latch::new(0),
            count: AtomicU8::new(0),
            prefix_len: AtomicU8::new(0),
            prefix: atomic_u8_array(),
            body,
        };
        Box::into_raw(Box::new(node)) as u64
    }

    pub(crate) fn new_n4_word() -> u64 {
        ArtNode::new(Body::N4 { key: atomic_u8_array(), child: atomic_u64_array() })
    }

    #[inline]
    pub(crate) fn from_word<'a>(word: u64) -> &'a ArtNode {
        debug_assert!(word != 0 && !is_leaf(word));
        unsafe { &*(word as *const ArtNode) }
    }

    pub(crate) unsafe fn free_word(word: u64) {
        let node = Box::from_raw(word as *mut ArtNode);
        let free_child = |child: u64| {
            if child == 0 {
            } else if is_leaf(child) {
                ArtLeaf::free_word(child);
            } else {
                ArtNode::free_word(child);
            }
        };
        match &node.body {
            Body::N4 { child, .. } => {
                for c in child.iter().take(node.count.load(Relaxed) as usize) {
                    free_child(c.load(Relaxed));
                }
            }
            Body::N16 { child, .. } => {
                for c in child.iter().take(node.count.load(Relaxed) as usize) {
                    free_child(c.load(Relaxed));
                }
            }
            Body::N48 { index, child } => {
                for i in 0..256 {
                    let at = index[i].load(Relaxed);
                    if at != 0 {
                        free_child(child[at as usize - 1].load(Relaxed));
                    }
                }
            }
            Body::N256 { child } => {
                for c in child.iter() {
                    free_child(c.load(Relaxed));
                }
            }
        }
    }

    /// Latch the node; fails when the node was superseded while waiting.
    pub(crate) fn lock_live(&self) -> bool {
        self.latch.lock();
        if self.latch.load().is_deleted() {
            self.latch.unlock();
            false
        } else {
            true
        }
    }

    /// Match `key[off..]` against the inline prefix; returns the matched
    /// length and the prefix length that was seen. Racy; validate with
    /// the expand counter afterwards.
    pub(crate) fn prefix_compare(&self, key: &[u8], off: usize) -> (usize, usize) {
        let plen = self.prefix_len.load(Acquire) as usize;
        let mut i = 0;
        while i < plen && off + i < key.len() {
            if self.prefix[i].load(Relaxed) != key[off + i] {
                break;
            }
            i += 1;
        }
        (i, plen)
    }

    pub(crate) fn prefix_byte(&self, i: usize) -> u8 {
        self.prefix[i].load(Relaxed)
    }

    pub(crate) fn to_prefix_len(&self) -> usize {
        self.prefix_len.load(Acquire) as usize
    }

    /// Install a prefix on a private node.
    pub(crate) fn set_prefix(&self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= 8);
        for (i, b) in bytes.iter().enumerate() {
            self.prefix[i].store(*b, Relaxed);
        }
        self.prefix_len.store(bytes.len() as u8, Release);
    }

    /// Drop the leading `n + 1` prefix bytes, returning byte `n`, which
    /// becomes this node's position under the expanded branch. Require:
    /// latch held, split bit set.
    pub(crate) fn truncate_prefix(&self, n: usize) -> u8 {
        let plen = self.prefix_len.load(Relaxed) as usize;
        debug_assert!(n < plen);

        let branch = self.prefix[n].load(Relaxed);
        for (i, j) in (n + 1..plen).enumerate() {
            let b = self.prefix[j].load(Relaxed);
            self.prefix[i].store(b, Relaxed);
        }
        self.prefix_len.store((plen - n - 1) as u8, Release);
        branch
    }

    /// The slot mapped to `byte`, if any. On a 256-way node the slot
    /// always exists and may hold zero.
    pub(crate) fn find_child(&self, byte: u8) -> Option<&AtomicU64> {
        match &self.body {
            Body::N4 { key, child } => {
                let count = self.count.load(Acquire) as usize;
                for i in 0..count {
                    if key[i].load(Relaxed) == byte {
                        return Some(&child[i]);
                    }
                }
                None
            }
            Body::N16 { key, child } => {
                let count = self.count.load(Acquire) as usize;
                for i in 0..count {
                    if key[i].load(Relaxed) == byte {
                        return Some(&child[i]);
                    }
                }
                None
            }
            Body::N48 { index, child } => {
                match index[byte as usize].load(Acquire) {
                    0 => None,
                    at => Some(&child[at as usize - 1]),
                }
            }
            Body::N256 { child } => Some(&child[byte as usize]),
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        let count = self.count.load(Relaxed) as usize;
        match &self.body {
            Body::N4 { .. } => count == 4,
            Body::N16 { .. } => count == 16,
            Body::N48 { .. } => count == 48,
            Body::N256 { .. } => false,
        }
    }

    /// Map `byte` to `child_word`. Require: latch held (or node private),
    /// `byte` absent, not full.
    pub(crate) fn add_child(&self, byte: u8, child_word: u64) {
        let count = self.count.load(Relaxed) as usize;
        match &self.body {
            Body::N4 { key, child } => {
                debug_assert!(count < 4);
                key[count].store(byte, Relaxed);
                child[count].store(child_word, Relaxed);
            }
            Body::N16 { key, child } => {
                debug_assert!(count < 16);
                key[count].store(byte, Relaxed);
                child[count].store(child_word, Relaxed);
            }
            Body::N48 { index, child } => {
                debug_assert!(count < 48 && index[byte as usize].load(Relaxed) == 0);
                child[count].store(child_word, Relaxed);
                index[byte as usize].store(count as u8 + 1, Release);
            }
            Body::N256 { child } => {
                debug_assert!(child[byte as usize].load(Relaxed) == 0);
                child[byte as usize].store(child_word, Release);
                return; // 256-way fan-out does not track population
            }
        }
        // publish the entry; scanners load the count with acquire.
        self.count.store(count as u8 + 1, Release);
    }

    /// Copy this node into the next bigger variant. Returns the fresh
    /// node's word; this node is left intact and must be marked dead by
    /// the caller once the replacement is published. Require: latch held.
    pub(crate) fn grow(&self) -> u64 {
        let count = self.count.load(Relaxed) as usize;

        let new_word = match &self.body {
            Body::N4 { key, child } => {
                debug_assert!(count == 4);
                let new = Body::N16 { key: atomic_u8_array(), child: atomic_u64_array() };
                let word = ArtNode::new(new);
                let node = ArtNode::from_word(word);
                for i in 0..count {
                    node.add_child(key[i].load(Relaxed), child[i].load(Relaxed));
                }
                word
            }
            Body::N16 { key, child } => {
                debug_assert!(count == 16);
                let word = ArtNode::new(Body::N48 {
                    index: atomic_u8_array(),
                    child: atomic_u64_array(),
                });
                let node = ArtNode::from_word(word);
                for i in 0..count {
                    node.add_child(key[i].load(Relaxed), child[i].load(Relaxed));
                }
                word
            }
            Body::N48 { index, child } => {
                debug_assert!(count == 48);
                let word = ArtNode::new(Body::N256 { child: atomic_u64_array() });
                let node = ArtNode::from_word(word);
                for byte in 0..256 {
                    let at = index[byte].load(Relaxed);
                    if at != 0 {
                        node.add_child(byte as u8, child[at as usize - 1].load(Relaxed));
                    }
                }
                word
            }
            Body::N256 { .. } => unreachable!("256-way node cannot grow"),
        };

        let node = ArtNode::from_word(new_word);
        let plen = self.prefix_len.load(Relaxed) as usize;
        for i in 0..plen {
            node.prefix[i].store(self.prefix[i].load(Relaxed), Relaxed);
        }
        node.prefix_len.store(plen as u8, Relaxed);

        new_word
    }

    /// Free a node that never got published.
    pub(crate) unsafe fn discard_private(word: u64) {
        drop(Box::from_raw(word as *mut ArtNode));
    }

    /// Visit every resident (byte, child) pair. Not safe against
    /// concurrent writers; meant for drop and validation walks.
    pub(crate) fn each_child<F: FnMut(u8, u64)>(&self, mut f: F) {
        match &self.body {
            Body::N4 { key, child } => {
                for i in 0..self.count.load(Relaxed) as usize {
                    f(key[i].load(Relaxed), child[i].load(Relaxed));
                }
            }
            Body::N16 { key, child } => {
                for i in 0..self.count.load(Relaxed) as usize {
                    f(key[i].load(Relaxed), child[i].load(Relaxed));
                }
            }
            Body::N48 { index, child } => {
                for byte in 0..256 {
                    let at = index[byte].load(Relaxed);
                    if at != 0 {
                        f(byte as u8, child[at as usize - 1].load(Relaxed));
                    }
                }
            }
            Body::N256 { child } => {
                for byte in 0..256 {
                    let word = child[byte].load(Relaxed);
                    if word != 0 {
                        f(byte as u8, word);
                    }
                }
            }
        }
    }
}
