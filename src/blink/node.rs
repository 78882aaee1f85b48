//! Module `node` wrap the ordered slab node with a version latch and the
//! move-right discipline of a b-link node.

use std::cell::UnsafeCell;

use crate::{
    node::{Kind, Node, NodeWr},
    version::Latch,
};

/// Result code for a write landing on a b-link node.
#[derive(Debug)]
pub(crate) enum LeafWr {
    Inserted,
    Duplicate,
    /// Key is at or beyond this node's fence, caller must relock the
    /// right sibling.
    MoveRight(u64),
    /// Record does not fit, caller must split.
    NoSpace,
}

/// Result code for a read landing on a b-link node.
#[derive(Debug)]
pub(crate) enum LeafRd {
    Found(u64),
    Missing,
    MoveRight(u64),
}

/// A b-link node: version latch over an ordered slab node.
///
/// The slab sits in an UnsafeCell: mutation requires holding the latch,
/// optimistic readers may race it and must prove their reads against the
/// version word afterwards.
pub(crate) struct BlinkNode {
    pub(crate) latch: Latch,
    node: UnsafeCell<Node>,
}

unsafe impl Send for BlinkNode {}
unsafe impl Sync for BlinkNode {}

impl BlinkNode {
    pub(crate) fn new(kind: Kind, level: u8, size: usize) -> Box<BlinkNode> {
        Box::new(BlinkNode {
            latch: Latch::new(0),
            node: UnsafeCell::new(Node::new(kind, level, size)),
        })
    }

    /// Allocate and leak, returning the pointer-word used in records and
    /// sibling links.
    pub(crate) fn new_word(kind: Kind, level: u8, size: usize) -> u64 {
        Box::into_raw(Self::new(kind, level, size)) as u64
    }

    #[inline]
    pub(crate) fn from_word<'a>(word: u64) -> &'a BlinkNode {
        debug_assert!(word != 0);
        unsafe { &*(word as *const BlinkNode) }
    }

    #[inline]
    pub(crate) fn as_ref(&self) -> &Node {
        unsafe { &*self.node.get() }
    }

    /// Exclusive view of the slab. Require: this thread holds the latch,
    /// or the node is not yet published.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn as_mut(&self) -> &mut Node {
        unsafe { &mut *self.node.get() }
    }

    #[inline]
    pub(crate) fn to_level(&self) -> u8 {
        // level never changes after allocation, safe to read unlatched.
        self.as_ref().to_level()
    }

    /// The fence record: high key plus right-sibling pointer-word (0 on
    /// the right-most node).
    pub(crate) fn to_fence(&self) -> (Vec<u8>, u64) {
        let node = self.as_ref();
        debug_assert!(!node.is_empty());
        node.entry_at(node.len() - 1)
    }

    /// Seed a fresh right-most node with the infinity fence.
    pub(crate) fn insert_infinity_key(&self, max_key_size: usize) {
        let key = vec![0xff_u8; max_key_size];
        assert_eq!(self.as_mut().insert(&key, 0), NodeWr::Inserted);
    }

    /// Write a record, honoring the move-right rule. Require: latch held.
    pub(crate) fn insert(&self, key: &[u8], value: u64) -> LeafWr {
        let (fence, sibling) = self.to_fence();
        if sibling != 0 && key >= fence.as_slice() {
            return LeafWr::MoveRight(sibling);
        }

        self.latch.set_inserting();
        match self.as_mut().insert(key, value) {
            NodeWr::Inserted => LeafWr::Inserted,
            NodeWr::Duplicate => LeafWr::Duplicate,
            NodeWr::NoSpace => LeafWr::NoSpace,
        }
    }

    /// Latch-free point lookup, candidate result only: the caller owns
    /// version validation.
    pub(crate) fn search(&self, key: &[u8]) -> LeafRd {
        let (fence, sibling) = self.to_fence();
        if sibling != 0 && key >= fence.as_slice() {
            return LeafRd::MoveRight(sibling);
        }
        match self.as_ref().search(key) {
            Some(value) => LeafRd::Found(value),
            None => LeafRd::Missing,
        }
    }

    /// Split the upper half into a fresh sibling and splice it into the
    /// chain. Returns `(fence, sibling-word)`; the fence record pointing
    /// at the new sibling is re-inserted here. Require: latch held.
    pub(crate) fn split(&self, size: usize) -> (Vec<u8>, u64) {
        self.latch.set_splitting();

        let node = self.as_mut();
        let new_word = BlinkNode::new_word(node.to_kind(), node.to_level(), size);
        let sibling = BlinkNode::from_word(new_word);

        let fence = node.split_into(sibling.as_mut());
        sibling.as_mut().set_next(node.to_next());
        node.set_next(new_word);

        // the old fence record moved into the sibling; this node's new
        // fence is the separator, linking right.
        assert_eq!(node.insert(&fence, new_word), NodeWr::Inserted);

        (fence, new_word)
    }
}
