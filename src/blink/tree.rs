//! Module `tree` implement the b-link tree index.

use log::debug;

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering::{Acquire, Relaxed, Release}},
    Arc,
};

use crate::{
    blink::{BlinkNode, LeafRd, LeafWr},
    node::Kind,
    util, Config, Error, Result, Wr,
};

// ancestor stacks hold at most this many levels, plenty for any
// realistic fan-out.
const MAX_DEPTH: usize = 7;

/// Index type for concurrent reads and writes over a b-link tree.
///
/// Clone the handle to share the index across threads. Writes run on the
/// caller's thread, latching one node at a time; reads are latch-free.
#[derive(Clone)]
pub struct Index {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    config: Config,
    root: AtomicU64,
    n_count: AtomicUsize,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // walk levels top down, freeing each sibling chain left to right.
        let mut word = self.root.load(Relaxed);
        while word != 0 {
            let top = BlinkNode::from_word(word);
            let below = if top.to_level() > 0 { top.as_ref().to_first() } else { 0 };

            let mut w = word;
            while w != 0 {
                let boxed = unsafe { Box::from_raw(w as *mut BlinkNode) };
                w = (*boxed).as_ref().to_next();
            }
            word = below;
        }
    }
}

impl Index {
    /// Create an empty index. The root starts life as a lone leaf holding
    /// only the infinity fence.
    pub fn new(name: &str, config: Config) -> Index {
        let config = config.into_clamped();

        let root = BlinkNode::new_word(Kind::Root, 0, config.node_size);
        BlinkNode::from_word(root).insert_infinity_key(config.max_key_size);

        let inner = Inner {
            name: name.to_string(),
            config,
            root: AtomicU64::new(root),
            n_count: AtomicUsize::new(0),
        };
        Index { inner: Arc::new(inner) }
    }

    /// Return name of this index instance.
    pub fn to_name(&self) -> String {
        self.inner.name.clone()
    }

    /// Return number of entries in this index.
    pub fn len(&self) -> usize {
        self.inner.n_count.load(Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of levels from root to leaf, inclusive.
    pub fn to_height(&self) -> usize {
        let root = BlinkNode::from_word(self.inner.root.load(Acquire));
        root.to_level() as usize + 1
    }

    /// Set `key` to `value`. An existing entry is left untouched and
    /// reported as [Wr::Duplicate].
    pub fn put(&self, key: &[u8], value: u64) -> Result<Wr> {
        util::validate_key(key, self.inner.config.max_key_size)?;

        let inner = &*self.inner;
        let mut stack: Vec<u64> = Vec::with_capacity(MAX_DEPTH);
        let (mut curr, mut curr_word) = inner.descend_to_leaf(key, &mut stack);

        let mut k = key.to_vec();
        let mut v = value;

        // leaf first, then one iteration per promoted separator.
        loop {
            match curr.insert(&k, v) {
                LeafWr::Duplicate => {
                    curr.latch.unlock();
                    return Ok(Wr::Duplicate);
                }
                LeafWr::Inserted => {
                    curr.latch.unlock();
                    inner.n_count.fetch_add(1, Relaxed);
                    return Ok(Wr::Inserted);
                }
                LeafWr::MoveRight(word) => {
                    let sibling = BlinkNode::from_word(word);
                    sibling.latch.lock();
                    curr.latch.unlock();
                    curr = sibling;
                    curr_word = word;
                }
                LeafWr::NoSpace => {
                    let (fence, new_word) = curr.split(inner.config.node_size);
                    let sibling = BlinkNode::from_word(new_word);

                    if k.as_slice() >= fence.as_slice() {
                        sibling.latch.lock();
                        match sibling.insert(&k, v) {
                            LeafWr::Inserted => (),
                            res => unreachable!("split sibling insert {:?}", res),
                        }
                        sibling.latch.unlock();
                    } else {
                        match curr.insert(&k, v) {
                            LeafWr::Inserted => (),
                            res => unreachable!("split insert {:?}", res),
                        }
                    }

                    // promote the separator.
                    k = fence;
                    v = new_word;

                    let (parent, parent_word) = match stack.pop() {
                        Some(word) => (BlinkNode::from_word(word), word),
                        None => match inner.grow_root(curr, curr_word, new_word, &k) {
                            None => {
                                curr.latch.unlock();
                                inner.n_count.fetch_add(1, Relaxed);
                                return Ok(Wr::Inserted);
                            }
                            // root moved under us, re-locate the parent.
                            Some(level) => inner.descend_to_level(&k, level),
                        },
                    };
                    parent.latch.lock();
                    curr.latch.unlock();
                    curr = parent;
                    curr_word = parent_word;
                }
            }
        }
    }

    /// Get the value set for `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<u64>> {
        util::validate_key(key, self.inner.config.max_key_size)?;

        let inner = &*self.inner;
        'root: loop {
            let mut curr = BlinkNode::from_word(inner.root.load(Acquire));
            let mut v = curr.latch.stable();

            while curr.to_level() > 0 {
                let child_word = curr.as_ref().descend(key);
                let v1 = curr.latch.load();
                if !v1.same_data(v) {
                    if v1.vsplit() != v.vsplit() {
                        continue 'root;
                    }
                    v = curr.latch.stable();
                    continue;
                }
                // a same-level child is a lateral hop along the sibling
                // chain; either way the version protocol re-arms.
                curr = BlinkNode::from_word(child_word);
                v = curr.latch.stable();
            }

            loop {
                let res = curr.search(key);
                let v1 = curr.latch.load();
                if !v1.same_data(v) {
                    // insert or split skew; a re-search either finds the
                    // key or chases the new fence right.
                    v = curr.latch.stable();
                    continue;
                }
                match res {
                    LeafRd::Found(value) => return Ok(Some(value)),
                    LeafRd::Missing => return Ok(None),
                    LeafRd::MoveRight(word) => {
                        curr = BlinkNode::from_word(word);
                        v = curr.latch.stable();
                    }
                }
            }
        }
    }

    /// Verify tree invariants: per-node ordering, sibling-chain ordering
    /// and fence discipline, on every level.
    pub fn validate(&self) -> Result<()> {
        let mut word = self.inner.root.load(Acquire);
        while word != 0 {
            let top = BlinkNode::from_word(word);
            let below = if top.to_level() > 0 { top.as_ref().to_first() } else { 0 };

            let mut w = word;
            while w != 0 {
                let bn = BlinkNode::from_word(w);
                let node = bn.as_ref();
                node.validate()?;

                let (fence, sibling) = bn.to_fence();
                for i in 0..node.len() - 1 {
                    let (key, _) = node.entry_at(i);
                    if key >= fence {
                        err_at!(Fatal, msg: "key above fence in node {}", node.to_id())?;
                    }
                }
                if sibling != 0 {
                    let (low, _) = BlinkNode::from_word(sibling).as_ref().entry_at(0);
                    if low < fence {
                        err_at!(Fatal, msg: "sibling low-key under fence {}", node.to_id())?;
                    }
                }
                w = sibling;
            }
            word = below;
        }
        Ok(())
    }
}

impl Inner {
    // optimistic descend, recording the ancestor path. Returns the leaf
    // with its write latch held.
    fn descend_to_leaf(&self, key: &[u8], stack: &mut Vec<u64>) -> (&BlinkNode, u64) {
        'retry: loop {
            stack.clear();
            let mut word = self.root.load(Acquire);
            let mut curr = BlinkNode::from_word(word);
            let mut v = curr.latch.stable();

            while curr.to_level() > 0 {
                let child_word = curr.as_ref().descend(key);
                let v1 = curr.latch.load();
                if !v1.same_data(v) {
                    if v1.vsplit() != v.vsplit() {
                        continue 'retry;
                    }
                    v = curr.latch.stable();
                    continue;
                }

                let child = BlinkNode::from_word(child_word);
                if child.to_level() != curr.to_level() {
                    stack.push(word);
                    assert!(stack.len() <= MAX_DEPTH, "tree too deep");
                }
                word = child_word;
                curr = child;
                v = curr.latch.stable();
            }

            curr.latch.lock();
            return (curr, word);
        }
    }

    // locate the node at `level` covering `key`, unlatched. Used when a
    // splitter's ancestor stack ran dry because the root moved.
    fn descend_to_level(&self, key: &[u8], level: u8) -> (&BlinkNode, u64) {
        'retry: loop {
            let mut word = self.root.load(Acquire);
            let mut curr = BlinkNode::from_word(word);
            let mut v = curr.latch.stable();
            assert!(curr.to_level() >= level, "root below target level");

            while curr.to_level() > level {
                let child_word = curr.as_ref().descend(key);
                let v1 = curr.latch.load();
                if !v1.same_data(v) {
                    if v1.vsplit() != v.vsplit() {
                        continue 'retry;
                    }
                    v = curr.latch.stable();
                    continue;
                }
                word = child_word;
                curr = BlinkNode::from_word(child_word);
                v = curr.latch.stable();
            }
            return (curr, word);
        }
    }

    // grow a new root over `curr` and its fresh sibling. Returns None on
    // success; if another splitter grew the root first, returns the level
    // where the caller shall re-locate its parent. Require: `curr` latch
    // held by the caller.
    fn grow_root(&self, curr: &BlinkNode, curr_word: u64, new_word: u64, fence: &[u8]) -> Option<u8> {
        if self.root.load(Acquire) != curr_word {
            return Some(curr.to_level() + 1);
        }

        // holding the old root's latch keeps every other splitter below,
        // the root pointer cannot move concurrently.
        let level = curr.to_level();
        let root_word = BlinkNode::new_word(Kind::Root, level + 1, self.config.node_size);
        let root = BlinkNode::from_word(root_word);
        root.insert_infinity_key(self.config.max_key_size);
        root.as_mut().set_first(curr_word);
        // the root is still private, write straight into the slab.
        match root.as_mut().insert(fence, new_word) {
            crate::node::NodeWr::Inserted => (),
            res => unreachable!("root separator insert {:?}", res),
        }

        let demoted = if level == 0 { Kind::Leaf } else { Kind::Branch };
        curr.as_mut().set_kind(demoted);
        BlinkNode::from_word(new_word).as_mut().set_kind(demoted);

        self.root.store(root_word, Release);
        debug!(target: "blink", "{:?} grew root to level {}", self.name, level + 1);
        None
    }
}

#[cfg(test)]
#[path = "tree_test.rs"]
mod tree_test;
