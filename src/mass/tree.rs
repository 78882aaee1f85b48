//! Module `tree` implement the mass index over layered B+ trees.

use log::debug;

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering::{Acquire, Relaxed, Release}},
    Arc,
};

use crate::{
    mass::node::{advance_offset, keyslice_at, BorderWr, MassNode, MassRd, Suffix},
    util,
    version::Version,
    Config, Result, Wr,
};

/// Index type for concurrent reads and writes over a trie of B+ trees.
///
/// Clone the handle to share the index across threads. Writes run on the
/// caller's thread latching one or two nodes at a time; reads are
/// latch-free.
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
        unsafe { MassNode::free_word(self.root.load(Relaxed)) }
    }
}

impl Index {
    /// Create an empty index; the first layer's root starts as a lone
    /// border node.
    pub fn new(name: &str, config: Config) -> Index {
        let inner = Inner {
            name: name.to_string(),
            config: config.into_clamped(),
            root: AtomicU64::new(MassNode::new_border_word(true)),
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

    /// Set `key` to `value`. An existing entry is left untouched and
    /// reported as [Wr::Duplicate].
    pub fn put(&self, key: &[u8], value: u64) -> Result<Wr> {
        util::validate_key(key, self.inner.config.max_key_size)?;

        let inner = &*self.inner;
        let mut off = 0_usize;
        let mut root_word = inner.root.load(Acquire);

        // one iteration per layer.
        loop {
            let slice = keyslice_at(key, off);
            let (found, v) = inner.find_border(root_word, slice);
            found.latch.lock();

            // the border may have split between snapshot and latch; walk
            // right while the sibling's low slice still covers ours.
            let mut n = found;
            if !n.latch.load().same_data(v) {
                loop {
                    let next_word = n.next_sibling();
                    if next_word == 0 {
                        break;
                    }
                    let next = MassNode::from_word(next_word);
                    next.latch.lock();
                    if next.len() > 0 && next.low_slice() <= slice {
                        n.latch.unlock();
                        n = next;
                    } else {
                        next.latch.unlock();
                        break;
                    }
                }
            }

            match n.border_insert(key, off, value) {
                BorderWr::Inserted => {
                    n.latch.unlock();
                    inner.n_count.fetch_add(1, Relaxed);
                    return Ok(Wr::Inserted);
                }
                BorderWr::Duplicate => {
                    n.latch.unlock();
                    return Ok(Wr::Duplicate);
                }
                BorderWr::GoDeeper(word) => {
                    n.latch.unlock();
                    root_word = word;
                    off = advance_offset(key.len(), off);
                }
                BorderWr::NewLayer(slot) => {
                    let top = build_layer(n, slot, key, off, value);
                    n.replace_at(slot, top);
                    n.latch.unlock();
                    inner.n_count.fetch_add(1, Relaxed);
                    return Ok(Wr::Inserted);
                }
                BorderWr::Full => {
                    let (fence, n1_word) = n.split();
                    let n1 = MassNode::from_word(n1_word);

                    let target = if slice < fence { n } else { n1 };
                    match target.border_insert(key, off, value) {
                        BorderWr::Inserted => (),
                        res => unreachable!("post-split insert {:?}", res),
                    }

                    inner.promote(n, fence, n1);
                    inner.n_count.fetch_add(1, Relaxed);
                    return Ok(Wr::Inserted);
                }
            }
        }
    }

    /// Get the value set for `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<u64>> {
        util::validate_key(key, self.inner.config.max_key_size)?;

        let inner = &*self.inner;
        let mut off = 0_usize;
        let mut root_word = inner.root.load(Acquire);

        'layer: loop {
            let slice = keyslice_at(key, off);
            let (mut n, mut v) = inner.find_border(root_word, slice);

            loop {
                let res = n.border_search(slice);
                let v1 = n.latch.load();
                if !v1.same_data(v) {
                    // skew; re-stabilize, then walk right while siblings
                    // cover the slice.
                    v = n.latch.stable();
                    loop {
                        let next_word = n.next_sibling();
                        if next_word == 0 {
                            break;
                        }
                        let next = MassNode::from_word(next_word);
                        if next.len() > 0 && next.low_slice() <= slice {
                            n = next;
                            v = n.latch.stable();
                        } else {
                            break;
                        }
                    }
                    continue;
                }
                match res {
                    MassRd::Missing => return Ok(None),
                    // mid-replacement slot, spin until it lands.
                    MassRd::Unstable => continue,
                    MassRd::Terminal { suffix, value } => {
                        let stored = Suffix::from_word(suffix);
                        let hit = stored.key.as_slice() == key;
                        return Ok(if hit { Some(value) } else { None });
                    }
                    MassRd::NextLayer(word) => {
                        root_word = word;
                        off = advance_offset(key.len(), off);
                        continue 'layer;
                    }
                }
            }
        }
    }

    /// Verify ordering invariants across every layer.
    pub fn validate(&self) -> Result<()> {
        MassNode::from_word(self.inner.root.load(Acquire)).validate()
    }
}

impl Inner {
    // descend the current layer to the border covering `slice`, returning
    // it with the stable version that proved the path.
    fn find_border(&self, mut root_word: u64, slice: u64) -> (&MassNode, Version) {
        'retry: loop {
            let mut n = MassNode::from_word(root_word);
            let mut v = n.latch.stable();
            if !v.is_root() {
                // the layer root split under us, climb to its parent.
                let parent = n.parent_word();
                if parent != 0 {
                    root_word = parent;
                }
                continue 'retry;
            }

            loop {
                if v.is_border() {
                    return (n, v);
                }
                let n1 = MassNode::from_word(n.descend(slice));
                let v1 = n1.latch.stable();
                if n.latch.load().same_data(v) {
                    // the descent edge is proven, move down.
                    n = n1;
                    v = v1;
                    continue;
                }
                let v2 = n.latch.stable();
                if v2.vsplit() != v.vsplit() {
                    continue 'retry;
                }
                // an insert moved keys within this node, re-descend it.
                v = v2;
            }
        }
    }

    // propagate a split up the current layer. Both `n` and `n1` arrive
    // latched; all latches are released on return.
    fn promote(&self, n: &MassNode, fence: u64, n1: &MassNode) {
        let mut n = n;
        let mut fence = fence;
        let mut n1 = n1;

        loop {
            match n.locked_parent() {
                None => {
                    // layer-0 root split, grow and publish.
                    let root_word = self.grow(n, fence, n1);
                    self.root.store(root_word, Release);
                    n.latch.unlock();
                    n1.latch.unlock();
                    debug!(target: "mass", "{:?} grew layer-0 root", self.name);
                    return;
                }
                Some(p) if p.is_border() => {
                    // `n` roots a deeper layer; grow it and swing the
                    // link slot in the border above.
                    let root_word = self.grow(n, fence, n1);
                    p.swap_child(n as *const MassNode as u64, root_word);
                    n.latch.unlock();
                    n1.latch.unlock();
                    p.latch.unlock();
                    return;
                }
                Some(p) if !p.is_full() => {
                    p.interior_insert(fence, n1 as *const MassNode as u64);
                    n.latch.unlock();
                    n1.latch.unlock();
                    p.latch.unlock();
                    return;
                }
                Some(p) => {
                    n.latch.unlock();
                    let (fence1, p1_word) = p.split();
                    let p1 = MassNode::from_word(p1_word);
                    let target = if fence < fence1 { p } else { p1 };
                    target.interior_insert(fence, n1 as *const MassNode as u64);
                    n1.latch.unlock();

                    n = p;
                    fence = fence1;
                    n1 = p1;
                }
            }
        }
    }

    // grow a fresh interior root over `n` and `n1`. Require: both
    // latched; returns the new root's word.
    fn grow(&self, n: &MassNode, fence: u64, n1: &MassNode) -> u64 {
        let root_word = MassNode::new_interior_word();
        let root = MassNode::from_word(root_word);

        root.latch.lock();
        root.latch.set_root(true);
        root.set_first_child(n as *const MassNode as u64);
        root.interior_insert(fence, n1 as *const MassNode as u64);
        n.latch.set_root(false);
        n1.latch.set_root(false);
        root.latch.unlock();

        root_word
    }
}

// build the layer (or chain of layers) separating the terminal record at
// `slot` from `key`. Returns the top layer's root, ready to be linked in.
fn build_layer(n: &MassNode, slot: usize, key: &[u8], off: usize, value: u64) -> u64 {
    let (conflict_suffix, conflict_value) = n.conflict_at(slot);
    let ckey = &Suffix::from_word(conflict_suffix).key;

    let top_word = MassNode::new_border_word(true);
    let mut cur = MassNode::from_word(top_word);
    let mut depth = off + 8;

    loop {
        let coff = depth.min(ckey.len());
        let noff = depth.min(key.len());
        let cslice = keyslice_at(ckey, coff);
        let nslice = keyslice_at(key, noff);

        if cslice != nslice {
            cur.seed_terminal(conflict_suffix, conflict_value, coff);
            cur.seed_terminal(Suffix::new_word(key), value, noff);
            return top_word;
        }

        // slices agree for another full chunk, chain one layer deeper.
        assert!(
            ckey.len() > depth || key.len() > depth,
            "indistinguishable keys in layer build"
        );
        let deeper_word = MassNode::new_border_word(true);
        cur.seed_link(cslice, deeper_word);
        cur = MassNode::from_word(deeper_word);
        depth += 8;
    }
}

#[cfg(test)]
#[path = "tree_test.rs"]
mod tree_test;
