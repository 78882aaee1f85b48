//! Module `tree` implement the adaptive radix tree index.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering::{Acquire, Relaxed, Release}},
    Arc, Mutex,
};

use crate::{
    art::node::{is_leaf, ArtLeaf, ArtNode},
    util, Config, Result, Wr,
};

enum PutRes {
    Done(Wr),
    /// Version skew; start over from the tree root.
    Restart,
}

/// Index type for concurrent reads and writes over an adaptive radix
/// tree.
///
/// Clone the handle to share the index across threads. Writes run on the
/// caller's thread latching at most a node and its parent; reads are
/// latch-free and restart from the root on any version skew.
#[derive(Clone)]
pub struct Index {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    config: Config,
    root: AtomicU64,
    n_count: AtomicUsize,
    // nodes superseded by a bigger variant stay readable until the index
    // goes away; their children live on in the replacement.
    retired: Mutex<Vec<u64>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let word = self.root.load(Relaxed);
        if word != 0 {
            if is_leaf(word) {
                unsafe { ArtLeaf::free_word(word) };
            } else {
                unsafe { ArtNode::free_word(word) };
            }
        }
        for word in self.retired.lock().unwrap().drain(..) {
            unsafe { ArtNode::discard_private(word) };
        }
    }
}

impl Index {
    /// Create an empty index.
    pub fn new(name: &str, config: Config) -> Index {
        let inner = Inner {
            name: name.to_string(),
            config: config.into_clamped(),
            root: AtomicU64::new(0),
            n_count: AtomicUsize::new(0),
            retired: Mutex::new(vec![]),
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
        loop {
            match inner.put_rec(None, &inner.root, key, 0, value) {
                PutRes::Done(wr) => {
                    if let Wr::Inserted = wr {
                        inner.n_count.fetch_add(1, Relaxed);
                    }
                    return Ok(wr);
                }
                PutRes::Restart => (),
            }
        }
    }

    /// Get the value set for `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<u64>> {
        util::validate_key(key, self.inner.config.max_key_size)?;

        let inner = &*self.inner;
        'restart: loop {
            let mut word = inner.root.load(Acquire);
            let mut off = 0_usize;

            loop {
                if word == 0 {
                    return Ok(None);
                }
                if is_leaf(word) {
                    let leaf = ArtLeaf::from_word(word);
                    let hit = leaf.key.as_slice() == key;
                    return Ok(if hit { Some(leaf.value) } else { None });
                }

                let an = ArtNode::from_word(word);
                let v = an.latch.stable();
                if v.is_deleted() {
                    continue 'restart;
                }

                let (matched, plen) = an.prefix_compare(key, off);
                let at = off + matched;
                let byte = if at < key.len() { key[at] } else { 0 };
                let child = match an.find_child(byte) {
                    Some(slot) => slot.load(Acquire),
                    None => 0,
                };

                // one validation proves both the prefix walk and the
                // child probe; any skew restarts from the root.
                let v1 = an.latch.load();
                if v1.is_deleted() || !v1.same_data(v) {
                    continue 'restart;
                }

                if matched != plen {
                    return Ok(None);
                }
                if child == 0 {
                    return Ok(None);
                }
                word = child;
                off = if at < key.len() { at + 1 } else { at };
            }
        }
    }

    /// Verify that every node's prefix and child bytes agree with the
    /// keys stored below it.
    pub fn validate(&self) -> Result<()> {
        let word = self.inner.root.load(Acquire);
        if word == 0 {
            return Ok(());
        }
        let mut path = vec![];
        validate_rec(word, &mut path)
    }
}

impl Inner {
    fn retire(&self, word: u64) {
        self.retired.lock().unwrap().push(word);
    }

    // one recursion step per tree level. `slot` belongs to `parent`
    // (or is the root cell); every structural publication re-proves the
    // slot under its owner's latch.
    fn put_rec(
        &self,
        parent: Option<&ArtNode>,
        slot: &AtomicU64,
        key: &[u8],
        off: usize,
        value: u64,
    ) -> PutRes {
        loop {
            let word = slot.load(Acquire);

            // empty slot: claim it with a bare CAS. Only the root cell
            // and 256-way slots can be empty, neither ever goes stale.
            if word == 0 {
                let leaf = ArtLeaf::new_word(key, value);
                match slot.compare_exchange(0, leaf, Release, Acquire) {
                    Ok(_) => return PutRes::Done(Wr::Inserted),
                    Err(_) => {
                        unsafe { ArtLeaf::free_word(leaf) };
                        continue;
                    }
                }
            }

            // leaf in the way: fork into a branch holding both keys.
            if is_leaf(word) {
                let leaf = ArtLeaf::from_word(word);
                if leaf.key.as_slice() == key {
                    return PutRes::Done(Wr::Duplicate);
                }
                match parent {
                    Some(par) => {
                        if !par.lock_live() {
                            return PutRes::Restart;
                        }
                        if slot.load(Acquire) != word {
                            par.latch.unlock();
                            continue;
                        }
                        par.latch.set_inserting();
                        let branch = build_fork(word, leaf, key, off, value);
                        slot.store(branch, Release);
                        par.latch.unlock();
                        return PutRes::Done(Wr::Inserted);
                    }
                    None => {
                        let branch = build_fork(word, leaf, key, off, value);
                        match slot.compare_exchange(word, branch, Release, Acquire) {
                            Ok(_) => return PutRes::Done(Wr::Inserted),
                            Err(_) => {
                                unsafe { discard_fork(branch, word) };
                                continue;
                            }
                        }
                    }
                }
            }

            let an = ArtNode::from_word(word);
            let v = an.latch.stable();
            if v.is_deleted() {
                return PutRes::Restart;
            }

            let (matched, plen) = an.prefix_compare(key, off);
            let v1 = an.latch.load();
            if v1.is_deleted() || v1.vsplit() != v.vsplit() {
                return PutRes::Restart;
            }

            if matched != plen {
                // prefix mismatch: expand through a fork above this node.
                return self.expand(parent, slot, word, key, off, value);
            }

            let at = off + plen;
            let byte = if at < key.len() { key[at] } else { 0 };
            let down = if at < key.len() { at + 1 } else { at };

            if let Some(child_slot) = an.find_child(byte) {
                let v1 = an.latch.load();
                if v1.is_deleted() {
                    return PutRes::Restart;
                }
                return self.put_rec(Some(an), child_slot, key, down, value);
            }

            // no mapping for `byte` yet, take the latch and add one.
            if !an.lock_live() {
                return PutRes::Restart;
            }
            if let Some(child_slot) = an.find_child(byte) {
                // lost the race to another writer of the same byte.
                an.latch.unlock();
                return self.put_rec(Some(an), child_slot, key, down, value);
            }

            if !an.is_full() {
                an.latch.set_inserting();
                an.add_child(byte, ArtLeaf::new_word(key, value));
                an.latch.unlock();
                return PutRes::Done(Wr::Inserted);
            }

            // full: copy into the next variant, add there, publish, and
            // leave this node behind as a dead husk.
            let res = match parent {
                Some(par) => {
                    if !par.lock_live() {
                        an.latch.unlock();
                        return PutRes::Restart;
                    }
                    if slot.load(Acquire) != word {
                        par.latch.unlock();
                        an.latch.unlock();
                        continue;
                    }
                    let new_word = an.grow();
                    ArtNode::from_word(new_word).add_child(byte, ArtLeaf::new_word(key, value));
                    par.latch.set_inserting();
                    slot.store(new_word, Release);
                    an.latch.set_deleted();
                    self.retire(word);
                    par.latch.unlock();
                    PutRes::Done(Wr::Inserted)
                }
                None => {
                    // holding this node's latch pins the root cell.
                    let new_word = an.grow();
                    ArtNode::from_word(new_word).add_child(byte, ArtLeaf::new_word(key, value));
                    slot.store(new_word, Release);
                    an.latch.set_deleted();
                    self.retire(word);
                    PutRes::Done(Wr::Inserted)
                }
            };
            an.latch.unlock();
            return res;
        }
    }

    // split this node's prefix at the first byte disagreeing with `key`,
    // interposing a fresh branch that holds the old node and a new leaf.
    fn expand(
        &self,
        parent: Option<&ArtNode>,
        slot: &AtomicU64,
        word: u64,
        key: &[u8],
        off: usize,
        value: u64,
    ) -> PutRes {
        let an = ArtNode::from_word(word);

        if !an.lock_live() {
            return PutRes::Restart;
        }
        // the prefix was read optimistically, re-judge it under latch.
        let (matched, plen) = an.prefix_compare(key, off);
        if matched == plen {
            an.latch.unlock();
            return PutRes::Restart;
        }

        if let Some(par) = parent {
            if !par.lock_live() {
                an.latch.unlock();
                return PutRes::Restart;
            }
            if slot.load(Acquire) != word {
                par.latch.unlock();
                an.latch.unlock();
                return PutRes::Restart;
            }
            par.latch.set_inserting();
        }

        an.latch.set_splitting();

        let branch_word = ArtNode::new_n4_word();
        let branch = ArtNode::from_word(branch_word);
        branch.set_prefix(&key[off..off + matched]);

        let an_byte = an.truncate_prefix(matched);
        branch.add_child(an_byte, word);

        let key_byte = if off + matched < key.len() { key[off + matched] } else { 0 };
        debug_assert_ne!(an_byte, key_byte);
        branch.add_child(key_byte, ArtLeaf::new_word(key, value));

        slot.store(branch_word, Release);

        if let Some(par) = parent {
            par.latch.unlock();
        }
        an.latch.unlock();
        PutRes::Done(Wr::Inserted)
    }
}

// branch (or chain of branches) covering the bytes shared by `leaf` and
// `key` past `off`, with both leaves hung at their first difference.
fn build_fork(old_word: u64, leaf: &ArtLeaf, key: &[u8], off: usize, value: u64) -> u64 {
    let l = &leaf.key;
    let mut d = off;
    while d < l.len() && d < key.len() && l[d] == key[d] {
        d += 1;
    }

    let top_word = ArtNode::new_n4_word();
    let mut cur = ArtNode::from_word(top_word);
    let mut c = off;
    loop {
        let span = (d - c).min(8);
        cur.set_prefix(&key[c..c + span]);
        c += span;
        if c == d {
            break;
        }
        // the shared run outgrew one inline prefix, chain another node
        // through the next shared byte.
        let next_word = ArtNode::new_n4_word();
        cur.add_child(key[c], next_word);
        c += 1;
        cur = ArtNode::from_word(next_word);
    }

    let lbyte = if d < l.len() { l[d] } else { 0 };
    let kbyte = if d < key.len() { key[d] } else { 0 };
    debug_assert_ne!(lbyte, kbyte);
    cur.add_child(lbyte, old_word);
    cur.add_child(kbyte, ArtLeaf::new_word(key, value));

    top_word
}

// free an unpublished fork, keeping the pre-existing leaf alive.
unsafe fn discard_fork(word: u64, keep: u64) {
    let node = ArtNode::from_word(word);
    let mut children = vec![];
    node.each_child(|_, child| children.push(child));
    for child in children {
        if is_leaf(child) {
            if child != keep {
                ArtLeaf::free_word(child);
            }
        } else {
            discard_fork(child, keep);
        }
    }
    ArtNode::discard_private(word);
}

fn validate_rec(word: u64, path: &mut Vec<u8>) -> Result<()> {
    use crate::Error;

    if is_leaf(word) {
        let leaf = ArtLeaf::from_word(word);
        let n = path.len().min(leaf.key.len());
        if &leaf.key[..n] != &path[..n] {
            err_at!(Fatal, msg: "leaf key disagrees with its path")?;
        }
        // bytes past a short key must be the exhausted-key marker.
        if path[n..].iter().any(|b| *b != 0) {
            err_at!(Fatal, msg: "short leaf under non-zero path")?;
        }
        return Ok(());
    }

    let an = ArtNode::from_word(word);
    let plen = an.to_prefix_len();
    for i in 0..plen {
        path.push(an.prefix_byte(i));
    }

    let mut entries = vec![];
    an.each_child(|byte, child| entries.push((byte, child)));
    let mut seen = [false; 256];
    for (byte, child) in entries {
        if seen[byte as usize] {
            err_at!(Fatal, msg: "duplicate child byte {}", byte)?;
        }
        seen[byte as usize] = true;

        path.push(byte);
        validate_rec(child, path)?;
        path.pop();
    }

    path.truncate(path.len() - plen);
    Ok(())
}

#[cfg(test)]
#[path = "tree_test.rs"]
mod tree_test;
