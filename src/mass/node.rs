//! Module `node` implement border and interior nodes for the mass index.
//!
//! A node holds up to 15 key slices. The logical (sorted) order lives in a
//! packed permutation word, 4 bits per slot plus a 4-bit count, published
//! with release ordering; physical slots never move once written, they are
//! recycled through the `removed` bitmap after a split.

use std::sync::atomic::{
    AtomicU32, AtomicU64, AtomicU8,
    Ordering::{Acquire, Relaxed, Release},
};

use crate::version::{Latch, BORDER_BIT, ROOT_BIT};

pub(crate) const MAX_KEY_COUNT: usize = 15;

// keylen markers; real slice lengths are 0..=8.
pub(crate) const MAGIC_UNSTABLE: u8 = 0x10;
pub(crate) const MAGIC_LINK: u8 = 0x20;

/// Big-endian 8-byte chunk of `key` starting at `off`, zero padded.
pub(crate) fn keyslice_at(key: &[u8], off: usize) -> u64 {
    debug_assert!(off <= key.len());

    let mut buf = [0_u8; 8];
    let n = (key.len() - off).min(8);
    buf[..n].copy_from_slice(&key[off..off + n]);
    u64::from_be_bytes(buf)
}

/// Bytes of `key` covered by the slice at `off`.
pub(crate) fn slice_len_at(key: &[u8], off: usize) -> u8 {
    (key.len() - off).min(8) as u8
}

/// Key offset of the layer below one rooted at `off`.
pub(crate) fn advance_offset(key_len: usize, off: usize) -> usize {
    (off + 8).min(key_len)
}

// ---- permutation word plumbing.

#[inline]
fn perm_count(perm: u64) -> usize {
    (perm & 0xf) as usize
}

#[inline]
fn perm_index(perm: u64, i: usize) -> usize {
    ((perm >> ((i + 1) * 4)) & 0xf) as usize
}

// place physical `slot` at logical position `at`, bumping the count.
fn perm_insert(perm: u64, at: usize, slot: usize) -> u64 {
    let mask = (1_u64 << ((at + 1) * 4)) - 1;
    ((perm & !mask) << 4) | ((slot as u64) << ((at + 1) * 4)) | ((perm & mask) + 1)
}

// identity permutation over `count` slots.
fn perm_sequential(count: usize) -> u64 {
    0xedcb_a987_6543_2100 | count as u64
}

/// Suffix allocation hanging off a terminal border slot: the full key.
pub(crate) struct Suffix {
    pub key: Vec<u8>,
}

impl Suffix {
    pub(crate) fn new_word(key: &[u8]) -> u64 {
        Box::into_raw(Box::new(Suffix { key: key.to_vec() })) as u64
    }

    pub(crate) fn from_word<'a>(word: u64) -> &'a Suffix {
        debug_assert!(word != 0);
        unsafe { &*(word as *const Suffix) }
    }

    pub(crate) unsafe fn free_word(word: u64) {
        drop(Box::from_raw(word as *mut Suffix));
    }
}

/// Result code for a write landing on a border node.
#[derive(Debug)]
pub(crate) enum BorderWr {
    Inserted,
    Duplicate,
    /// Slice matched an existing link, descend into that layer.
    GoDeeper(u64),
    /// Slice matched a terminal record with a different key; the physical
    /// slot must be replaced with a deeper layer holding both.
    NewLayer(usize),
    /// 15 slices resident, split first.
    Full,
}

/// Result code for a read landing on a border node.
#[derive(Debug)]
pub(crate) enum MassRd {
    Missing,
    /// Slot is mid-replacement, spin and re-read.
    Unstable,
    Terminal { suffix: u64, value: u64 },
    NextLayer(u64),
}

pub(crate) struct BorderBody {
    keylen: [AtomicU8; MAX_KEY_COUNT],
    suffix: [AtomicU64; MAX_KEY_COUNT],
    lv: [AtomicU64; MAX_KEY_COUNT],
    prev: AtomicU64,
    next: AtomicU64,
}

pub(crate) struct InteriorBody {
    child: [AtomicU64; MAX_KEY_COUNT + 1],
}

pub(crate) enum Body {
    Border(BorderBody),
    Interior(InteriorBody),
}

/// A mass-index node; border and interior variants share the version
/// latch, the permutation word and the slice array.
pub(crate) struct MassNode {
    pub(crate) latch: Latch,
    permutation: AtomicU64,
    keyslice: [AtomicU64; MAX_KEY_COUNT],
    removed: AtomicU32, // bitmap of recycled physical slots, owner only
    parent: AtomicU64,
    body: Body,
}

fn atomic_u64_array<const N: usize>() -> [AtomicU64; N] {
    [(); N].map(|_| AtomicU64::new(0))
}

impl MassNode {
    fn new(body: Body, latch_bits: u32) -> u64 {
        let node = MassNode {
            latch: Latch::new(latch_bits),
            permutation: AtomicU64::new(0),
            keyslice: atomic_u64_array(),
            removed: AtomicU32::new(0),
            parent: AtomicU64::new(0),
            body,
        };
        Box::into_raw(Box::new(node)) as u64
    }

    pub(crate) fn new_border_word(root: bool) -> u64 {
        let body = Body::Border(BorderBody {
            keylen: [(); MAX_KEY_COUNT].map(|_| AtomicU8::new(0)),
            suffix: atomic_u64_array(),
            lv: atomic_u64_array(),
            prev: AtomicU64::new(0),
            next: AtomicU64::new(0),
        });
        MassNode::new(body, BORDER_BIT | if root { ROOT_BIT } else { 0 })
    }

    pub(crate) fn new_interior_word() -> u64 {
        let body = Body::Interior(InteriorBody { child: atomic_u64_array() });
        MassNode::new(body, 0)
    }

    #[inline]
    pub(crate) fn from_word<'a>(word: u64) -> &'a MassNode {
        debug_assert!(word != 0);
        unsafe { &*(word as *const MassNode) }
    }

    pub(crate) unsafe fn free_word(word: u64) {
        let node = Box::from_raw(word as *mut MassNode);
        let perm = node.permutation.load(Relaxed);
        match &node.body {
            Body::Border(border) => {
                for i in 0..perm_count(perm) {
                    let slot = perm_index(perm, i);
                    match border.keylen[slot].load(Relaxed) {
                        MAGIC_LINK => MassNode::free_word(border.lv[slot].load(Relaxed)),
                        _ => Suffix::free_word(border.suffix[slot].load(Relaxed)),
                    }
                }
            }
            Body::Interior(interior) => {
                MassNode::free_word(interior.child[0].load(Relaxed));
                for i in 0..perm_count(perm) {
                    let slot = perm_index(perm, i);
                    MassNode::free_word(interior.child[slot + 1].load(Relaxed));
                }
            }
        }
    }

    fn border(&self) -> &BorderBody {
        match &self.body {
            Body::Border(b) => b,
            Body::Interior(_) => unreachable!("interior node, border expected"),
        }
    }

    fn interior(&self) -> &InteriorBody {
        match &self.body {
            Body::Interior(b) => b,
            Body::Border(_) => unreachable!("border node, interior expected"),
        }
    }

    #[inline]
    pub(crate) fn is_border(&self) -> bool {
        matches!(self.body, Body::Border(_))
    }

    pub(crate) fn len(&self) -> usize {
        perm_count(self.permutation.load(Acquire))
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() == MAX_KEY_COUNT
    }

    /// Smallest resident slice; borders keep it at logical position 0.
    pub(crate) fn low_slice(&self) -> u64 {
        let perm = self.permutation.load(Acquire);
        debug_assert!(perm_count(perm) > 0);
        self.keyslice[perm_index(perm, 0)].load(Relaxed)
    }

    pub(crate) fn next_sibling(&self) -> u64 {
        self.border().next.load(Acquire)
    }

    pub(crate) fn parent_word(&self) -> u64 {
        self.parent.load(Acquire)
    }

    pub(crate) fn set_parent(&self, word: u64) {
        self.parent.store(word, Release);
    }

    /// Lock the parent of this node, re-validating the edge after the
    /// latch lands. None when this node is a layer root.
    pub(crate) fn locked_parent(&self) -> Option<&MassNode> {
        loop {
            let word = self.parent.load(Acquire);
            if word == 0 {
                break None;
            }
            let parent = MassNode::from_word(word);
            parent.latch.lock();
            if self.parent.load(Acquire) == word {
                break Some(parent);
            }
            parent.latch.unlock();
        }
    }

    /// Child covering `slice`. Require: interior node.
    pub(crate) fn descend(&self, slice: u64) -> u64 {
        let perm = self.permutation.load(Acquire);

        let mut first = 0_usize;
        let mut count = perm_count(perm);
        while count > 0 {
            let half = count >> 1;
            let middle = first + half;
            let slot = perm_index(perm, middle);
            if self.keyslice[slot].load(Relaxed) <= slice {
                first = middle + 1;
                count -= half + 1;
            } else {
                count = half;
            }
        }

        let at = if first > 0 { perm_index(perm, first - 1) + 1 } else { 0 };
        self.interior().child[at].load(Acquire)
    }

    /// Insert a separator into an interior node. Require: latch held, not
    /// full, `slice` not resident.
    pub(crate) fn interior_insert(&self, slice: u64, child_word: u64) {
        let perm = self.permutation.load(Relaxed);
        let count = perm_count(perm);
        debug_assert!(count < MAX_KEY_COUNT);

        let mut low = 0_usize;
        let mut high = count;
        while low < high {
            let mid = (low + high) / 2;
            let resident = self.keyslice[perm_index(perm, mid)].load(Relaxed);
            debug_assert!(resident != slice);
            if resident < slice {
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        let slot = self.claim_slot(count);

        self.keyslice[slot].store(slice, Relaxed);
        self.interior().child[slot + 1].store(child_word, Release);
        MassNode::from_word(child_word).set_parent(self as *const MassNode as u64);

        self.permutation.store(perm_insert(perm, low, slot), Release);
    }

    /// First child of an interior node. Require: latch held, or node
    /// private.
    pub(crate) fn set_first_child(&self, child_word: u64) {
        MassNode::from_word(child_word).set_parent(self as *const MassNode as u64);
        self.interior().child[0].store(child_word, Release);
    }

    // pick a physical slot, recycling removed slots first. Recycled slots
    // may still be referenced through a stale permutation, flag the write.
    fn claim_slot(&self, count: usize) -> usize {
        let removed = self.removed.load(Relaxed);
        if removed != 0 {
            let slot = removed.trailing_zeros() as usize;
            self.removed.store(removed & !(1 << slot), Relaxed);
            self.latch.set_inserting();
            slot
        } else {
            count
        }
    }

    /// Write a terminal record into a border node.
    /// Require: latch held.
    pub(crate) fn border_insert(&self, key: &[u8], off: usize, value: u64) -> BorderWr {
        let slice = keyslice_at(key, off);
        let border = self.border();

        let perm = self.permutation.load(Relaxed);
        let count = perm_count(perm);

        let mut low = 0_usize;
        let mut high = count;
        while low < high {
            let mid = (low + high) / 2;
            let slot = perm_index(perm, mid);
            let resident = self.keyslice[slot].load(Relaxed);
            if resident < slice {
                low = mid + 1;
            } else if resident > slice {
                high = mid;
            } else {
                let status = border.keylen[slot].load(Acquire);
                debug_assert!(status != MAGIC_UNSTABLE);
                if status == MAGIC_LINK {
                    return BorderWr::GoDeeper(border.lv[slot].load(Acquire));
                }
                let suffix = Suffix::from_word(border.suffix[slot].load(Relaxed));
                if suffix.key.as_slice() == key {
                    return BorderWr::Duplicate;
                }
                return BorderWr::NewLayer(slot);
            }
        }

        if count == MAX_KEY_COUNT {
            return BorderWr::Full;
        }

        let slot = self.claim_slot(count);

        self.keyslice[slot].store(slice, Relaxed);
        border.keylen[slot].store(slice_len_at(key, off), Relaxed);
        border.suffix[slot].store(Suffix::new_word(key), Relaxed);
        border.lv[slot].store(value, Relaxed);

        self.permutation.store(perm_insert(perm, low, slot), Release);
        BorderWr::Inserted
    }

    /// Latch-free border lookup of `slice`, candidate result only: the
    /// caller owns version validation, except for [MassRd::Unstable]
    /// which is always final and means spin-retry.
    pub(crate) fn border_search(&self, slice: u64) -> MassRd {
        let border = self.border();
        let perm = self.permutation.load(Acquire);

        let mut low = 0_usize;
        let mut high = perm_count(perm);
        while low < high {
            let mid = (low + high) / 2;
            let slot = perm_index(perm, mid);
            let resident = self.keyslice[slot].load(Relaxed);
            if resident < slice {
                low = mid + 1;
            } else if resident > slice {
                high = mid;
            } else {
                return match border.keylen[slot].load(Acquire) {
                    MAGIC_UNSTABLE => MassRd::Unstable,
                    MAGIC_LINK => MassRd::NextLayer(border.lv[slot].load(Acquire)),
                    status => {
                        let suffix = border.suffix[slot].load(Acquire);
                        let value = border.lv[slot].load(Acquire);
                        // a link replacement publishes through the slot
                        // status alone, without a version bump; prove the
                        // slot still terminal after reading it.
                        if border.keylen[slot].load(Acquire) != status || suffix == 0 {
                            MassRd::Unstable
                        } else {
                            MassRd::Terminal { suffix, value }
                        }
                    }
                };
            }
        }
        MassRd::Missing
    }

    /// Terminal record at physical `slot`, for relocation into a deeper
    /// layer. Require: latch held.
    pub(crate) fn conflict_at(&self, slot: usize) -> (u64, u64) {
        let border = self.border();
        debug_assert!(border.keylen[slot].load(Relaxed) <= 8);
        (border.suffix[slot].load(Relaxed), border.lv[slot].load(Relaxed))
    }

    /// Swing physical `slot` from a terminal record to a link, using the
    /// unstable marker so racing readers spin instead of misreading.
    /// Require: latch held.
    pub(crate) fn replace_at(&self, slot: usize, layer_word: u64) {
        let border = self.border();
        debug_assert!(border.keylen[slot].load(Relaxed) != MAGIC_UNSTABLE);

        border.keylen[slot].store(MAGIC_UNSTABLE, Release);
        border.suffix[slot].store(0, Relaxed);
        border.lv[slot].store(layer_word, Relaxed);
        MassNode::from_word(layer_word).set_parent(self as *const MassNode as u64);
        border.keylen[slot].store(MAGIC_LINK, Release);
    }

    /// Replace the link of child `old_word` with `new_word`. Used when a
    /// deep layer's root splits and grows a fresh layer root. Require:
    /// latch held, border node.
    pub(crate) fn swap_child(&self, old_word: u64, new_word: u64) {
        let border = self.border();
        let perm = self.permutation.load(Relaxed);
        for i in 0..perm_count(perm) {
            let slot = perm_index(perm, i);
            if border.keylen[slot].load(Relaxed) == MAGIC_LINK
                && border.lv[slot].load(Relaxed) == old_word
            {
                self.replace_at(slot, new_word);
                return;
            }
        }
        unreachable!("no link slot for child");
    }

    /// Seed a record into a private, unpublished border node.
    pub(crate) fn seed_terminal(&self, suffix_word: u64, value: u64, off: usize) {
        let key = &Suffix::from_word(suffix_word).key;
        let slice = keyslice_at(key, off);
        let border = self.border();

        let perm = self.permutation.load(Relaxed);
        let count = perm_count(perm);
        let mut low = 0;
        while low < count {
            let resident = self.keyslice[perm_index(perm, low)].load(Relaxed);
            assert!(resident != slice, "seed collision");
            if resident > slice {
                break;
            }
            low += 1;
        }

        self.keyslice[count].store(slice, Relaxed);
        border.keylen[count].store(slice_len_at(key, off), Relaxed);
        border.suffix[count].store(suffix_word, Relaxed);
        border.lv[count].store(value, Relaxed);
        self.permutation.store(perm_insert(perm, low, count), Release);
    }

    /// Seed a link into a private, unpublished border node.
    pub(crate) fn seed_link(&self, slice: u64, layer_word: u64) {
        let border = self.border();
        let perm = self.permutation.load(Relaxed);
        let count = perm_count(perm);

        self.keyslice[count].store(slice, Relaxed);
        border.keylen[count].store(MAGIC_LINK, Relaxed);
        border.suffix[count].store(0, Relaxed);
        border.lv[count].store(layer_word, Relaxed);
        MassNode::from_word(layer_word).set_parent(self as *const MassNode as u64);
        self.permutation.store(perm_insert(perm, count, count), Release);
    }

    /// Split the upper half into a fresh sibling. Returns the fence slice
    /// and the sibling, which inherits this node's version word and hence
    /// comes back already latched by the caller. Require: latch held,
    /// node full.
    pub(crate) fn split(&self) -> (u64, u64) {
        self.latch.set_splitting();
        let version = self.latch.load();

        let new_word = match &self.body {
            Body::Border(_) => MassNode::new_border_word(false),
            Body::Interior(_) => MassNode::new_interior_word(),
        };
        let new = MassNode::from_word(new_word);
        // the sibling starts life with the splitter's version word: locked
        // and split-marked; the split bits fold away at unlock.
        new.latch.set(version);

        let perm = self.permutation.load(Relaxed);
        debug_assert!(perm_count(perm) == MAX_KEY_COUNT);
        debug_assert!(self.removed.load(Relaxed) == 0);

        let mut removed = 0_u32;
        let fence = match (&self.body, &new.body) {
            (Body::Border(old_b), Body::Border(new_b)) => {
                // move the upper seven records.
                for (j, i) in (8..MAX_KEY_COUNT).enumerate() {
                    let slot = perm_index(perm, i);
                    new.keyslice[j].store(self.keyslice[slot].load(Relaxed), Relaxed);
                    let status = old_b.keylen[slot].load(Relaxed);
                    new_b.keylen[j].store(status, Relaxed);
                    new_b.suffix[j].store(old_b.suffix[slot].load(Relaxed), Relaxed);
                    let lv = old_b.lv[slot].load(Relaxed);
                    new_b.lv[j].store(lv, Relaxed);
                    if status == MAGIC_LINK {
                        MassNode::from_word(lv).set_parent(new_word);
                    }
                    removed |= 1 << slot;
                }
                new.permutation.store(perm_sequential(7), Relaxed);
                self.removed.store(removed, Relaxed);
                self.permutation.store(perm - 7, Release);

                // splice the sibling chain, publish `next` last so a
                // reader walking right sees a fully formed node.
                let old_next = old_b.next.load(Relaxed);
                new_b.prev.store(self as *const MassNode as u64, Relaxed);
                new_b.next.store(old_next, Relaxed);
                if old_next != 0 {
                    MassNode::from_word(old_next).border().prev.store(new_word, Release);
                }
                old_b.next.store(new_word, Release);

                new.keyslice[0].load(Relaxed)
            }
            (Body::Interior(old_i), Body::Interior(new_i)) => {
                // the median separator is promoted, its child leads the
                // sibling.
                let slot = perm_index(perm, 7);
                let fence = self.keyslice[slot].load(Relaxed);
                let lead = old_i.child[slot + 1].load(Relaxed);
                new_i.child[0].store(lead, Relaxed);
                MassNode::from_word(lead).set_parent(new_word);
                removed |= 1 << slot;

                for (j, i) in (8..MAX_KEY_COUNT).enumerate() {
                    let slot = perm_index(perm, i);
                    new.keyslice[j].store(self.keyslice[slot].load(Relaxed), Relaxed);
                    let child = old_i.child[slot + 1].load(Relaxed);
                    new_i.child[j + 1].store(child, Relaxed);
                    MassNode::from_word(child).set_parent(new_word);
                    removed |= 1 << slot;
                }
                new.permutation.store(perm_sequential(7), Relaxed);
                self.removed.store(removed, Relaxed);
                self.permutation.store(perm - 8, Release);

                fence
            }
            _ => unreachable!(),
        };

        (fence, new_word)
    }

    /// Verify slice ordering and recurse into children and layers.
    pub(crate) fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        let perm = self.permutation.load(Acquire);
        let count = perm_count(perm);

        let mut prev: Option<u64> = None;
        for i in 0..count {
            let slice = self.keyslice[perm_index(perm, i)].load(Relaxed);
            if let Some(p) = prev {
                if p >= slice {
                    err_at!(Fatal, msg: "mass node slices unordered at {}", i)?;
                }
            }
            prev = Some(slice);
        }

        match &self.body {
            Body::Border(border) => {
                for i in 0..count {
                    let slot = perm_index(perm, i);
                    if border.keylen[slot].load(Relaxed) == MAGIC_LINK {
                        MassNode::from_word(border.lv[slot].load(Relaxed)).validate()?;
                    }
                }
                let next = border.next.load(Relaxed);
                if count > 0 && next != 0 {
                    let last = self.keyslice[perm_index(perm, count - 1)].load(Relaxed);
                    let sibling = MassNode::from_word(next);
                    if sibling.len() > 0 && last >= sibling.low_slice() {
                        err_at!(Fatal, msg: "mass sibling low-slice out of order")?;
                    }
                }
            }
            Body::Interior(interior) => {
                MassNode::from_word(interior.child[0].load(Relaxed)).validate()?;
                for i in 0..count {
                    let slot = perm_index(perm, i);
                    MassNode::from_word(interior.child[slot + 1].load(Relaxed)).validate()?;
                }
            }
        }
        Ok(())
    }
}
