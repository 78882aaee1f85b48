//! Module `worker` implement the staged, barrier-synchronized batch
//! evaluator.
//!
//! Workers are wired in a chain. Synchronization is a token relay: the
//! left end seeds a token rightward, the right end seeds one leftward,
//! and a worker leaves the rendezvous only after both tokens passed it.
//! The tokens double as boundary-leaf information, which is how a worker
//! learns whether its left neighbor claimed its first leaf and whether it
//! claims leaves from its right neighbors, with O(1) traffic per stage.
//!
//! Between two rendezvous a worker's paths and fences are frozen and may
//! be read by any other worker; mutation is confined to the owner in its
//! exclusive stages. That discipline, not latches, is what makes the
//! node writes safe.

use std::{
    cell::UnsafeCell,
    sync::atomic::{
        AtomicU64,
        Ordering::{Acquire, Relaxed, Release},
    },
};

use crate::{
    node::{Kind, Node, NodeWr},
    palm::{batch::Batch, batch::Op, tree::Descend},
    util,
};

/// Deepest tree any path can record; plenty for any realistic fan-out.
pub(crate) const MAX_DEPTH: usize = 7;

// one mailbox channel per rendezvous level within a batch.
const CHANNEL_SIZE: usize = MAX_DEPTH + 3;

// boundary token; node words are aligned so no real node collides.
const MAGIC: u64 = 1;

pub(crate) unsafe fn nref<'a>(word: u64) -> &'a Node {
    debug_assert!(word != 0 && word != MAGIC);
    &*(word as *const Node)
}

pub(crate) unsafe fn nmut<'a>(word: u64) -> &'a mut Node {
    debug_assert!(word != 0 && word != MAGIC);
    &mut *(word as *mut Node)
}

pub(crate) fn new_node_word(kind: Kind, level: u8, size: usize) -> u64 {
    Box::into_raw(Box::new(Node::new(kind, level, size))) as u64
}

/// Root-to-leaf descent record of one batch entry.
#[derive(Clone)]
pub(crate) struct Path {
    pub kv: usize,
    depth: usize,
    nodes: [u64; MAX_DEPTH],
}

impl Path {
    fn new(kv: usize) -> Path {
        Path { kv, depth: 0, nodes: [0; MAX_DEPTH] }
    }

    fn push(&mut self, word: u64) {
        assert!(self.depth < MAX_DEPTH, "descent too deep");
        self.nodes[self.depth] = word;
        self.depth += 1;
    }

    fn top(&self) -> u64 {
        self.nodes[self.depth - 1]
    }

    // nodes[0] is the root, the leaf sits at level 0.
    fn node_at_level(&self, level: usize) -> u64 {
        debug_assert!(self.depth > level);
        self.nodes[self.depth - level - 1]
    }

    // keep the kv id, adopt the other path's nodes.
    fn copy_nodes(&mut self, other: &Path) {
        self.depth = other.depth;
        self.nodes = other.nodes;
    }
}

/// A split record: separator key, the new sibling, and the path whose
/// ancestors tell every later stage where the separator goes.
#[derive(Clone)]
pub(crate) struct Fence {
    path: Path,
    key: Vec<u8>,
    ptr: u64,
}

#[derive(Default)]
struct WorkerState {
    paths: Vec<Path>,
    // alternated by level parity: fences targeting level l live in
    // buffer (l - 1) % 2.
    fences: [Vec<Fence>; 2],
    beg_path: usize,
    tot_path: usize,
    beg_fence: usize,
    tot_fence: usize,
    their_last: u64,
    my_last: u64,
}

/// Per-worker structure: neighbor mailboxes plus stage-owned state.
pub(crate) struct Worker {
    id: usize,
    total: usize,
    // inboxes: `first[c]` is written by the successor, `last[c]` by the
    // predecessor.
    first: [AtomicU64; CHANNEL_SIZE],
    last: [AtomicU64; CHANNEL_SIZE],
    state: UnsafeCell<WorkerState>,
}

// state is handed between workers only across rendezvous points; see the
// module comment.
unsafe impl Sync for Worker {}

impl Worker {
    pub(crate) fn new(id: usize, total: usize) -> Worker {
        assert!(id < total);
        Worker {
            id,
            total,
            first: [(); CHANNEL_SIZE].map(|_| AtomicU64::new(0)),
            last: [(); CHANNEL_SIZE].map(|_| AtomicU64::new(0)),
            state: UnsafeCell::new(WorkerState::default()),
        }
    }

    // shared view of a frozen stage; require: a rendezvous separates this
    // read from the owner's last write.
    unsafe fn state(&self) -> &WorkerState {
        &*self.state.get()
    }

    // exclusive view; require: calling thread drives this worker.
    #[allow(clippy::mut_from_ref)]
    unsafe fn state_mut(&self) -> &mut WorkerState {
        &mut *self.state.get()
    }
}

/// Run one batch through the four stages. Every worker of the pool calls
/// this with the same batch; worker zero additionally publishes root
/// growth into `root`.
pub(crate) fn execute_batch(
    workers: &[Worker],
    id: usize,
    batch: &Batch,
    root: &AtomicU64,
    node_size: usize,
    policy: Descend,
) {
    let me = &workers[id];
    {
        let state = unsafe { me.state_mut() };
        state.paths.clear();
        state.fences[0].clear();
        state.fences[1].clear();
    }

    // fixed snapshot for the whole batch; the root moves only in stage
    // four of some batch, always before anyone enters stage one of the
    // next.
    let root_word = root.load(Acquire);
    let root_level = unsafe { nref(root_word) }.to_level() as usize;

    // stage 1: descend to the owning leaves.
    let (beg, end) = util::partition(batch.len(), me.total, me.id);
    descend_to_leaf(policy, root_word, batch, beg, end, unsafe {
        &mut me.state_mut().paths
    });
    sync(workers, id, 0, root_level);

    // stage 2: leaves.
    redistribute(workers, id, 0);
    execute_on_leaves(workers, id, batch, node_size);
    sync(workers, id, 1, root_level);

    // stage 3: one round per branch level.
    let mut level = 1_usize;
    while level <= root_level {
        redistribute(workers, id, level);
        execute_on_branches(workers, id, level, node_size);
        level += 1;
        sync(workers, id, level, root_level);
        // recycle the buffer that the next round will fill.
        unsafe { me.state_mut() }.fences[level % 2].clear();
    }

    // stage 4: root.
    if id == 0 {
        handle_root_split(workers, root, root_level, node_size);
    }
    sync(workers, id, level + 1, root_level);
}

// the token relay. Channel `level` carries, besides synchronization, the
// first/last node each worker touched at that level, seeding the
// redistribution decision.
fn sync(workers: &[Worker], id: usize, level: usize, root_level: usize) {
    let me = &workers[id];
    let total = me.total;
    let idx = level;

    let mut set_first = false;
    let mut set_last = false;
    let mut their_first = 0_u64;
    let mut their_last = 0_u64;
    let mut my_first = 0_u64;
    let mut my_last = 0_u64;

    if id == 0 {
        set_first = true;
        their_last = MAGIC;
    }
    if id == total - 1 {
        set_last = true;
        their_first = MAGIC;
    }

    // above the root this is a pure rendezvous, no node info flows.
    if level <= root_level {
        let state = unsafe { me.state() };
        if level == 0 {
            if let (Some(first), Some(last)) = (state.paths.first(), state.paths.last()) {
                my_first = first.node_at_level(0);
                my_last = last.node_at_level(0);
            }
        } else {
            let fences = &state.fences[(level - 1) % 2];
            if let (Some(first), Some(last)) = (fences.first(), fences.last()) {
                my_first = first.path.node_at_level(level);
                my_last = last.path.node_at_level(level);
            }
        }
        // a worker whose whole share lands on a single node cannot claim
        // it against its left neighbor; worker zero owns everything it
        // touches.
        if id > 0 && my_first == my_last {
            my_first = 0;
        }
    }

    while !(set_first && set_last && their_first != 0 && their_last != 0) {
        if my_first != 0 && !set_first {
            workers[id - 1].first[idx].store(my_first, Release);
            set_first = true;
        }
        if my_last != 0 && !set_last {
            workers[id + 1].last[idx].store(my_last, Release);
            set_last = true;
        }
        if their_first == 0 {
            their_first = me.first[idx].load(Acquire);
        }
        if their_first != 0 && my_first == 0 {
            my_first = their_first;
        }
        if their_last == 0 {
            their_last = me.last[idx].load(Acquire);
        }
        if their_last != 0 && my_last == 0 {
            my_last = their_last;
        }
    }

    // this channel is done for the batch, clear the inbox for the next.
    me.first[idx].store(0, Relaxed);
    me.last[idx].store(0, Relaxed);

    let state = unsafe { me.state_mut() };
    state.their_last = their_last;
    state.my_last = my_last;
}

// decide which contiguous run of paths (level 0) or fences (level > 0)
// this worker owns: drop the head if the left neighbor's last node is
// ours too, then claim every run in the successors that still lands on
// our last node.
fn redistribute(workers: &[Worker], id: usize, level: usize) {
    let me = &workers[id];
    let (their_last, my_last) = {
        let state = unsafe { me.state() };
        (state.their_last, state.my_last)
    };

    if level == 0 {
        let n_paths = unsafe { me.state() }.paths.len();
        if n_paths == 0 {
            unsafe { me.state_mut() }.tot_path = 0;
            return;
        }

        let beg = if their_last != MAGIC {
            let state = unsafe { me.state() };
            let mut beg = n_paths;
            for (i, path) in state.paths.iter().enumerate() {
                if path.node_at_level(0) != their_last {
                    beg = i;
                    break;
                }
            }
            beg
        } else {
            0
        };

        let mut tot = n_paths - beg;
        if tot > 0 {
            'claim: for w in workers[id + 1..].iter() {
                let next_state = unsafe { w.state() };
                if next_state.paths.is_empty() {
                    break;
                }
                for path in next_state.paths.iter() {
                    if path.node_at_level(0) != my_last {
                        break 'claim;
                    }
                    tot += 1;
                }
            }
        }

        let state = unsafe { me.state_mut() };
        state.beg_path = beg;
        state.tot_path = tot;
    } else {
        let parity = (level - 1) % 2;
        let n_fences = unsafe { me.state() }.fences[parity].len();
        if n_fences == 0 {
            unsafe { me.state_mut() }.tot_fence = 0;
            return;
        }

        let beg = if their_last != MAGIC {
            let state = unsafe { me.state() };
            let mut beg = n_fences;
            for (i, fence) in state.fences[parity].iter().enumerate() {
                if fence.path.node_at_level(level) != their_last {
                    beg = i;
                    break;
                }
            }
            beg
        } else {
            0
        };

        let mut tot = n_fences - beg;
        if tot > 0 {
            'claim: for w in workers[id + 1..].iter() {
                let next_state = unsafe { w.state() };
                for fence in next_state.fences[parity].iter() {
                    if fence.path.node_at_level(level) != my_last {
                        break 'claim;
                    }
                    tot += 1;
                }
            }
        }

        let state = unsafe { me.state_mut() };
        state.beg_fence = beg;
        state.tot_fence = tot;
    }
}

// materialize this worker's owned run, which may spill into successors.
fn collect_paths(workers: &[Worker], id: usize) -> Vec<Path> {
    let me_state = unsafe { workers[id].state() };
    let mut remaining = me_state.tot_path;
    let mut out = Vec::with_capacity(remaining);

    let mut widx = id;
    let mut offset = me_state.beg_path;
    while remaining > 0 {
        let state = unsafe { workers[widx].state() };
        while offset < state.paths.len() && remaining > 0 {
            out.push(state.paths[offset].clone());
            offset += 1;
            remaining -= 1;
        }
        widx += 1;
        offset = 0;
    }
    out
}

fn collect_fences(workers: &[Worker], id: usize, level: usize) -> Vec<Fence> {
    let parity = (level - 1) % 2;
    let me_state = unsafe { workers[id].state() };
    let mut remaining = me_state.tot_fence;
    let mut out = Vec::with_capacity(remaining);

    let mut widx = id;
    let mut offset = me_state.beg_fence;
    while remaining > 0 {
        let state = unsafe { workers[widx].state() };
        let fences = &state.fences[parity];
        while offset < fences.len() && remaining > 0 {
            out.push(fences[offset].clone());
            offset += 1;
            remaining -= 1;
        }
        widx += 1;
        offset = 0;
    }
    out
}

// keep a worker's fence list sorted by separator key; returns the
// insertion position.
fn insert_fence(fences: &mut Vec<Fence>, fence: Fence) -> usize {
    let mut at = fences.len();
    for (i, f) in fences.iter().enumerate() {
        if f.key > fence.key {
            at = i;
            break;
        }
    }
    fences.insert(at, fence);
    at
}

fn fence_after(fences: &[Fence], at: usize) -> Option<(Vec<u8>, u64)> {
    fences.get(at + 1).map(|f| (f.key.clone(), f.ptr))
}

// stage 2 proper: apply every owned path to its leaf, serially.
fn execute_on_leaves(workers: &[Worker], id: usize, batch: &Batch, node_size: usize) {
    let paths = collect_paths(workers, id);
    let state = unsafe { workers[id].state_mut() };

    let mut prev_leaf = 0_u64;
    let mut curr = 0_u64;
    // fence boundary active for the leaf being worked on.
    let mut pending: Option<(Vec<u8>, u64)> = None;

    for path in paths.iter() {
        let leaf = path.node_at_level(0);
        let (op, key, value) = batch.sorted_at(path.kv);

        if leaf != prev_leaf {
            curr = leaf;
            pending = None;
        } else if let Some((fkey, fptr)) = &pending {
            if key >= fkey.as_slice() {
                curr = *fptr;
                pending = None;
            }
        }

        match op {
            Op::Write => {
                let res = unsafe { nmut(curr) }.insert(key, value);
                match res {
                    NodeWr::Inserted => batch.set_result(path.kv, 1),
                    NodeWr::Duplicate => batch.set_result(path.kv, 0),
                    NodeWr::NoSpace => {
                        let node = unsafe { nmut(curr) };
                        let new_word = new_node_word(Kind::Leaf, 0, node_size);

                        // a key extending the right edge of the leaf gets
                        // a bare one-key sibling instead of a split; the
                        // sopt bit keeps runs of those bounded.
                        let (fkey, move_right) = match node.is_before_key(key) {
                            Some(flen) if !node.is_sopt() => {
                                node.set_sopt(true);
                                (key[..flen].to_vec(), true)
                            }
                            _ => {
                                node.set_sopt(false);
                                let fkey = node.split_into(unsafe { nmut(new_word) });
                                let move_right = key >= fkey.as_slice();
                                (fkey, move_right)
                            }
                        };

                        let new = unsafe { nmut(new_word) };
                        new.set_next(node.to_next());
                        node.set_next(new_word);

                        let fence =
                            Fence { path: path.clone(), key: fkey.clone(), ptr: new_word };
                        let at = insert_fence(&mut state.fences[0], fence);

                        if move_right {
                            curr = new_word;
                            pending = fence_after(&state.fences[0], at);
                        } else {
                            pending = Some((fkey, new_word));
                        }

                        match unsafe { nmut(curr) }.insert(key, value) {
                            NodeWr::Inserted => batch.set_result(path.kv, 1),
                            res => unreachable!("post-split insert {:?}", res),
                        }
                    }
                }
            }
            Op::Read => {
                let found = unsafe { nref(curr) }.search(key).unwrap_or(0);
                batch.set_result(path.kv, found);
            }
        }

        prev_leaf = leaf;
    }
}

// stage 3 proper: insert every owned fence into its parent at `level`,
// recording any further splits for the next round.
fn execute_on_branches(workers: &[Worker], id: usize, level: usize, node_size: usize) {
    let fences = collect_fences(workers, id, level);
    let state = unsafe { workers[id].state_mut() };
    let out_parity = level % 2;

    let mut prev_node = 0_u64;
    let mut curr = 0_u64;
    let mut pending: Option<(Vec<u8>, u64)> = None;

    for fence in fences.iter() {
        let parent = fence.path.node_at_level(level);
        let (key, value) = (&fence.key, fence.ptr);

        if parent != prev_node {
            curr = parent;
            pending = None;
        } else if let Some((fkey, fptr)) = &pending {
            if key.as_slice() >= fkey.as_slice() {
                curr = *fptr;
                pending = None;
            }
        }

        let res = unsafe { nmut(curr) }.insert(key, value);
        match res {
            NodeWr::Inserted => (),
            NodeWr::Duplicate => unreachable!("duplicate separator"),
            NodeWr::NoSpace => {
                let node = unsafe { nmut(curr) };
                let new_word = new_node_word(Kind::Branch, level as u8, node_size);
                let fkey = node.split_into(unsafe { nmut(new_word) });

                let new = unsafe { nmut(new_word) };
                new.set_next(node.to_next());
                node.set_next(new_word);

                let up = Fence { path: fence.path.clone(), key: fkey.clone(), ptr: new_word };
                let at = insert_fence(&mut state.fences[out_parity], up);

                if key.as_slice() >= fkey.as_slice() {
                    curr = new_word;
                    pending = fence_after(&state.fences[out_parity], at);
                } else {
                    pending = Some((fkey, new_word));
                }

                match unsafe { nmut(curr) }.insert(key, value) {
                    NodeWr::Inserted => (),
                    res => unreachable!("post-split separator insert {:?}", res),
                }
            }
        }

        prev_node = parent;
    }
}

// stage 4: worker zero folds root-level fences from the whole pool into
// a fresh root.
fn handle_root_split(workers: &[Worker], root: &AtomicU64, root_level: usize, node_size: usize) {
    let parity = root_level % 2;

    let mut all: Vec<Fence> = vec![];
    for w in workers.iter() {
        all.extend(unsafe { w.state() }.fences[parity].iter().cloned());
    }
    if all.is_empty() {
        return;
    }
    all.sort_by(|a, b| a.key.cmp(&b.key));

    let old_word = root.load(Relaxed);
    let old = unsafe { nmut(old_word) };

    let new_word = new_node_word(Kind::Root, root_level as u8 + 1, node_size);
    let new_root = unsafe { nmut(new_word) };
    new_root.set_first(old_word);
    for fence in all.into_iter() {
        match new_root.insert(&fence.key, fence.ptr) {
            NodeWr::Inserted => (),
            res => unreachable!("root fence insert {:?}", res),
        }
    }

    old.set_kind(if root_level == 0 { Kind::Leaf } else { Kind::Branch });
    root.store(new_word, Release);
    log::debug!(target: "palm", "grew root to level {}", root_level + 1);
}

// ---- stage 1 descent policies; all three land every path on the same
// leaf, they only differ in traversal order.

fn descend_to_leaf(
    policy: Descend,
    root_word: u64,
    batch: &Batch,
    beg: usize,
    end: usize,
    paths: &mut Vec<Path>,
) {
    if beg == end {
        return;
    }
    for kv in beg..end {
        paths.push(Path::new(kv));
    }

    match policy {
        Descend::Lazy => {
            descend_single(root_word, batch, beg, beg, paths);
            if end - beg > 1 {
                descend_single(root_word, batch, end - 1, beg, paths);
                descend_range(root_word, batch, beg, end - 1, beg, paths);
            }
        }
        Descend::Level => {
            let root_level = unsafe { nref(root_word) }.to_level() as usize;
            for path in paths.iter_mut() {
                path.push(root_word);
            }
            for _ in 0..root_level {
                for path in paths.iter_mut() {
                    let (_, key, _) = batch.sorted_at(path.kv);
                    let child = unsafe { nref(path.top()) }.descend(key);
                    path.push(child);
                }
            }
        }
        Descend::Zigzag => {
            let root_level = unsafe { nref(root_word) }.to_level() as usize;
            for path in paths.iter_mut() {
                path.push(root_word);
            }
            // finish level 0 left-to-right for locality.
            let mut ltr = root_level % 2 == 0;
            for _ in 0..root_level {
                let idxs: Vec<usize> = if ltr {
                    (0..paths.len()).collect()
                } else {
                    (0..paths.len()).rev().collect()
                };
                for i in idxs {
                    let (_, key, _) = batch.sorted_at(paths[i].kv);
                    let child = unsafe { nref(paths[i].top()) }.descend(key);
                    paths[i].push(child);
                }
                ltr = !ltr;
            }
        }
    }
}

// full root-to-leaf walk for the entry at sorted position `kv`.
fn descend_single(root_word: u64, batch: &Batch, kv: usize, beg: usize, paths: &mut [Path]) {
    let (_, key, _) = batch.sorted_at(kv);

    let mut curr = root_word;
    let mut level = unsafe { nref(curr) }.to_level();
    let path = &mut paths[kv - beg];
    loop {
        path.push(curr);
        if level == 0 {
            break;
        }
        curr = unsafe { nref(curr) }.descend(key);
        level -= 1;
    }
}

// sorted keys sharing the boundary leaves of `(kbeg, kend)` share the
// whole descent; recurse only where the boundaries disagree.
fn descend_range(
    root_word: u64,
    batch: &Batch,
    kbeg: usize,
    kend: usize,
    beg: usize,
    paths: &mut [Path],
) {
    if kbeg + 1 >= kend {
        return;
    }

    let left = paths[kbeg - beg].node_at_level(0);
    let right = paths[kend - beg].node_at_level(0);
    if left != right {
        let kmid = (kbeg + kend) / 2;
        descend_single(root_word, batch, kmid, beg, paths);
        descend_range(root_word, batch, kbeg, kmid, beg, paths);
        descend_range(root_word, batch, kmid, kend, beg, paths);
    } else {
        let src = paths[kbeg - beg].clone();
        for i in kbeg + 1..kend {
            paths[i - beg].copy_nodes(&src);
        }
    }
}
