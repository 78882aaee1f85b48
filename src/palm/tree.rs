//! Module `tree` implement the palm engine: worker pool, submission
//! buffer and the tree handle.

use log::debug;

use std::sync::{
    atomic::{AtomicU64, Ordering::{Acquire, Relaxed, Release}},
    Arc,
};

use crate::{
    node::Kind,
    palm::{
        batch::Batch,
        worker::{self, Worker},
    },
    util::{BoundedQueue, Thread},
    Config, Error, Result,
};

/// Hard ceiling on the worker pool; a batched tree gains nothing from
/// more lanes than memory bandwidth feeds.
pub const MAX_WORKERS: usize = 8;

/// Stage-one traversal strategy. All three produce identical trees and
/// results, they only trade off cache behavior.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Descend {
    /// Walk the boundaries of a run and share the path when both ends
    /// land in the same leaf. Excellent for sequential keys.
    Lazy,
    /// Advance every operation one level, then the next.
    Level,
    /// Like Level, alternating direction per level.
    Zigzag,
}

impl Default for Descend {
    fn default() -> Descend {
        Descend::Lazy
    }
}

/// Tree type applying whole batches of operations across a worker pool.
///
/// Submit with [Tree::execute], wait with [Tree::flush], then read the
/// results out of the batch. Results land in the batch's own cells, so
/// keep the [Arc<Batch>] handle around.
pub struct Tree {
    inner: Arc<Inner>,
    threads: Vec<Thread<()>>,
}

struct Inner {
    name: String,
    config: Config,
    policy: Descend,
    root: AtomicU64,
    workers: Vec<Worker>,
    queue: BoundedQueue<Batch>,
}

impl Drop for Tree {
    fn drop(&mut self) {
        // wake and retire the pool before the threads are joined; any
        // in-flight batch completes all four stages first.
        self.inner.queue.clear();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // walk levels top down, freeing each sibling chain left to
        // right.
        let mut word = self.root.load(Relaxed);
        while word != 0 {
            let top = unsafe { worker::nref(word) };
            let below = if top.to_level() > 0 { top.to_first() } else { 0 };

            let mut w = word;
            while w != 0 {
                let boxed = unsafe { Box::from_raw(w as *mut crate::node::Node) };
                w = boxed.to_next();
            }
            word = below;
        }
    }
}

impl Tree {
    /// Create an engine with `worker_count` workers (clamped to
    /// [MAX_WORKERS] and the core count) over a submission buffer of
    /// `queue_depth` slots.
    pub fn new(
        name: &str,
        config: Config,
        worker_count: usize,
        queue_depth: usize,
        policy: Descend,
    ) -> Result<Tree> {
        let config = config.into_clamped();
        let total = worker_count.max(1).min(MAX_WORKERS).min(num_cpus::get().max(1));

        let root = worker::new_node_word(Kind::Root, 0, config.node_size);
        let workers = (0..total).map(|id| Worker::new(id, total)).collect();

        let inner = Arc::new(Inner {
            name: name.to_string(),
            config,
            policy,
            root: AtomicU64::new(root),
            workers,
            queue: BoundedQueue::new(queue_depth),
        });

        let mut threads = vec![];
        for id in 0..total {
            let inner = Arc::clone(&inner);
            let thread_name = format!("{}-worker-{}", name, id);
            threads.push(Thread::new(&thread_name, move || worker_loop(inner, id))?);
        }

        debug!(target: "palm", "{:?} engine with {} workers", name, total);
        Ok(Tree { inner, threads })
    }

    /// Return name of this engine instance.
    pub fn to_name(&self) -> String {
        self.inner.name.clone()
    }

    /// Return a batch builder budgeted by this engine's configuration.
    pub fn new_batch(&self) -> Batch {
        Batch::new(&self.inner.config)
    }

    /// Enqueue `batch` for execution; returns immediately. The pool
    /// fills the batch's result cells in place.
    pub fn execute(&self, batch: Arc<Batch>) {
        self.inner.queue.enqueue(batch)
    }

    /// Block until every submitted batch has completed all four stages.
    pub fn flush(&self) {
        self.inner.queue.wait_empty()
    }

    /// Shut the engine down, waiting for in-flight batches and joining
    /// the pool.
    pub fn close(mut self) -> Result<()> {
        self.inner.queue.clear();
        for thread in self.threads.drain(..) {
            thread.join()?;
        }
        Ok(())
    }

    /// Number of reachable entries. Require: no batch in flight.
    pub fn count(&self) -> usize {
        let mut word = self.inner.root.load(Acquire);
        while unsafe { worker::nref(word) }.to_level() > 0 {
            word = unsafe { worker::nref(word) }.to_first();
        }

        let mut count = 0;
        while word != 0 {
            let node = unsafe { worker::nref(word) };
            count += node.len();
            word = node.to_next();
        }
        count
    }

    /// Verify tree invariants on every level: per-node ordering, sibling
    /// chain ordering and separator coverage. Require: no batch in
    /// flight.
    pub fn validate(&self) -> Result<()> {
        let mut word = self.inner.root.load(Acquire);
        loop {
            let top = unsafe { worker::nref(word) };
            let below = if top.to_level() > 0 { top.to_first() } else { 0 };

            let mut w = word;
            while w != 0 {
                let node = unsafe { worker::nref(w) };
                node.validate()?;

                let next = node.to_next();
                if next != 0 && !node.is_empty() {
                    let sibling = unsafe { worker::nref(next) };
                    if !sibling.is_empty() {
                        let (last, _) = node.entry_at(node.len() - 1);
                        let (low, _) = sibling.entry_at(0);
                        if last >= low {
                            err_at!(Fatal, msg: "sibling chain unordered at {}", node.to_id())?;
                        }
                    }
                }

                if node.to_level() > 0 {
                    // every separator key leads a child whose keys are
                    // all at or above it.
                    for i in 0..node.len() {
                        let (sep, child_word) = node.entry_at(i);
                        let child = unsafe { worker::nref(child_word) };
                        if !child.is_empty() {
                            let (low, _) = child.entry_at(0);
                            if low < sep {
                                err_at!(Fatal, msg: "child under-runs separator")?;
                            }
                        }
                    }
                }
                w = next;
            }

            if below == 0 {
                break;
            }
            word = below;
        }
        Ok(())
    }
}

fn worker_loop(inner: Arc<Inner>, id: usize) {
    let mut cursor = 0;
    loop {
        match inner.queue.peek_at(&mut cursor) {
            Some(batch) => {
                worker::execute_batch(
                    &inner.workers,
                    id,
                    &batch,
                    &inner.root,
                    inner.config.node_size,
                    inner.policy,
                );
                // worker zero retires the batch for the whole pool.
                if id == 0 {
                    inner.queue.dequeue();
                }
            }
            None => break,
        }
    }
    debug!(target: "palm", "{:?} worker {} exits", inner.name, id);
}

#[cfg(test)]
#[path = "tree_test.rs"]
mod tree_test;
