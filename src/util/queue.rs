//! Module `queue` implement a bounded producer/consumer buffer.
//!
//! [BoundedQueue] is the submission buffer between index front-ends and
//! their worker pool. Producers block while all slots are occupied.
//! Consumers walk the ring with a local cursor via [BoundedQueue::peek_at],
//! without releasing the slot; one designated consumer calls
//! [BoundedQueue::dequeue] once the whole pool is done with the head
//! element. This lets every consumer observe every element exactly once
//! while the buffer holds an element alive until it is fully processed.

use std::sync::{Arc, Condvar, Mutex};

/// A fixed-slot ring buffer with blocking producers and cursor-driven
/// consumers.
///
/// Capacity is clamped to 8 slots, a deeper submission buffer only adds
/// memory pressure without adding parallelism.
pub struct BoundedQueue<T> {
    mu: Mutex<Inner<T>>,
    cond: Condvar,
}

struct Inner<T> {
    slots: Vec<Option<Arc<T>>>,
    head: usize,
    tail: usize,
    size: usize,
    clear: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> BoundedQueue<T> {
        let capacity = capacity.max(1).min(8);

        let inner = Inner {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
            size: 0,
            clear: false,
        };

        BoundedQueue { mu: Mutex::new(inner), cond: Condvar::new() }
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.mu.lock().unwrap().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Place `item` in the next free slot, blocking while the ring is
    /// full. Items enqueued after [BoundedQueue::clear] are silently
    /// dropped, shutting down the buffer while producers are active is a
    /// caller bug.
    pub fn enqueue(&self, item: Arc<T>) {
        let mut inner = self.mu.lock().unwrap();
        loop {
            if inner.clear {
                return;
            }
            let tail = inner.tail;
            if inner.slots[tail].is_none() {
                inner.slots[tail] = Some(item);
                inner.tail = (tail + 1) % inner.slots.len();
                inner.size += 1;
                self.cond.notify_all();
                return;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Return the element at `cursor`, blocking until that slot is
    /// occupied or the buffer is cleared. The slot is not released; the
    /// cursor is advanced locally. Returns None once the buffer is
    /// cleared.
    pub fn peek_at(&self, cursor: &mut usize) -> Option<Arc<T>> {
        let mut inner = self.mu.lock().unwrap();
        loop {
            if let Some(item) = inner.slots[*cursor].as_ref() {
                let item = Arc::clone(item);
                *cursor = (*cursor + 1) % inner.slots.len();
                return Some(item);
            }
            if inner.clear {
                return None;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Release the head slot and wake producers. Must be called exactly
    /// once per enqueued element, after all consumers are done with it.
    pub fn dequeue(&self) {
        let mut inner = self.mu.lock().unwrap();

        let head = inner.head;
        assert!(inner.slots[head].is_some(), "dequeue on a free slot");

        inner.slots[head] = None;
        inner.head = (head + 1) % inner.slots.len();
        inner.size -= 1;

        self.cond.notify_all();
    }

    /// Mark the buffer for shutdown and wake all waiters. Blocks until
    /// occupied slots are drained, then consumers observe None from
    /// [BoundedQueue::peek_at].
    pub fn clear(&self) {
        let mut inner = self.mu.lock().unwrap();
        while inner.size > 0 {
            inner = self.cond.wait(inner).unwrap();
        }
        inner.clear = true;
        self.cond.notify_all();
    }

    /// Block until no occupied slot exists.
    pub fn wait_empty(&self) {
        let mut inner = self.mu.lock().unwrap();
        while inner.size > 0 {
            inner = self.cond.wait(inner).unwrap();
        }
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod queue_test;
