//! Module `batch` implement the sorted operation buffer fed to the
//! worker pool.
//!
//! A batch keeps its operations sorted by key, duplicates preserved in
//! arrival order. The sort is what makes contiguous worker shares line
//! up with key ranges, so stage-one partitioning needs no coordination.
//! Result cells are atomic: distinct workers fill distinct entries while
//! the batch is shared across the pool.

use std::sync::atomic::{AtomicU64, Ordering::{Acquire, Release}};

use crate::{util, Config, Error, Result};

/// Operation kind carried by a batch entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Op {
    Read,
    Write,
}

struct Entry {
    op: Op,
    key: Vec<u8>,
    // write entries: input value, replaced by 1 (inserted) or 0
    // (duplicate). Read entries: filled with the value found, 0 when
    // missing.
    value: AtomicU64,
}

// per-entry slab accounting, mirroring the flat layout this buffer is
// budgeted for: op byte, length byte, key, value word, index slot.
fn entry_bytes(key: &[u8]) -> usize {
    1 + 1 + key.len() + 8 + 2
}

/// A sorted batch of read/write operations with in-place result cells.
pub struct Batch {
    max_key_size: usize,
    capacity: usize,
    used: usize,
    entries: Vec<Entry>,
    // arrival position -> sorted position and back.
    index: Vec<u32>,
}

impl Batch {
    /// Create an empty batch budgeted at `config.batch_size` bytes.
    pub fn new(config: &Config) -> Batch {
        let config = config.clone().into_clamped();
        Batch {
            max_key_size: config.max_key_size,
            capacity: config.batch_size,
            used: 0,
            entries: Vec::new(),
            index: Vec::new(),
        }
    }

    /// Number of operations in this batch.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget all operations, keeping the allocation for reuse.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.used = 0;
    }

    /// Append a write operation. Ok(false) means the batch is out of
    /// budget and must be submitted first.
    pub fn add_write(&mut self, key: &[u8], value: u64) -> Result<bool> {
        self.add(Op::Write, key, value)
    }

    /// Append a read operation; its result cell is filled in place when
    /// the batch executes.
    pub fn add_read(&mut self, key: &[u8]) -> Result<bool> {
        self.add(Op::Read, key, 0)
    }

    fn add(&mut self, op: Op, key: &[u8], value: u64) -> Result<bool> {
        util::validate_key(key, self.max_key_size)?;

        if self.used + entry_bytes(key) > self.capacity {
            return Ok(false);
        }
        self.used += entry_bytes(key);

        // stable on duplicates: equal keys keep arrival order.
        let mut low = 0_usize;
        let mut high = self.index.len();
        while low < high {
            let mid = (low + high) / 2;
            let at = self.index[mid] as usize;
            if self.entries[at].key.as_slice() <= key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        let at = self.entries.len() as u32;
        self.entries.push(Entry { op, key: key.to_vec(), value: AtomicU64::new(value) });
        self.index.insert(low, at);
        Ok(true)
    }

    /// Operation at arrival position `i`: kind, key and the current
    /// content of its result cell.
    pub fn read_at(&self, i: usize) -> Result<(Op, &[u8], u64)> {
        match self.entries.get(i) {
            Some(entry) => Ok((entry.op, &entry.key, entry.value.load(Acquire))),
            None => err_at!(InvalidInput, msg: "batch index {}/{}", i, self.entries.len()),
        }
    }

    // ---- worker-side view, sorted order.

    pub(crate) fn sorted_at(&self, i: usize) -> (Op, &[u8], u64) {
        let entry = &self.entries[self.index[i] as usize];
        (entry.op, &entry.key, entry.value.load(Acquire))
    }

    pub(crate) fn set_result(&self, i: usize, value: u64) {
        let entry = &self.entries[self.index[i] as usize];
        entry.value.store(value, Release);
    }
}

#[cfg(test)]
#[path = "batch_test.rs"]
mod batch_test;
