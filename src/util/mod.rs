//! Module implement common utility functions and types.

use crate::{Error, Result};

pub mod queue;
pub mod thread;

pub use queue::BoundedQueue;
pub use thread::Thread;

/// Validate a key at the API boundary. Zero length keys and keys longer
/// than the configured ceiling are rejected.
pub fn validate_key(key: &[u8], max_key_size: usize) -> Result<()> {
    if key.is_empty() {
        err_at!(InvalidInput, msg: "empty key")
    } else if key.len() > max_key_size {
        err_at!(InvalidInput, msg: "key length {} exceeds {}", key.len(), max_key_size)
    } else {
        Ok(())
    }
}

/// Compute the `[beg, end)` span of `m` items that member `id` out of
/// `total` members shall process. Spans are `ceil(m / total)` wide, members
/// at the tail may get a short or empty span.
pub fn partition(m: usize, total: usize, id: usize) -> (usize, usize) {
    assert!(total > 0 && id < total);

    let part = (m + total - 1) / total;
    let beg = std::cmp::min(id * part, m);
    let end = std::cmp::min(beg + part, m);
    (beg, end)
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
