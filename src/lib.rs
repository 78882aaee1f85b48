//! Package implement a collection of concurrent, in-memory, ordered index
//! structures for key,value storage engines.
//!
//! Indexes are built over byte-string keys and machine-word values. Every
//! index family shares the same storage vocabulary, an ordered slab
//! [node][node] and a [version word][version] that lets readers proceed
//! without latches, but each family arranges them differently:
//!
//! * [blink] implement a concurrent B+ tree with right-sibling links,
//!   latch-coupling writers and latch-free readers.
//! * [mass] implement a trie of B+ trees keyed by 8-byte key slices,
//!   after the Masstree design.
//! * [art] implement an adaptive radix tree with node fan-outs of
//!   4/16/48/256 and prefix-expand concurrency.
//! * [palm] implement a bulk-synchronous B+ tree that applies a whole
//!   batch of operations in four barrier-separated stages across a
//!   worker pool.
//!
//! The first three families execute each operation on the caller's thread.
//! The palm family packs operations into a [palm::Batch], submits it to a
//! bounded queue and lets the worker pool apply it in lock-step.
//!
//! **Concurrency model**
//!
//! Writers acquire a per-node spin latch by CAS-ing the lock bit of the
//! node's version word. Structural changes flip the insert/split bits while
//! the latch is held; releasing the latch folds them into the vinsert/vsplit
//! counters. Readers snapshot a stable version, do their lookup and
//! re-validate; a changed vsplit restarts from the root, a changed vinsert
//! retries the node. Refer to [version] for the exact word layout.
//!
//! Keys must be 1 to [MAX_KEY_SIZE] bytes, anything else is rejected at the
//! API boundary with [Error::InvalidInput]. Duplicate keys are not an error,
//! they are reported through [Wr::Duplicate].

use serde::{Deserialize, Serialize};

use std::{error, fmt, result};

/// Short form to compose Error values.
///
/// Here are few possible ways:
///
/// ```ignore
/// use crate::Error;
/// err_at!(Fatal, msg: "failure {}", args);
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(Fatal, std::io::read(buf));
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(Fatal, std::fs::read(file_path), "read failed");
/// ```
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err(Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err(Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err(Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

pub mod art;
pub mod blink;
pub mod mass;
pub mod node;
pub mod palm;
pub mod util;
pub mod version;

/// Type alias for Result return type, used by this package.
pub type Result<T> = result::Result<T, Error>;

/// Error variants that can be returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the
/// error location.
pub enum Error {
    Fatal(String, String),
    FailConvert(String, String),
    InvalidInput(String, String),
    ThreadFail(String, String),
    IPCFail(String, String),
    Shutdown(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            Fatal(p, msg) => write!(f, "{} Fatal: {}", p, msg),
            FailConvert(p, msg) => write!(f, "{} FailConvert: {}", p, msg),
            InvalidInput(p, msg) => write!(f, "{} InvalidInput: {}", p, msg),
            ThreadFail(p, msg) => write!(f, "{} ThreadFail: {}", p, msg),
            IPCFail(p, msg) => write!(f, "{} IPCFail: {}", p, msg),
            Shutdown(p, msg) => write!(f, "{} Shutdown: {}", p, msg),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl error::Error for Error {}

/// Minimum size for an index node, 4KB.
pub const NODE_MIN_SIZE: usize = 4 * 1024;
/// Maximum size for an index node, 64KB. Offsets within a node are
/// encoded in 16-bits.
pub const NODE_MAX_SIZE: usize = 64 * 1024;
/// Maximum size for a key, key-length is encoded in a single byte.
pub const MAX_KEY_SIZE: usize = 255;

// node sizes are rounded down to a multiple of 4KB.
const NODE_SIZE_MASK: usize = !0xfff;

/// Result code for all write operations into an index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Wr {
    /// Key was not present, a new entry is created.
    Inserted,
    /// Key already present, index is left untouched.
    Duplicate,
}

/// Configuration for building an index instance.
///
/// There is no process wide configuration, every index carries its own
/// copy of this type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, arbitrary::Arbitrary)]
#[serde(default)]
pub struct Config {
    /// Size of an index node, in bytes, clamped to
    /// [NODE_MIN_SIZE]..=[NODE_MAX_SIZE] and rounded down to a multiple
    /// of 4KB.
    ///
    /// Default: [NODE_MIN_SIZE]
    pub node_size: usize,
    /// Size of a palm batch, in bytes, clamped the same way as `node_size`.
    ///
    /// Default: [NODE_MIN_SIZE]
    pub batch_size: usize,
    /// Ceiling on key length accepted by the index, capped at
    /// [MAX_KEY_SIZE].
    ///
    /// Default: [MAX_KEY_SIZE]
    pub max_key_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            node_size: NODE_MIN_SIZE,
            batch_size: NODE_MIN_SIZE,
            max_key_size: MAX_KEY_SIZE,
        }
    }
}

impl Config {
    /// Create a configuration with default values, use the `set_*` methods
    /// to add more configuration.
    pub fn new() -> Config {
        Config::default()
    }

    /// Parse configuration from toml text, values are clamped to their
    /// legal ranges.
    pub fn from_toml_str(text: &str) -> Result<Config> {
        let config: Config = err_at!(InvalidInput, toml::from_str(text))?;
        Ok(config.into_clamped())
    }

    /// Configure node size, in bytes.
    pub fn set_node_size(&mut self, size: usize) -> &mut Self {
        self.node_size = clamp_size(size);
        self
    }

    /// Configure batch size, in bytes.
    pub fn set_batch_size(&mut self, size: usize) -> &mut Self {
        self.batch_size = clamp_size(size);
        self
    }

    /// Configure the ceiling for key length, in bytes.
    pub fn set_max_key_size(&mut self, size: usize) -> &mut Self {
        self.max_key_size = if size == 0 {
            1
        } else if size > MAX_KEY_SIZE {
            MAX_KEY_SIZE
        } else {
            size
        };
        self
    }

    pub(crate) fn into_clamped(mut self) -> Config {
        let (node_size, batch_size, max_key_size) =
            (self.node_size, self.batch_size, self.max_key_size);
        self.set_node_size(node_size);
        self.set_batch_size(batch_size);
        self.set_max_key_size(max_key_size);
        self
    }
}

fn clamp_size(size: usize) -> usize {
    if size < NODE_MIN_SIZE {
        NODE_MIN_SIZE
    } else if size > NODE_MAX_SIZE {
        NODE_MAX_SIZE
    } else {
        size & NODE_SIZE_MASK
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod lib_test;
