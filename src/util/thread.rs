//! Module `thread` implement a minimal multi-threading pattern.
//!
//! Every thread holds onto its own state and communicates with the rest of
//! the system through shared-memory hand-offs owned by the caller, there are
//! no per-thread channels here. [Thread] wraps the join-handle so that no
//! routine is left dangling.

use log::error;

use std::thread;

use crate::{Error, Result};

/// Thread type, wrapping a named thread routine.
///
/// NOTE: When a Thread value is dropped, it is made sure that there are no
/// dangling thread routines. The routine's main loop is expected to exit on
/// its own accord, typically by observing a shutdown flag on the shared
/// state it was spawned with.
pub struct Thread<T> {
    name: String,
    inner: Option<Inner<T>>,
}

struct Inner<T> {
    handle: thread::JoinHandle<T>,
}

impl<T> Inner<T> {
    fn join(self) -> Result<T> {
        match self.handle.join() {
            Ok(val) => Ok(val),
            Err(err) => err_at!(ThreadFail, msg: "fail {:?}", err),
        }
    }
}

impl<T> Drop for Thread<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            if inner.join().is_err() {
                error!(target: "thread", "dropping {:?}, join failed", self.name);
            }
        }
    }
}

impl<T> Thread<T> {
    /// Create a new Thread instance. `main_loop` shall be spawned with
    /// `name` attached to the routine.
    pub fn new<F>(name: &str, main_loop: F) -> Result<Thread<T>>
    where
        F: 'static + Send + FnOnce() -> T,
        T: 'static + Send,
    {
        let builder = thread::Builder::new().name(name.to_string());
        let handle = err_at!(ThreadFail, builder.spawn(main_loop))?;

        let val = Thread {
            name: name.to_string(),
            inner: Some(Inner { handle }),
        };

        Ok(val)
    }

    /// Return name of this thread.
    pub fn to_name(&self) -> String {
        self.name.to_string()
    }

    /// Recommended way to exit/shutdown the thread. Note that the thread's
    /// main loop must already be on its way out, or soon will be, for this
    /// call to return.
    ///
    /// Even otherwise, when Thread value goes out of scope its drop
    /// implementation shall call this method to exit the thread, except
    /// that any errors are ignored.
    pub fn join(mut self) -> Result<T> {
        self.inner.take().unwrap().join()
    }
}
