use std::sync::{Mutex, PoisonError};
use std::thread::{self, ThreadId};

use tracing::warn;

/// Advisory thread-affinity check.
///
/// Binds to the first thread that calls [`ThreadChecker::check`] and warns
/// whenever another thread calls in. Never panics.
#[derive(Debug)]
pub struct ThreadChecker {
    name: &'static str,
    owner: Mutex<Option<ThreadId>>,
}

impl ThreadChecker {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            owner: Mutex::new(None),
        }
    }

    /// `true` if called on the bound thread
    pub fn check(&self, operation: &str) -> bool {
        let current = thread::current();
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        match *owner {
            None => {
                *owner = Some(current.id());
                true
            }
            Some(id) if id == current.id() => true,
            Some(_) => {
                warn!(
                    checker = self.name,
                    operation,
                    thread = current.name().unwrap_or("<unnamed>"),
                    "Called from unexpected thread"
                );
                false
            }
        }
    }

    /// Rebind to whichever thread calls next
    pub fn detach(&self) {
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
