//! Locks whose acquire and release may happen on different threads.
//!
//! Some locks only accept a release from the thread that acquired them.
//! [`CrossThreadLock`] wraps such a lock and performs every operation on it
//! from one dedicated owner thread, so callers may acquire on one thread and
//! release on another.

mod adapter;
mod thread_owned;

pub use adapter::CrossThreadLock;
pub use thread_owned::ThreadOwnedLock;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::errors::{LockError, Result};

/// Granularity of interruptible waits.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A request to abandon an interruptible wait.
///
/// Clones share one flag. Interrupting wakes every interruptible wait that
/// watches the flag within [`POLL_INTERVAL`].
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Lifecycle of a [`CrossThreadLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Acquiring,
    Held,
    Releasing,
}

/// A mutual-exclusion lock that must be released by the thread that
/// acquired it.
pub trait AffineLock: Send + Sync + 'static {
    /// Blocks until the lock is acquired.
    fn lock(&self);

    /// Blocks until the lock is acquired or `interrupt` is raised.
    ///
    /// # Errors
    ///
    /// Returns `HaError::Interrupted` if interrupted; the lock is not held.
    fn lock_interruptibly(&self, interrupt: &Interrupt) -> Result<()>;

    /// Acquires the lock if it is free.
    fn try_lock(&self) -> bool;

    /// Waits up to `timeout` for the lock.
    ///
    /// # Errors
    ///
    /// Returns `HaError::Interrupted` if interrupted; the lock is not held.
    fn try_lock_for(&self, timeout: Duration, interrupt: &Interrupt) -> Result<bool>;

    /// Releases the lock.
    ///
    /// # Errors
    ///
    /// `LockError::NotOwner` when called from a thread that does not hold
    /// the lock, `LockError::NotHeld` when nobody holds it.
    fn unlock(&self) -> std::result::Result<(), LockError>;
}
