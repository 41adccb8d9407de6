use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::errors::{HaError, LockError, Result};
use crate::lock::{AffineLock, Interrupt, POLL_INTERVAL};

/// A non-reentrant lock owned by the thread that acquired it.
#[derive(Debug, Default)]
pub struct ThreadOwnedLock {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl ThreadOwnedLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self) -> bool {
        self.owner.lock().is_some()
    }

    pub fn owner(&self) -> Option<ThreadId> {
        *self.owner.lock()
    }

    /// Waits for the lock until `deadline`, watching `interrupt`.
    fn acquire(&self, deadline: Option<Instant>, interrupt: &Interrupt) -> Result<bool> {
        let mut owner = self.owner.lock();
        loop {
            if interrupt.is_interrupted() {
                return Err(HaError::Interrupted);
            }
            if owner.is_none() {
                *owner = Some(thread::current().id());
                return Ok(true);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    POLL_INTERVAL.min(deadline - now)
                }
                None => POLL_INTERVAL,
            };
            self.released.wait_for(&mut owner, slice);
        }
    }
}

impl AffineLock for ThreadOwnedLock {
    fn lock(&self) {
        let mut owner = self.owner.lock();
        while owner.is_some() {
            self.released.wait(&mut owner);
        }
        *owner = Some(thread::current().id());
    }

    fn lock_interruptibly(&self, interrupt: &Interrupt) -> Result<()> {
        self.acquire(None, interrupt).map(|_| ())
    }

    fn try_lock(&self) -> bool {
        let mut owner = self.owner.lock();
        if owner.is_some() {
            return false;
        }
        *owner = Some(thread::current().id());
        true
    }

    fn try_lock_for(&self, timeout: Duration, interrupt: &Interrupt) -> Result<bool> {
        self.acquire(Some(Instant::now() + timeout), interrupt)
    }

    fn unlock(&self) -> std::result::Result<(), LockError> {
        let mut owner = self.owner.lock();
        match *owner {
            Some(id) if id == thread::current().id() => {
                *owner = None;
                // A woken waiter may give up on interrupt or timeout, so
                // every waiter gets the chance to take the lock.
                self.released.notify_all();
                Ok(())
            }
            Some(_) => Err(LockError::NotOwner),
            None => Err(LockError::NotHeld),
        }
    }
}
