use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::errors::{HaError, LockError, Result};
use crate::lock::{AffineLock, Interrupt, LockState, POLL_INTERVAL};

/// Commands executed by the owner thread.
enum Command {
    Lock(Sender<Result<bool>>),
    LockInterruptibly(Interrupt, Sender<Result<bool>>),
    TryLock(Sender<Result<bool>>),
    TryLockFor(Duration, Interrupt, Sender<Result<bool>>),
    Unlock(Sender<std::result::Result<(), LockError>>),
}

/// Adapts a thread-affine lock so that any thread may release it.
///
/// Every operation on the wrapped lock runs on one owner thread owned by
/// the adapter; callers hand it commands over a channel and wait for the
/// reply. The adapter itself is a single-holder lock with no thread
/// affinity: whoever calls [`unlock`](Self::unlock) while it is held
/// releases it.
///
/// Dropping the adapter stops the owner thread, releasing the wrapped lock
/// if it is still held.
///
/// Condition variables are not supported: waiting on one would have to
/// release and reacquire the wrapped lock on the owner thread while the
/// caller blocks elsewhere.
pub struct CrossThreadLock<L: AffineLock> {
    lock: Arc<L>,
    state: Mutex<LockState>,
    changed: Condvar,
    commands: Sender<Command>,
}

impl<L: AffineLock> CrossThreadLock<L> {
    /// Wraps `lock` and starts its owner thread.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Spawn` if the owner thread cannot be started.
    pub fn new(lock: L) -> Result<Self> {
        let lock = Arc::new(lock);
        // One command is in flight at a time; the state machine gates the rest.
        let (commands, receiver) = bounded(1);
        let owned = Arc::clone(&lock);
        thread::Builder::new()
            .name("hadb-lock-owner".to_string())
            .spawn(move || run_owner(owned, receiver))
            .map_err(|e| LockError::Spawn(e.to_string()))?;

        Ok(Self {
            lock,
            state: Mutex::new(LockState::Idle),
            changed: Condvar::new(),
            commands,
        })
    }

    /// The wrapped lock.
    pub fn inner(&self) -> &L {
        &self.lock
    }

    pub fn state(&self) -> LockState {
        *self.state.lock()
    }

    /// Blocks until the adapter is acquired.
    ///
    /// # Errors
    ///
    /// Returns `LockError::OwnerGone` if the owner thread has stopped.
    pub fn lock(&self) -> Result<()> {
        let mut state = self.state.lock();
        while *state != LockState::Idle {
            self.changed.wait(&mut state);
        }
        self.acquire(state, Command::Lock).map(|_| ())
    }

    /// Blocks until the adapter is acquired or `interrupt` is raised.
    ///
    /// # Errors
    ///
    /// Returns `HaError::Interrupted` if interrupted; the adapter and the
    /// wrapped lock are left unheld.
    pub fn lock_interruptibly(&self, interrupt: &Interrupt) -> Result<()> {
        let mut state = self.state.lock();
        while *state != LockState::Idle {
            if interrupt.is_interrupted() {
                return Err(HaError::Interrupted);
            }
            self.changed.wait_for(&mut state, POLL_INTERVAL);
        }
        let interrupt = interrupt.clone();
        self.acquire(state, |reply| Command::LockInterruptibly(interrupt, reply))
            .map(|_| ())
    }

    /// Acquires the adapter if neither it nor the wrapped lock is held.
    pub fn try_lock(&self) -> Result<bool> {
        let state = self.state.lock();
        if *state != LockState::Idle {
            return Ok(false);
        }
        self.acquire(state, Command::TryLock)
    }

    /// Waits up to `timeout` for the adapter.
    ///
    /// Returns `Ok(false)` once the timeout elapses; a holder keeps the
    /// lock.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while *state != LockState::Idle {
            if self.changed.wait_until(&mut state, deadline).timed_out()
                && *state != LockState::Idle
            {
                return Ok(false);
            }
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.acquire(state, |reply| {
            Command::TryLockFor(remaining, Interrupt::new(), reply)
        })
    }

    /// Releases the adapter from any thread.
    ///
    /// Calling this while the adapter is not held does nothing.
    ///
    /// # Errors
    ///
    /// Propagates a failure of the wrapped lock's release; the adapter then
    /// stays held.
    pub fn unlock(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != LockState::Held {
            debug!("Ignoring unlock of lock in state {:?}", *state);
            return Ok(());
        }
        self.transition(&mut state, LockState::Releasing);
        drop(state);

        let (reply, response) = bounded(1);
        let result = match self.commands.send(Command::Unlock(reply)) {
            Ok(()) => response.recv().unwrap_or(Err(LockError::OwnerGone)),
            Err(_) => Err(LockError::OwnerGone),
        };

        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                self.transition(&mut state, LockState::Idle);
                Ok(())
            }
            Err(LockError::OwnerGone) => {
                self.transition(&mut state, LockState::Idle);
                Err(LockError::OwnerGone.into())
            }
            Err(e) => {
                self.transition(&mut state, LockState::Held);
                Err(e.into())
            }
        }
    }

    /// Runs one acquisition on the owner thread. `state` must be `Idle`.
    fn acquire<F>(&self, mut state: MutexGuard<'_, LockState>, command: F) -> Result<bool>
    where
        F: FnOnce(Sender<Result<bool>>) -> Command,
    {
        self.transition(&mut state, LockState::Acquiring);
        drop(state);

        let (reply, response) = bounded(1);
        let outcome = match self.commands.send(command(reply)) {
            Ok(()) => response.recv().unwrap_or(Err(LockError::OwnerGone.into())),
            Err(_) => Err(LockError::OwnerGone.into()),
        };

        let mut state = self.state.lock();
        let next = if matches!(outcome, Ok(true)) {
            LockState::Held
        } else {
            LockState::Idle
        };
        self.transition(&mut state, next);
        outcome
    }

    fn transition(&self, state: &mut MutexGuard<'_, LockState>, next: LockState) {
        debug!("Lock state {:?} -> {:?}", **state, next);
        **state = next;
        self.changed.notify_all();
    }
}

/// Owner thread loop: performs every operation on the wrapped lock until
/// the adapter is dropped.
fn run_owner<L: AffineLock>(lock: Arc<L>, commands: Receiver<Command>) {
    let mut held = false;
    for command in commands.iter() {
        match command {
            Command::Lock(reply) => {
                lock.lock();
                held = true;
                let _ = reply.send(Ok(true));
            }
            Command::LockInterruptibly(interrupt, reply) => {
                let outcome = lock.lock_interruptibly(&interrupt).map(|()| true);
                held = outcome.is_ok();
                let _ = reply.send(outcome);
            }
            Command::TryLock(reply) => {
                held = lock.try_lock();
                let _ = reply.send(Ok(held));
            }
            Command::TryLockFor(timeout, interrupt, reply) => {
                let outcome = lock.try_lock_for(timeout, &interrupt);
                held = matches!(outcome, Ok(true));
                let _ = reply.send(outcome);
            }
            Command::Unlock(reply) => {
                let outcome = lock.unlock();
                if outcome.is_ok() {
                    held = false;
                }
                let _ = reply.send(outcome);
            }
        }
    }

    if held {
        if let Err(e) = lock.unlock() {
            warn!("Failed to release lock on shutdown: {}", e);
        }
    }
    debug!("Lock owner thread stopped");
}
