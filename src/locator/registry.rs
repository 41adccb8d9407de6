use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_skiplist::SkipMap;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::database::{Member, MemberId, Value};
use crate::dispatch::Dispatcher;
use crate::errors::{HaError, Result, SqlError};
use crate::invocation::InvocationStrategy;
use crate::locator::{Locator, LocatorKind, LocatorOp, LocatorOpKind};

/// Per-member copies of one resource, in allocation order.
type Copies = Vec<(MemberId, Box<dyn Locator>)>;

/// State shared between a registry and the handles it issued.
struct Entries<C: Send + Sync + 'static> {
    handles: SkipMap<u64, Arc<LocatorHandle<C>>>,
    next_id: AtomicU64,
    dispatcher: Arc<Dispatcher<C>>,
}

fn register<C: Send + Sync + 'static>(
    entries: &Arc<Entries<C>>,
    copies: Copies,
    update_copy: bool,
) -> Result<Arc<LocatorHandle<C>>> {
    let kind = copies
        .first()
        .map(|(_, locator)| locator.kind())
        .ok_or(HaError::EmptyCluster)?;
    let id = entries.next_id.fetch_add(1, Ordering::Relaxed);
    let handle = Arc::new(LocatorHandle {
        id,
        kind,
        update_copy,
        copies: Mutex::new(Some(copies)),
        dispatcher: Arc::clone(&entries.dispatcher),
        registry: Arc::downgrade(entries),
    });
    entries.handles.insert(id, Arc::clone(&handle));
    debug!(
        "Registered {:?} locator {} on {:?} (update_copy={})",
        kind,
        id,
        handle.members(),
        update_copy
    );
    Ok(handle)
}

/// One logical resource backed by a copy on each member.
///
/// Calls on a handle are serialized. Reads are answered by a single copy,
/// writes go to every copy when the handle was registered with
/// `update_copy`, and release frees every copy exactly once.
pub struct LocatorHandle<C: Send + Sync + 'static> {
    id: u64,
    kind: LocatorKind,
    update_copy: bool,
    /// `None` once released.
    copies: Mutex<Option<Copies>>,
    dispatcher: Arc<Dispatcher<C>>,
    registry: Weak<Entries<C>>,
}

impl<C: Send + Sync + 'static> LocatorHandle<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> LocatorKind {
        self.kind
    }

    /// Whether writes are applied to every member's copy.
    pub fn update_copy(&self) -> bool {
        self.update_copy
    }

    /// Members holding a copy; empty once released.
    pub fn members(&self) -> Vec<MemberId> {
        self.copies
            .lock()
            .as_ref()
            .map(|copies| copies.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_released(&self) -> bool {
        self.copies.lock().is_none()
    }

    /// Frees every member's copy and forgets the handle.
    ///
    /// Free failures are logged and swallowed. Releasing an already
    /// released handle does nothing.
    pub fn release(&self) {
        let copies = self.copies.lock().take();
        if let Some(copies) = copies {
            self.free(copies);
        }
        if let Some(entries) = self.registry.upgrade() {
            entries.handles.remove(&self.id);
        }
    }

    fn free(&self, copies: Copies) {
        let results = self.dispatcher.broadcast(&copies, |locator| locator.free());
        for (member, result) in results {
            if let Err(cause) = result {
                warn!(
                    "Failed to free locator {} on member {}: {}",
                    self.id, member, cause
                );
            }
        }
        debug!("Released locator {} ({} copies)", self.id, copies.len());
    }

    fn released(&self) -> HaError {
        HaError::Released(format!("locator {}", self.id))
    }

    /// Performs a read or write operation.
    ///
    /// A read is answered by one copy, preferring a member that is still
    /// active. A write runs on every copy through the all-write strategy and
    /// its results are reconciled like row counts.
    ///
    /// # Errors
    ///
    /// * `HaError::Released` after the handle was released.
    /// * `HaError::Unsupported` for a nested read (use [`open`](Self::open))
    ///   or for a write on a handle registered without `update_copy`.
    /// * Whatever the dispatch of the operation returns.
    pub fn invoke(&self, op: &LocatorOp) -> Result<Value> {
        let guard = self.copies.lock();
        let copies = guard.as_ref().ok_or_else(|| self.released())?;

        match op.kind() {
            LocatorOpKind::Read => {
                let copy = self.preferred(copies);
                let dispatched = self.dispatcher.dispatch(
                    InvocationStrategy::DriverLocalRead,
                    &copies[copy..=copy],
                    |_: &Member<C>, locator: &Box<dyn Locator>| locator.invoke(op),
                )?;
                Ok(dispatched.into_value())
            }
            LocatorOpKind::Write => {
                if !self.update_copy {
                    return Err(HaError::Unsupported(format!(
                        "{:?} on read-only locator {}",
                        op, self.id
                    )));
                }
                let dispatched = self.dispatcher.dispatch(
                    InvocationStrategy::AllWrite,
                    copies,
                    |_: &Member<C>, locator: &Box<dyn Locator>| locator.invoke(op),
                )?;
                Ok(dispatched
                    .reconcile(self.dispatcher.consistency())?
                    .into_value())
            }
            LocatorOpKind::NestedRead => Err(HaError::Unsupported(format!(
                "{:?} returns a locator, use open",
                op
            ))),
        }
    }

    /// Performs a nested read, returning a new single-copy handle.
    ///
    /// The nested resource exists only on the member that answered, so
    /// writes to it are rejected.
    ///
    /// # Errors
    ///
    /// * `HaError::Released` after this handle or its registry is gone.
    /// * `HaError::Unsupported` if `op` is not a nested read.
    pub fn open(&self, op: &LocatorOp) -> Result<Arc<LocatorHandle<C>>> {
        if op.kind() != LocatorOpKind::NestedRead {
            return Err(HaError::Unsupported(format!(
                "{:?} does not return a locator",
                op
            )));
        }
        let nested = {
            let guard = self.copies.lock();
            let copies = guard.as_ref().ok_or_else(|| self.released())?;
            let copy = self.preferred(copies);
            self.dispatcher
                .dispatch(
                    InvocationStrategy::DriverLocalRead,
                    &copies[copy..=copy],
                    |_: &Member<C>, locator: &Box<dyn Locator>| locator.open(op),
                )?
                .into_results()
        };

        match self.registry.upgrade() {
            Some(entries) => register(&entries, nested, false),
            None => {
                self.free(nested);
                Err(self.released())
            }
        }
    }

    /// Index of the copy whose member is active, falling back to the first.
    fn preferred(&self, copies: &Copies) -> usize {
        let snapshot = self.dispatcher.membership().snapshot();
        copies
            .iter()
            .position(|(id, _)| snapshot.contains(id))
            .unwrap_or(0)
    }
}

impl<C: Send + Sync + 'static> fmt::Debug for LocatorHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocatorHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("update_copy", &self.update_copy)
            .field("members", &self.members())
            .finish()
    }
}

impl<C: Send + Sync + 'static> Drop for LocatorHandle<C> {
    fn drop(&mut self) {
        if let Some(copies) = self.copies.get_mut().take() {
            self.free(copies);
        }
    }
}

/// Tracks every live locator handle issued for one cluster connection.
pub struct LocatorRegistry<C: Send + Sync + 'static> {
    entries: Arc<Entries<C>>,
}

impl<C: Send + Sync + 'static> LocatorRegistry<C> {
    pub fn new(dispatcher: Arc<Dispatcher<C>>) -> Self {
        Self {
            entries: Arc::new(Entries {
                handles: SkipMap::new(),
                next_id: AtomicU64::new(1),
                dispatcher,
            }),
        }
    }

    /// Binds per-member copies of one resource into a single handle.
    ///
    /// # Arguments
    ///
    /// * `copies` - Each member's copy of the resource.
    /// * `update_copy` - Whether writes must reach every copy. Only
    ///   resources allocated on every member qualify.
    ///
    /// # Errors
    ///
    /// Returns `HaError::EmptyCluster` if `copies` is empty.
    pub fn register(
        &self,
        copies: Vec<(MemberId, Box<dyn Locator>)>,
        update_copy: bool,
    ) -> Result<Arc<LocatorHandle<C>>> {
        register(&self.entries, copies, update_copy)
    }

    pub fn get(&self, id: u64) -> Option<Arc<LocatorHandle<C>>> {
        self.entries
            .handles
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.entries.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.handles.is_empty()
    }

    /// Releases every registered handle, returning how many were released.
    pub fn release_all(&self) -> usize {
        let mut released = 0;
        for entry in self.entries.handles.iter() {
            entry.value().release();
            released += 1;
        }
        if released > 0 {
            debug!("Released {} outstanding locators", released);
        }
        released
    }

    /// Allocates a resource through each active member's target and
    /// registers the copies with `update_copy` set.
    ///
    /// Members that fail are handled like any all-write failure; the
    /// handle only covers members that allocated successfully.
    pub fn allocate<T, F>(
        &self,
        targets: &[(MemberId, T)],
        invocation: F,
    ) -> Result<Arc<LocatorHandle<C>>>
    where
        T: Sync,
        F: Fn(&Member<C>, &T) -> std::result::Result<Box<dyn Locator>, SqlError> + Sync,
    {
        let copies = self
            .entries
            .dispatcher
            .dispatch(InvocationStrategy::ResourceAllocating, targets, invocation)?
            .into_results();
        register(&self.entries, copies, true)
    }
}

impl<C: Send + Sync + 'static> Drop for LocatorRegistry<C> {
    fn drop(&mut self) {
        self.release_all();
    }
}
