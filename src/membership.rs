//! Cluster membership: the set of member databases and which of them are active.
//!
//! Readers take a [`ClusterSnapshot`] with a single atomic load and never block.
//! Writers serialize on an internal mutex, build a fresh snapshot from the
//! full member list and publish it atomically, so a snapshot is always a
//! complete pre- or post-change view.

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::database::{Member, MemberId};
use crate::errors::{HaError, Result, SqlError};

/// Number of deactivation records kept for inspection.
const DEACTIVATION_HISTORY: usize = 128;

/// An immutable, point-in-time view of the active members.
///
/// Every member in a snapshot was active when the snapshot was published.
/// Membership changes never mutate an existing snapshot; they publish a new
/// one with a higher version.
pub struct ClusterSnapshot<C> {
    version: u64,
    members: Vec<Arc<Member<C>>>,
}

impl<C> ClusterSnapshot<C> {
    /// Monotonically increasing publication counter.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Active members in configuration order.
    pub fn members(&self) -> &[Arc<Member<C>>] {
        &self.members
    }

    pub fn get(&self, id: &MemberId) -> Option<&Arc<Member<C>>> {
        self.members.iter().find(|m| m.id() == id)
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<MemberId> {
        self.members.iter().map(|m| m.id().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Observer of membership changes.
///
/// Callbacks run on the thread that made the change, after the new snapshot
/// has been published.
pub trait MembershipListener: Send + Sync {
    fn added(&self, _member: &MemberId) {}
    fn removed(&self, _member: &MemberId) {}
    fn activated(&self, _member: &MemberId) {}
    fn deactivated(&self, _member: &MemberId, _cause: &SqlError) {}
}

/// A recorded deactivation, kept so every removal from the active set can be
/// attributed to a cause.
#[derive(Debug, Clone)]
pub struct Deactivation {
    pub member: MemberId,
    pub cause: SqlError,
    /// Version of the snapshot that no longer contains the member.
    pub snapshot_version: u64,
}

/// Holds every known member and publishes snapshots of the active ones.
pub struct MembershipStore<C> {
    /// Every known member, active or not. Writers hold this lock for the
    /// whole read-modify-publish cycle.
    members: Mutex<Vec<Arc<Member<C>>>>,
    /// The currently published snapshot.
    current: ArcSwap<ClusterSnapshot<C>>,
    listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,
    history: Mutex<VecDeque<Deactivation>>,
}

impl<C> MembershipStore<C> {
    /// Creates a store whose members all start active.
    ///
    /// # Arguments
    ///
    /// * `members` - The configured members, in the order reads and writes
    ///   should prefer them.
    ///
    /// # Errors
    ///
    /// Returns `HaError::DuplicateMember` if two members share an id.
    pub fn new(members: Vec<Member<C>>) -> Result<Self> {
        let mut known: Vec<Arc<Member<C>>> = Vec::with_capacity(members.len());
        for member in members {
            if known.iter().any(|m| m.id() == member.id()) {
                return Err(HaError::DuplicateMember(member.id().clone()));
            }
            member.set_active(true);
            known.push(Arc::new(member));
        }
        let snapshot = Self::build(0, &known);
        Ok(Self {
            members: Mutex::new(known),
            current: ArcSwap::from_pointee(snapshot),
            listeners: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
        })
    }

    /// Returns the current snapshot of active members.
    ///
    /// This is a single atomic load; it never waits for writers.
    pub fn snapshot(&self) -> Arc<ClusterSnapshot<C>> {
        self.current.load_full()
    }

    /// Every known member, active or not.
    pub fn members(&self) -> Vec<Arc<Member<C>>> {
        self.members.lock().clone()
    }

    pub fn active_members(&self) -> Vec<MemberId> {
        self.snapshot().ids()
    }

    pub fn add_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.listeners.write().push(listener);
    }

    /// Removes a member from the active set because an operation failed on it.
    ///
    /// Deactivation is idempotent: deactivating an inactive or unknown member
    /// does nothing and returns `false`. Operations already dispatched to the
    /// member are not affected; only later snapshots exclude it.
    ///
    /// # Arguments
    ///
    /// * `id` - The member to deactivate.
    /// * `cause` - The failure that triggered the deactivation.
    ///
    /// # Returns
    ///
    /// `true` if this call changed the member from active to inactive.
    pub fn deactivate(&self, id: &MemberId, cause: &SqlError) -> bool {
        let version = {
            let members = self.members.lock();
            let Some(member) = members.iter().find(|m| m.id() == id) else {
                debug!("Ignoring deactivation of unknown member {}", id);
                return false;
            };
            if !member.set_active(false) {
                return false;
            }
            self.publish(&members)
        };

        warn!(
            "Deactivated member {} (snapshot {}): {}",
            id, version, cause
        );
        {
            let mut history = self.history.lock();
            if history.len() == DEACTIVATION_HISTORY {
                history.pop_front();
            }
            history.push_back(Deactivation {
                member: id.clone(),
                cause: cause.clone(),
                snapshot_version: version,
            });
        }
        for listener in self.listeners() {
            listener.deactivated(id, cause);
        }
        true
    }

    /// Returns a previously deactivated member to the active set.
    ///
    /// # Returns
    ///
    /// `Ok(true)` if the member was inactive and is now active, `Ok(false)` if
    /// it was already active.
    ///
    /// # Errors
    ///
    /// Returns `HaError::UnknownMember` if no member has the given id.
    pub fn activate(&self, id: &MemberId) -> Result<bool> {
        let version = {
            let members = self.members.lock();
            let member = members
                .iter()
                .find(|m| m.id() == id)
                .ok_or_else(|| HaError::UnknownMember(id.clone()))?;
            if member.set_active(true) {
                return Ok(false);
            }
            self.publish(&members)
        };
        info!("Activated member {} (snapshot {})", id, version);
        for listener in self.listeners() {
            listener.activated(id);
        }
        Ok(true)
    }

    /// Adds a new, active member.
    ///
    /// # Errors
    ///
    /// Returns `HaError::DuplicateMember` if a member with the same id exists.
    pub fn add(&self, member: Member<C>) -> Result<Arc<Member<C>>> {
        let member = Arc::new(member);
        let version = {
            let mut members = self.members.lock();
            if members.iter().any(|m| m.id() == member.id()) {
                return Err(HaError::DuplicateMember(member.id().clone()));
            }
            member.set_active(true);
            members.push(Arc::clone(&member));
            self.publish(&members)
        };
        info!("Added member {} (snapshot {})", member.id(), version);
        for listener in self.listeners() {
            listener.added(member.id());
        }
        Ok(member)
    }

    /// Removes a member entirely.
    ///
    /// The member record is returned; snapshots taken earlier keep it alive
    /// until they are dropped.
    ///
    /// # Errors
    ///
    /// Returns `HaError::UnknownMember` if no member has the given id.
    pub fn remove(&self, id: &MemberId) -> Result<Arc<Member<C>>> {
        let (member, version) = {
            let mut members = self.members.lock();
            let index = members
                .iter()
                .position(|m| m.id() == id)
                .ok_or_else(|| HaError::UnknownMember(id.clone()))?;
            let member = members.remove(index);
            member.set_active(false);
            let version = self.publish(&members);
            (member, version)
        };
        info!("Removed member {} (snapshot {})", id, version);
        for listener in self.listeners() {
            listener.removed(id);
        }
        Ok(member)
    }

    /// Listeners are called without holding the list lock, so a listener
    /// may register further listeners.
    fn listeners(&self) -> Vec<Arc<dyn MembershipListener>> {
        self.listeners.read().clone()
    }

    /// Recorded deactivations, oldest first.
    pub fn deactivations(&self) -> Vec<Deactivation> {
        self.history.lock().iter().cloned().collect()
    }

    // Caller must hold the `members` lock.
    fn publish(&self, members: &[Arc<Member<C>>]) -> u64 {
        let version = self.current.load().version + 1;
        self.current.store(Arc::new(Self::build(version, members)));
        version
    }

    fn build(version: u64, members: &[Arc<Member<C>>]) -> ClusterSnapshot<C> {
        ClusterSnapshot {
            version,
            members: members
                .iter()
                .filter(|m| m.is_active())
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemberSpec;

    fn store(ids: &[&str]) -> MembershipStore<()> {
        MembershipStore::new(
            ids.iter()
                .map(|id| Member::new(MemberSpec::new(*id, 1), ()))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_snapshot_is_immutable_across_deactivation() {
        let store = store(&["db1", "db2"]);
        let before = store.snapshot();
        assert!(store.deactivate(&"db2".into(), &SqlError::connectivity("gone")));
        let after = store.snapshot();

        assert!(before.contains(&"db2".into()));
        assert!(!after.contains(&"db2".into()));
        assert!(after.version() > before.version());
    }

    #[test]
    fn test_deactivate_is_idempotent() {
        let store = store(&["db1", "db2"]);
        let cause = SqlError::connectivity("gone");
        assert!(store.deactivate(&"db1".into(), &cause));
        let version = store.snapshot().version();
        assert!(!store.deactivate(&"db1".into(), &cause));
        assert!(!store.deactivate(&"nope".into(), &cause));
        assert_eq!(store.snapshot().version(), version);
        assert_eq!(store.deactivations().len(), 1);
    }

    struct Quiet;

    impl MembershipListener for Quiet {}

    /// Registers another listener from inside its callback.
    struct Recruiting {
        store: Arc<MembershipStore<()>>,
    }

    impl MembershipListener for Recruiting {
        fn deactivated(&self, _member: &MemberId, _cause: &SqlError) {
            self.store.add_listener(Arc::new(Quiet));
        }
    }

    #[test]
    fn test_listener_may_register_listener() {
        let store = Arc::new(store(&["db1", "db2"]));
        store.add_listener(Arc::new(Recruiting {
            store: Arc::clone(&store),
        }));

        assert!(store.deactivate(&"db1".into(), &SqlError::connectivity("gone")));
        assert_eq!(store.listeners().len(), 2);
        assert!(store.deactivate(&"db2".into(), &SqlError::connectivity("gone")));
        assert_eq!(store.listeners().len(), 3);
    }

    #[test]
    fn test_duplicate_members_rejected() {
        let result = MembershipStore::new(vec![
            Member::new(MemberSpec::new("db1", 1), ()),
            Member::new(MemberSpec::new("db1", 2), ()),
        ]);
        assert!(matches!(result, Err(HaError::DuplicateMember(_))));
    }
}
