use std::sync::Arc;

use log::{info, warn};

use crate::config::ClusterConfig;
use crate::connection::ClusterConnection;
use crate::database::{Connection, Member, MemberId, MemberSpec};
use crate::dialect::Dialect;
use crate::dispatch::Dispatcher;
use crate::errors::{HaError, LockError, Result, SqlError};
use crate::lock::{CrossThreadLock, Interrupt, ThreadOwnedLock};
use crate::membership::{ClusterSnapshot, MembershipListener, MembershipStore};

/// hadb prelude
pub mod prelude {
    pub use crate::balancer::*;
    pub use crate::cluster::{DatabaseCluster, Reconfiguration};
    pub use crate::config::*;
    pub use crate::connection::*;
    pub use crate::database::*;
    pub use crate::dialect::*;
    pub use crate::dispatch::*;
    pub use crate::errors::*;
    pub use crate::invocation::*;
    pub use crate::locator::*;
    pub use crate::lock::*;
    pub use crate::membership::*;
}

type ReconfigurationLock = CrossThreadLock<ThreadOwnedLock>;

/// A set of replicated databases presented as one.
pub struct DatabaseCluster<C> {
    config: ClusterConfig,
    membership: Arc<MembershipStore<C>>,
    dispatcher: Arc<Dispatcher<C>>,
    /// Serializes membership changes made through this cluster.
    reconfiguration: Arc<ReconfigurationLock>,
}

impl<C: Connection> DatabaseCluster<C> {
    /// Builds a cluster from its configuration, connecting to every member.
    ///
    /// # Arguments
    ///
    /// * `config` - Members and dispatch settings.
    /// * `dialect` - The vendor dialect shared by every member.
    /// * `connect` - Opens the raw connection for one configured member.
    ///
    /// # Errors
    ///
    /// * `HaError::Config` if the configuration is invalid.
    /// * `HaError::Operation` if a member cannot be connected.
    pub fn new<F>(config: ClusterConfig, dialect: Arc<dyn Dialect>, mut connect: F) -> Result<Self>
    where
        F: FnMut(&MemberSpec) -> std::result::Result<C, SqlError>,
    {
        config.validate()?;
        let mut members = Vec::with_capacity(config.members.len());
        for spec in &config.members {
            let connection = connect(spec).map_err(|source| HaError::Operation {
                member: spec.id.clone(),
                source,
            })?;
            members.push(Member::new(spec.clone(), connection));
        }

        let membership = Arc::new(MembershipStore::new(members)?);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&membership),
            dialect,
            &config,
        ));
        let reconfiguration = Arc::new(CrossThreadLock::new(ThreadOwnedLock::new())?);
        info!(
            "Cluster started with members {:?}",
            membership.active_members()
        );

        Ok(Self {
            config,
            membership,
            dispatcher,
            reconfiguration,
        })
    }

    /// Opens a new logical connection to the cluster.
    pub fn connection(&self) -> ClusterConnection<C> {
        ClusterConnection::new(Arc::clone(&self.dispatcher))
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<C>> {
        &self.dispatcher
    }

    pub fn membership(&self) -> &Arc<MembershipStore<C>> {
        &self.membership
    }

    pub fn snapshot(&self) -> Arc<ClusterSnapshot<C>> {
        self.membership.snapshot()
    }

    pub fn active_members(&self) -> Vec<MemberId> {
        self.membership.active_members()
    }

    pub fn add_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.membership.add_listener(listener);
    }

    /// Acquires the reconfiguration lock.
    ///
    /// The returned ticket may be moved to and finished on another thread.
    /// Waits at most the configured lock timeout, if any.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Timeout` if the lock is not acquired in time.
    pub fn begin_reconfiguration(&self) -> Result<Reconfiguration<C>> {
        match self.config.lock_acquire_timeout() {
            Some(timeout) => {
                if !self.reconfiguration.try_lock_for(timeout)? {
                    return Err(LockError::Timeout.into());
                }
            }
            None => self.reconfiguration.lock()?,
        }
        Ok(self.ticket())
    }

    /// Like [`begin_reconfiguration`](Self::begin_reconfiguration), but
    /// gives up when `interrupt` is raised.
    pub fn begin_reconfiguration_interruptibly(
        &self,
        interrupt: &Interrupt,
    ) -> Result<Reconfiguration<C>> {
        self.reconfiguration.lock_interruptibly(interrupt)?;
        Ok(self.ticket())
    }

    /// Adds and activates a member.
    pub fn add_member(&self, spec: MemberSpec, connection: C) -> Result<()> {
        let mut reconfiguration = self.begin_reconfiguration()?;
        reconfiguration.add(spec, connection)?;
        reconfiguration.finish()
    }

    pub fn remove_member(&self, id: &MemberId) -> Result<()> {
        let mut reconfiguration = self.begin_reconfiguration()?;
        reconfiguration.remove(id)?;
        reconfiguration.finish()
    }

    /// Returns a deactivated member to service. The member's data must
    /// already be synchronized.
    pub fn activate_member(&self, id: &MemberId) -> Result<bool> {
        let mut reconfiguration = self.begin_reconfiguration()?;
        let activated = reconfiguration.activate(id)?;
        reconfiguration.finish()?;
        Ok(activated)
    }

    fn ticket(&self) -> Reconfiguration<C> {
        Reconfiguration {
            membership: Arc::clone(&self.membership),
            lock: Some(Arc::clone(&self.reconfiguration)),
        }
    }
}

/// Exclusive permission to change a cluster's membership.
///
/// Dropping an unfinished ticket releases the lock.
pub struct Reconfiguration<C> {
    membership: Arc<MembershipStore<C>>,
    lock: Option<Arc<ReconfigurationLock>>,
}

impl<C> Reconfiguration<C> {
    pub fn add(&mut self, spec: MemberSpec, connection: C) -> Result<Arc<Member<C>>> {
        self.membership.add(Member::new(spec, connection))
    }

    pub fn remove(&mut self, id: &MemberId) -> Result<Arc<Member<C>>> {
        self.membership.remove(id)
    }

    pub fn activate(&mut self, id: &MemberId) -> Result<bool> {
        self.membership.activate(id)
    }

    pub fn deactivate(&mut self, id: &MemberId, cause: &SqlError) -> bool {
        self.membership.deactivate(id, cause)
    }

    /// Releases the reconfiguration lock.
    pub fn finish(mut self) -> Result<()> {
        match self.lock.take() {
            Some(lock) => lock.unlock(),
            None => Ok(()),
        }
    }
}

impl<C> Drop for Reconfiguration<C> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            if let Err(e) = lock.unlock() {
                warn!("Failed to release reconfiguration lock: {}", e);
            }
        }
    }
}
