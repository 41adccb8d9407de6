//! The cluster-wide connection facade.
//!
//! Every operation is looked up in a fixed table that classifies it as a
//! read, a write or something else, and the classification picks the
//! invocation strategy the dispatcher uses.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::database::{Connection, MemberId, Rows};
use crate::dialect::QualifiedName;
use crate::dispatch::Dispatcher;
use crate::errors::{HaError, Result, SqlError};
use crate::invocation::{Dispatched, OperationKind};
use crate::locator::{LocatorHandle, LocatorKind, LocatorRegistry};

/// Operations offered by [`ClusterConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOp {
    /// Opens this logical connection's physical connection to a member.
    Open,
    Query,
    /// A query that draws from a sequence.
    SequenceQuery,
    Update,
    CreateLocator,
    SelectLocator,
    ServerVersion,
    Sequences,
    Close,
}

impl ConnectionOp {
    pub fn kind(self) -> OperationKind {
        match self {
            ConnectionOp::Query | ConnectionOp::SelectLocator => OperationKind::Read,
            ConnectionOp::SequenceQuery | ConnectionOp::Close => OperationKind::Write,
            ConnectionOp::Update => OperationKind::RowCountWrite,
            ConnectionOp::Open | ConnectionOp::CreateLocator => OperationKind::Allocate,
            ConnectionOp::ServerVersion => OperationKind::DriverRead,
            ConnectionOp::Sequences => OperationKind::AnyMember,
        }
    }
}

/// Physical connections of one logical connection, in snapshot order.
type Sessions<C> = Vec<(MemberId, Arc<C>)>;

/// A physical connection and the member generation it was opened in.
struct Session<C> {
    generation: u64,
    connection: Arc<C>,
}

/// One logical connection to every member of a cluster.
///
/// Each logical connection opens its own physical connection to a member
/// the first time it needs one, and closing it closes only those.
/// Dropping it closes it.
pub struct ClusterConnection<C: Connection> {
    dispatcher: Arc<Dispatcher<C>>,
    locators: LocatorRegistry<C>,
    sessions: Mutex<AHashMap<MemberId, Session<C>>>,
    closed: AtomicBool,
}

impl<C: Connection> ClusterConnection<C> {
    pub fn new(dispatcher: Arc<Dispatcher<C>>) -> Self {
        Self {
            locators: LocatorRegistry::new(Arc::clone(&dispatcher)),
            dispatcher,
            sessions: Mutex::new(AHashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Runs a query on one member.
    ///
    /// A query that draws from a sequence runs on every member instead, so
    /// the sequence advances everywhere.
    pub fn query(&self, sql: &str) -> Result<Rows> {
        let op = match self.dispatcher.dialect().parse_sequence(sql) {
            Some(sequence) => {
                debug!("Query uses sequence {}, sending to every member", sequence);
                ConnectionOp::SequenceQuery
            }
            None => ConnectionOp::Query,
        };
        let rows = self.route(op, |session| session.execute_query(sql))?;
        Ok(rows.into_value())
    }

    /// Runs a row-affecting statement on every member and compares the
    /// affected row counts.
    ///
    /// # Errors
    ///
    /// Besides dispatch failures, `HaError::Consistency` when the counts
    /// differ and the consistency policy is `Fail`.
    pub fn update(&self, sql: &str) -> Result<Dispatched<u64>> {
        let op = ConnectionOp::Update;
        let counts = self.route(op, |session| session.execute_update(sql))?;
        if op.kind().reconciles() {
            counts.reconcile(self.dispatcher.consistency())
        } else {
            Ok(counts)
        }
    }

    /// Allocates an empty resource on every member; writes to the returned
    /// handle reach every copy.
    pub fn create_locator(&self, kind: LocatorKind) -> Result<Arc<LocatorHandle<C>>> {
        let sessions = self.sessions()?;
        self.locators
            .allocate(&sessions, |_, session: &Arc<C>| session.create_locator(kind))
    }

    /// Reads a resource column from one member. The handle is read-only.
    pub fn select_locator(&self, sql: &str, kind: LocatorKind) -> Result<Arc<LocatorHandle<C>>> {
        let selected = self.route(ConnectionOp::SelectLocator, |session| {
            session.select_locator(sql, kind)
        })?;
        self.locators.register(selected.into_results(), false)
    }

    pub fn server_version(&self) -> Result<String> {
        let version = self.route(ConnectionOp::ServerVersion, |session| {
            session.server_version()
        })?;
        Ok(version.into_value())
    }

    /// Sequences defined in the cluster, as reported by the first healthy
    /// member.
    pub fn sequences(&self) -> Result<Vec<QualifiedName>> {
        let dialect = Arc::clone(self.dispatcher.dialect());
        let sequences = self.route(ConnectionOp::Sequences, |session| {
            dialect.sequences(session)
        })?;
        Ok(sequences.into_value())
    }

    pub fn locators(&self) -> &LocatorRegistry<C> {
        &self.locators
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Releases every outstanding locator, then closes this connection's
    /// physical connections. Other logical connections are unaffected.
    /// Closing twice does nothing.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let released = self.locators.release_all();
        let sessions: Sessions<C> = self
            .sessions
            .lock()
            .drain()
            .map(|(id, session)| (id, session.connection))
            .collect();
        info!(
            "Closing cluster connection ({} locators released, {} member connections)",
            released,
            sessions.len()
        );

        // Connections to members that left the active set are closed quietly.
        let snapshot = self.dispatcher.membership().snapshot();
        let (active, inactive): (Sessions<C>, Sessions<C>) = sessions
            .into_iter()
            .partition(|(id, _)| snapshot.contains(id));
        for (member, result) in self.dispatcher.broadcast(&inactive, |session| session.close()) {
            if let Err(cause) = result {
                warn!("Failed to close connection to member {}: {}", member, cause);
            }
        }
        if active.is_empty() {
            return Ok(());
        }
        self.dispatcher
            .dispatch(ConnectionOp::Close.kind().strategy(), &active, |_, session: &Arc<C>| {
                session.close()
            })
            .map(|_| ())
    }

    fn route<R, F>(&self, op: ConnectionOp, invocation: F) -> Result<Dispatched<R>>
    where
        R: Send,
        F: Fn(&C) -> std::result::Result<R, SqlError> + Sync,
    {
        let sessions = self.sessions()?;
        self.dispatcher
            .dispatch(op.kind().strategy(), &sessions, |_, session: &Arc<C>| {
                invocation(&**session)
            })
    }

    /// This connection's physical connections to the active members,
    /// opening any that are missing. Connections to members that left the
    /// active set, or were reactivated since, are closed and reopened.
    fn sessions(&self) -> Result<Sessions<C>> {
        self.ensure_open()?;
        let mut sessions = self.sessions.lock();

        let snapshot = self.dispatcher.membership().snapshot();
        let stale: Vec<MemberId> = sessions
            .iter()
            .filter(|(id, session)| {
                snapshot
                    .get(id)
                    .is_none_or(|member| member.generation() != session.generation)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(session) = sessions.remove(&id) {
                debug!("Closing stale connection to member {}", id);
                if let Err(cause) = session.connection.close() {
                    warn!("Failed to close connection to member {}: {}", id, cause);
                }
            }
        }

        let missing: Vec<(MemberId, u64)> = snapshot
            .members()
            .iter()
            .filter(|member| !sessions.contains_key(member.id()))
            .map(|member| (member.id().clone(), member.generation()))
            .collect();
        if !missing.is_empty() {
            let opened = self.dispatcher.dispatch(
                ConnectionOp::Open.kind().strategy(),
                &missing,
                |member, generation: &u64| {
                    member.connection().open().map(|connection| Session {
                        generation: *generation,
                        connection: Arc::new(connection),
                    })
                },
            );
            match opened {
                Ok(opened) => {
                    for (id, session) in opened.into_results() {
                        debug!("Opened connection to member {}", id);
                        sessions.insert(id, session);
                    }
                }
                // Every unreachable member was deactivated; the rest carry on.
                Err(HaError::ClusterExhausted { causes })
                    if !sessions.is_empty() && causes.iter().all(|cause| cause.fatal) =>
                {
                    warn!("Could not open connections to {} members", causes.len());
                }
                Err(e) => return Err(e),
            }
        }

        Ok(snapshot
            .members()
            .iter()
            .filter_map(|member| {
                sessions
                    .get(member.id())
                    .map(|session| (member.id().clone(), Arc::clone(&session.connection)))
            })
            .collect())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(HaError::Released("connection closed".to_string()));
        }
        Ok(())
    }
}

impl<C: Connection> Drop for ClusterConnection<C> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close cluster connection: {}", e);
        }
    }
}
