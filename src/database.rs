use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::errors::SqlError;
use crate::locator::{Locator, LocatorKind};

/// Identity of one physical database in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Configuration-level description of a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSpec {
    pub id: MemberId,
    /// Relative read weight. A weight of zero excludes the member from
    /// balanced reads while it still receives writes.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl MemberSpec {
    pub fn new(id: impl Into<String>, weight: u32) -> Self {
        Self {
            id: MemberId::new(id),
            weight,
        }
    }
}

/// One physical database participating in the cluster.
///
/// A member owns the connection it was configured with; logical cluster
/// connections open their own physical connections from it. It is
/// deactivated (not destroyed) when an operation fails on it in a
/// member-fatal way, and only dropped once it is administratively removed
/// and no snapshot references it any more.
pub struct Member<C> {
    id: MemberId,
    weight: u32,
    connection: C,
    active: AtomicBool,
    /// Bumped each time the member returns to the active set.
    generation: AtomicU64,
    /// Invocations currently running against this member.
    in_flight: AtomicUsize,
}

impl<C> Member<C> {
    pub fn new(spec: MemberSpec, connection: C) -> Self {
        Self {
            id: spec.id,
            weight: spec.weight,
            connection,
            active: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &MemberId {
        &self.id
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// How many times the member was reactivated. Anything opened against
    /// an earlier generation may predate the failure that deactivated it.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Flips the active flag, returning the previous value.
    pub(crate) fn set_active(&self, active: bool) -> bool {
        let was_active = self.active.swap(active, Ordering::AcqRel);
        if active && !was_active {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        was_active
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Marks an invocation as running until the returned guard is dropped.
    pub(crate) fn begin_invocation(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            counter: &self.in_flight,
        }
    }
}

impl<C> fmt::Debug for Member<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("id", &self.id)
            .field("weight", &self.weight)
            .field("active", &self.is_active())
            .finish()
    }
}

pub(crate) struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A scalar SQL value as seen by the cluster layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// A fully materialized query result.
pub type Rows = Vec<Vec<Value>>;

/// A raw connection to one member database.
///
/// Implementations wrap a vendor driver connection. They are shared between
/// the threads of a fan-out dispatch, so they must be `Send` and `Sync`; any
/// per-call mutable state is the implementation's business.
pub trait Connection: Send + Sync + 'static {
    /// Opens another physical connection to the same database.
    ///
    /// Every logical cluster connection works on its own physical
    /// connections, so closing one never affects another.
    fn open(&self) -> Result<Self, SqlError>
    where
        Self: Sized;

    /// Runs a query and returns every row.
    fn execute_query(&self, sql: &str) -> Result<Rows, SqlError>;

    /// Runs a row-affecting statement and returns the affected row count.
    fn execute_update(&self, sql: &str) -> Result<u64, SqlError>;

    /// Allocates a new, empty server-side resource of the given kind.
    fn create_locator(&self, kind: LocatorKind) -> Result<Box<dyn Locator>, SqlError>;

    /// Runs a query whose single result column is a resource of the given kind.
    fn select_locator(&self, sql: &str, kind: LocatorKind) -> Result<Box<dyn Locator>, SqlError>;

    /// Vendor version string of the server.
    fn server_version(&self) -> Result<String, SqlError>;

    fn close(&self) -> Result<(), SqlError>;
}
