use thiserror::Error;

use crate::database::MemberId;

/// Broad category of a failure raised by a member's raw connection objects.
///
/// The category is what the dialect looks at when deciding whether a failure
/// means the member itself is unusable or only that the operation was bad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlErrorKind {
    /// The connection to the database was lost or could not be established.
    Connectivity,
    /// The wire protocol broke down (unexpected message, I/O error mid-stream).
    Protocol,
    /// A constraint was violated (unique key, foreign key, check).
    Constraint,
    /// The statement was malformed or referenced unknown objects.
    Syntax,
    /// The resource the operation targeted was already released.
    Released,
    /// The driver does not support the operation.
    Unsupported,
    /// Anything else.
    Other,
}

/// A failure raised by one member's raw connection, statement or resource.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}{:?}: {message}", state_prefix(.sql_state), .kind)]
pub struct SqlError {
    kind: SqlErrorKind,
    sql_state: Option<String>,
    message: String,
}

impl SqlError {
    pub fn new(kind: SqlErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql_state: None,
            message: message.into(),
        }
    }

    /// Attaches a five character SQL state to the error.
    pub fn with_state(mut self, sql_state: impl Into<String>) -> Self {
        self.sql_state = Some(sql_state.into());
        self
    }

    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::new(SqlErrorKind::Connectivity, message).with_state("08006")
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(SqlErrorKind::Constraint, message).with_state("23000")
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(SqlErrorKind::Syntax, message).with_state("42000")
    }

    pub fn released(message: impl Into<String>) -> Self {
        Self::new(SqlErrorKind::Released, message)
    }

    pub fn kind(&self) -> SqlErrorKind {
        self.kind
    }

    pub fn sql_state(&self) -> Option<&str> {
        self.sql_state.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

fn state_prefix(sql_state: &Option<String>) -> String {
    sql_state
        .as_ref()
        .map(|state| format!("[{}] ", state))
        .unwrap_or_default()
}

/// One member's contribution to an aggregated failure.
#[derive(Error, Debug, Clone)]
#[error("{member}: {cause}")]
pub struct MemberFailure {
    pub member: MemberId,
    pub cause: SqlError,
    /// Whether the failure was classified as member-fatal.
    pub fatal: bool,
}

/// Errors raised by the lock adapter and the bundled thread-owned lock.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock released by a thread that does not own it")]
    NotOwner,

    #[error("Lock is not held")]
    NotHeld,

    #[error("Lock owner thread has terminated")]
    OwnerGone,

    #[error("Timed out waiting for lock")]
    Timeout,

    #[error("Failed to start lock owner thread: {0}")]
    Spawn(String),
}

#[derive(Error, Debug)]
pub enum HaError {
    #[error("Operation failed on member {member}: {source}")]
    Operation {
        member: MemberId,
        #[source]
        source: SqlError,
    },

    #[error("Operation failed on every member: {}", format_causes(.causes))]
    ClusterExhausted { causes: Vec<MemberFailure> },

    #[error("No active member available")]
    EmptyCluster,

    #[error("Inconsistent results across members: {0}")]
    Consistency(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Resource already released: {0}")]
    Released(String),

    #[error("Unknown member: {0}")]
    UnknownMember(MemberId),

    #[error("Member already exists: {0}")]
    DuplicateMember(MemberId),

    #[error("Lock acquisition interrupted")]
    Interrupted,

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl HaError {
    /// The member causes carried by this error, if it is an aggregated one.
    pub fn causes(&self) -> &[MemberFailure] {
        match self {
            HaError::ClusterExhausted { causes } => causes,
            _ => &[],
        }
    }
}

fn format_causes(causes: &[MemberFailure]) -> String {
    causes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, HaError>;
