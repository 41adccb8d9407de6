pub mod balancer;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod database;
pub mod dialect;
pub mod dispatch;
pub mod errors;
pub mod invocation;
pub mod locator;
pub mod lock;
pub mod membership;

// Re-export key types for easier access
pub use cluster::{DatabaseCluster, Reconfiguration, prelude};
pub use config::ClusterConfig;
pub use connection::ClusterConnection;
pub use database::{Connection, Member, MemberId, MemberSpec, Rows, Value};
pub use dialect::{Dialect, IngresDialect, StandardDialect};
pub use dispatch::Dispatcher;
pub use errors::{HaError, LockError, Result, SqlError, SqlErrorKind};
pub use invocation::{ConsistencyPolicy, Dispatched, FanOut, InvocationStrategy, OperationKind};
pub use locator::{Locator, LocatorHandle, LocatorKind, LocatorOp, LocatorRegistry};
pub use lock::{AffineLock, CrossThreadLock, Interrupt, LockState, ThreadOwnedLock};
pub use membership::{ClusterSnapshot, MembershipListener, MembershipStore};
