//! Common utilities for hadb integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use ahash::AHashMap as HashMap;
use hadb::{
    ClusterConfig, Connection, DatabaseCluster, Locator, LocatorKind, LocatorOp, MemberSpec,
    Rows, SqlError, StandardDialect, Value,
};

// --- MockConnection ---

struct MockState {
    name: String,
    /// Every call fails with this error while it is set.
    failure: Mutex<Option<SqlError>>,
    rows_affected: AtomicU64,
    /// Canned query results by SQL text.
    results: Mutex<HashMap<String, Rows>>,
    /// Every call waits here first when set.
    barrier: Mutex<Option<Arc<Barrier>>>,
    queries: AtomicUsize,
    updates: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
    locators: Mutex<Vec<Arc<LocatorState>>>,
}

/// An in-memory stand-in for one member's raw connection.
///
/// Clones share state, so a test can keep a clone to program failures and
/// inspect calls after handing the original to the cluster. Connections
/// opened from it share the same database state but can be closed on their
/// own; calls on a closed connection fail with a connectivity error.
#[derive(Clone)]
pub struct MockConnection {
    state: Arc<MockState>,
    closed: Arc<AtomicBool>,
}

impl MockConnection {
    pub fn new(name: &str) -> Self {
        Self {
            state: Arc::new(MockState {
                name: name.to_string(),
                failure: Mutex::new(None),
                rows_affected: AtomicU64::new(1),
                results: Mutex::new(HashMap::new()),
                barrier: Mutex::new(None),
                queries: AtomicUsize::new(0),
                updates: AtomicUsize::new(0),
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                locators: Mutex::new(Vec::new()),
            }),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Makes every later call, including calls on this member's locators,
    /// fail with `error`.
    pub fn fail_with(&self, error: SqlError) {
        *self.state.failure.lock().unwrap() = Some(error);
    }

    pub fn recover(&self) {
        *self.state.failure.lock().unwrap() = None;
    }

    pub fn set_rows_affected(&self, rows: u64) {
        self.state.rows_affected.store(rows, Ordering::SeqCst);
    }

    pub fn set_result(&self, sql: &str, rows: Rows) {
        self.state
            .results
            .lock()
            .unwrap()
            .insert(sql.to_string(), rows);
    }

    pub fn wait_on(&self, barrier: Arc<Barrier>) {
        *self.state.barrier.lock().unwrap() = Some(barrier);
    }

    pub fn queries(&self) -> usize {
        self.state.queries.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.state.updates.load(Ordering::SeqCst)
    }

    /// Physical connections opened to this member.
    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Locators allocated or selected on this member, oldest first.
    pub fn locators(&self) -> Vec<Arc<LocatorState>> {
        self.state.locators.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), SqlError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SqlError::connectivity("connection is closed"));
        }
        let barrier = self.state.barrier.lock().unwrap().clone();
        if let Some(barrier) = barrier {
            barrier.wait();
        }
        match self.state.failure.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn new_locator(&self, kind: LocatorKind, data: Vec<u8>) -> Box<dyn Locator> {
        let state = LocatorState::new(kind, data);
        self.state
            .locators
            .lock()
            .unwrap()
            .push(Arc::clone(&state));
        Box::new(MockLocator {
            connection: self.clone(),
            state,
        })
    }
}

impl Connection for MockConnection {
    fn open(&self) -> Result<Self, SqlError> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            state: Arc::clone(&self.state),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn execute_query(&self, sql: &str) -> Result<Rows, SqlError> {
        self.check()?;
        self.state.queries.fetch_add(1, Ordering::SeqCst);
        let canned = self.state.results.lock().unwrap().get(sql).cloned();
        Ok(canned.unwrap_or_else(|| vec![vec![Value::Text(self.state.name.clone())]]))
    }

    fn execute_update(&self, _sql: &str) -> Result<u64, SqlError> {
        self.check()?;
        self.state.updates.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.rows_affected.load(Ordering::SeqCst))
    }

    fn create_locator(&self, kind: LocatorKind) -> Result<Box<dyn Locator>, SqlError> {
        self.check()?;
        Ok(self.new_locator(kind, Vec::new()))
    }

    fn select_locator(&self, _sql: &str, kind: LocatorKind) -> Result<Box<dyn Locator>, SqlError> {
        self.check()?;
        Ok(self.new_locator(kind, self.state.name.as_bytes().to_vec()))
    }

    fn server_version(&self) -> Result<String, SqlError> {
        self.check()?;
        Ok(format!("Mock {}", self.state.name))
    }

    fn close(&self) -> Result<(), SqlError> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// --- MockLocator ---

/// Server-side state of one mock resource.
pub struct LocatorState {
    pub kind: LocatorKind,
    data: Mutex<Vec<u8>>,
    frees: AtomicUsize,
    children: Mutex<Vec<Arc<LocatorState>>>,
}

impl LocatorState {
    fn new(kind: LocatorKind, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            data: Mutex::new(data),
            frees: AtomicUsize::new(0),
            children: Mutex::new(Vec::new()),
        })
    }

    pub fn data(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    pub fn children(&self) -> Vec<Arc<LocatorState>> {
        self.children.lock().unwrap().clone()
    }
}

struct MockLocator {
    connection: MockConnection,
    state: Arc<LocatorState>,
}

impl Locator for MockLocator {
    fn kind(&self) -> LocatorKind {
        self.state.kind
    }

    fn invoke(&self, op: &LocatorOp) -> Result<Value, SqlError> {
        self.connection.check()?;
        let mut data = self.state.data.lock().unwrap();
        match op {
            LocatorOp::Length => Ok(Value::Int(data.len() as i64)),
            LocatorOp::Bytes { position, length } => {
                let start = (*position as usize).saturating_sub(1).min(data.len());
                let end = (start + length).min(data.len());
                Ok(Value::Bytes(data[start..end].to_vec()))
            }
            LocatorOp::SubString { position, length } => {
                let text = String::from_utf8_lossy(&data).into_owned();
                let start = (*position as usize).saturating_sub(1);
                Ok(Value::Text(text.chars().skip(start).take(*length).collect()))
            }
            LocatorOp::SetBytes { position, bytes } => {
                write_at(&mut data, *position, bytes);
                Ok(Value::Int(bytes.len() as i64))
            }
            LocatorOp::SetString { position, text } => {
                write_at(&mut data, *position, text.as_bytes());
                Ok(Value::Int(text.len() as i64))
            }
            LocatorOp::Truncate(length) => {
                data.truncate(*length as usize);
                Ok(Value::Int(data.len() as i64))
            }
            other => Err(SqlError::new(
                hadb::SqlErrorKind::Unsupported,
                format!("{:?}", other),
            )),
        }
    }

    fn open(&self, op: &LocatorOp) -> Result<Box<dyn Locator>, SqlError> {
        self.connection.check()?;
        let LocatorOp::ElementCursor { index, count } = op else {
            return Err(SqlError::new(
                hadb::SqlErrorKind::Unsupported,
                format!("{:?}", op),
            ));
        };
        let data = self.state.data.lock().unwrap();
        let start = (*index as usize).saturating_sub(1).min(data.len());
        let end = (start + count).min(data.len());
        let child = LocatorState::new(LocatorKind::Cursor, data[start..end].to_vec());
        self.state.children.lock().unwrap().push(Arc::clone(&child));
        Ok(Box::new(MockLocator {
            connection: self.connection.clone(),
            state: child,
        }))
    }

    fn free(&self) -> Result<(), SqlError> {
        self.state.frees.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn write_at(data: &mut Vec<u8>, position: u64, bytes: &[u8]) {
    let start = (position as usize).saturating_sub(1);
    if data.len() < start + bytes.len() {
        data.resize(start + bytes.len(), 0);
    }
    data[start..start + bytes.len()].copy_from_slice(bytes);
}

// --- Helper Functions ---

/// Builds a cluster of mock members with the given config tweaks, returning
/// the cluster and a clone of each member's connection.
pub fn setup_cluster_with(
    names: &[&str],
    configure: impl FnOnce(&mut ClusterConfig),
) -> (DatabaseCluster<MockConnection>, Vec<MockConnection>) {
    let mut config =
        ClusterConfig::with_members(names.iter().map(|n| MemberSpec::new(*n, 1)).collect());
    configure(&mut config);
    let connections: Vec<MockConnection> = names.iter().map(|n| MockConnection::new(n)).collect();
    let by_name: HashMap<String, MockConnection> = connections
        .iter()
        .map(|c| (c.name().to_string(), c.clone()))
        .collect();
    let cluster = DatabaseCluster::new(config, Arc::new(StandardDialect), |spec| {
        Ok(by_name[spec.id.as_str()].clone())
    })
    .unwrap();
    (cluster, connections)
}

pub fn setup_cluster(names: &[&str]) -> (DatabaseCluster<MockConnection>, Vec<MockConnection>) {
    setup_cluster_with(names, |_| {})
}

pub fn ids(members: &[hadb::MemberId]) -> Vec<&str> {
    members.iter().map(|m| m.as_str()).collect()
}
