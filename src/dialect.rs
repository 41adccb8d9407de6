//! Vendor dialect capability.
//!
//! The dispatch engine only asks a dialect two kinds of question: whether a
//! failure means the member is unusable, and whether a statement touches a
//! sequence (and so has side effects even when it looks like a read).

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::database::{Connection, Value};
use crate::errors::{SqlError, SqlErrorKind};

/// A schema-qualified database object name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    pub schema: Option<String>,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: Option<String>, name: impl Into<String>) -> Self {
        Self {
            schema,
            name: name.into(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Vendor-specific interpretation of SQL and driver failures.
pub trait Dialect: Send + Sync {
    /// Table targeted by an `INSERT`, if the dialect can tell.
    fn parse_insert_table(&self, sql: &str) -> Option<String>;

    /// Sequence referenced by a statement, if any.
    fn parse_sequence(&self, sql: &str) -> Option<String>;

    /// Every sequence defined in the member's database.
    fn sequences(&self, connection: &dyn Connection) -> Result<Vec<QualifiedName>, SqlError>;

    /// Whether the statement evaluates the server's current date or time,
    /// which would give a different value on every member.
    fn contains_current_datetime(&self, sql: &str) -> bool;

    /// Whether a failure means the member itself is unusable.
    ///
    /// Connection and protocol failures are member-fatal, as is any failure
    /// whose SQL state is in class `08` (connection exception) or `57P`
    /// (operator intervention). Everything else is an operation-level
    /// failure that leaves the member active.
    fn indicates_failure(&self, error: &SqlError) -> bool {
        if matches!(
            error.kind(),
            SqlErrorKind::Connectivity | SqlErrorKind::Protocol
        ) {
            return true;
        }
        error
            .sql_state()
            .is_some_and(|state| state.starts_with("08") || state.starts_with("57P"))
    }
}

static INSERT_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*INSERT\s+INTO\s+([\w.]+)").expect("valid regex"));

static NEXT_VALUE_FOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bNEXT\s+VALUE\s+FOR\s+([\w.]+)").expect("valid regex"));

static ANY_VALUE_FOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:NEXT|CURRENT)\s+VALUE\s+FOR\s+([\w.]+)").expect("valid regex")
});

static DOT_NEXTVAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\w+)\.(?:NEXTVAL|CURRVAL)\b").expect("valid regex"));

static STANDARD_DATETIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bCURRENT_(?:DATE|TIME|TIMESTAMP)\b").expect("valid regex")
});

static INGRES_DATETIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:CURRENT_(?:DATE|TIME|TIMESTAMP)|LOCAL_(?:TIME|TIMESTAMP))\b|\bDATE\s*\(\s*'(?:TODAY|NOW)'\s*\)",
    )
    .expect("valid regex")
});

fn capture(regex: &Regex, sql: &str) -> Option<String> {
    regex
        .captures(sql)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn text(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_text).map(str::to_string)
}

/// ANSI SQL behaviour, usable for most vendors.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardDialect;

impl Dialect for StandardDialect {
    fn parse_insert_table(&self, sql: &str) -> Option<String> {
        capture(&INSERT_TABLE, sql)
    }

    fn parse_sequence(&self, sql: &str) -> Option<String> {
        capture(&NEXT_VALUE_FOR, sql)
    }

    fn sequences(&self, connection: &dyn Connection) -> Result<Vec<QualifiedName>, SqlError> {
        let rows = connection.execute_query(
            "SELECT sequence_schema, sequence_name FROM information_schema.sequences",
        )?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let name = text(row.get(1))?;
                Some(QualifiedName::new(text(row.first()), name))
            })
            .collect())
    }

    fn contains_current_datetime(&self, sql: &str) -> bool {
        STANDARD_DATETIME.is_match(sql)
    }
}

/// Ingres: sequences live in `iisequence`, `INSERT` targets are not parsed.
#[derive(Debug, Default, Clone, Copy)]
pub struct IngresDialect;

impl Dialect for IngresDialect {
    fn parse_insert_table(&self, _sql: &str) -> Option<String> {
        None
    }

    fn parse_sequence(&self, sql: &str) -> Option<String> {
        capture(&ANY_VALUE_FOR, sql).or_else(|| capture(&DOT_NEXTVAL, sql))
    }

    fn sequences(&self, connection: &dyn Connection) -> Result<Vec<QualifiedName>, SqlError> {
        let rows = connection.execute_query("SELECT seq_name FROM iisequence")?;
        Ok(rows
            .iter()
            .filter_map(|row| text(row.first()).map(|name| QualifiedName::new(None, name)))
            .collect())
    }

    fn contains_current_datetime(&self, sql: &str) -> bool {
        INGRES_DATETIME.is_match(sql)
    }
}
