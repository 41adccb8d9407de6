//! Server-resident resources (blobs, clobs, arrays, cursors) that exist once
//! per member and are presented to callers as a single handle.

/// Handles and the registry that owns them.
pub mod registry;

pub use registry::{LocatorHandle, LocatorRegistry};

use crate::database::Value;
use crate::errors::SqlError;

/// What kind of resource a locator refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocatorKind {
    Blob,
    Clob,
    Array,
    Cursor,
}

/// Read/write classification of a locator operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorOpKind {
    /// Answered by one member's copy.
    Read,
    /// Answered by one member's copy, returning a new resource.
    NestedRead,
    /// Must be applied to every member's copy.
    Write,
}

/// Every operation a locator handle supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatorOp {
    /// Length in bytes (blob) or characters (clob) or elements (array).
    Length,
    /// `length` bytes starting at 1-based `position`.
    Bytes { position: u64, length: usize },
    /// `length` characters starting at 1-based `position`.
    SubString { position: u64, length: usize },
    /// 1-based offset of `pattern` at or after `start`, or -1.
    Position { pattern: Vec<u8>, start: u64 },
    /// Vendor name of an array's element type.
    BaseTypeName,
    /// All elements of an array.
    Elements,
    /// Advances a cursor; `true` while a row is available.
    Next,
    /// Column of the cursor's current row, 1-based.
    Column(usize),
    /// A cursor over `count` array elements starting at 1-based `index`.
    ElementCursor { index: u64, count: usize },
    /// Overwrites bytes starting at 1-based `position`.
    SetBytes { position: u64, bytes: Vec<u8> },
    /// Overwrites characters starting at 1-based `position`.
    SetString { position: u64, text: String },
    /// Truncates to `length`.
    Truncate(u64),
}

impl LocatorOp {
    pub fn kind(&self) -> LocatorOpKind {
        match self {
            LocatorOp::Length
            | LocatorOp::Bytes { .. }
            | LocatorOp::SubString { .. }
            | LocatorOp::Position { .. }
            | LocatorOp::BaseTypeName
            | LocatorOp::Elements
            | LocatorOp::Next
            | LocatorOp::Column(_) => LocatorOpKind::Read,
            LocatorOp::ElementCursor { .. } => LocatorOpKind::NestedRead,
            LocatorOp::SetBytes { .. } | LocatorOp::SetString { .. } | LocatorOp::Truncate(_) => {
                LocatorOpKind::Write
            }
        }
    }
}

/// One member's copy of a server-side resource.
///
/// Implementations wrap a driver object. The owning handle serializes calls,
/// but copies of different members are used from different threads at once.
pub trait Locator: Send + Sync {
    fn kind(&self) -> LocatorKind;

    /// Performs a `Read` or `Write` operation.
    fn invoke(&self, op: &LocatorOp) -> Result<Value, SqlError>;

    /// Performs a `NestedRead` operation.
    fn open(&self, op: &LocatorOp) -> Result<Box<dyn Locator>, SqlError>;

    /// Releases the server-side resource.
    fn free(&self) -> Result<(), SqlError>;
}
