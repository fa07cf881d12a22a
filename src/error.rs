use std::io;

use crate::record::FieldType;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    ReadError(String, io::Error),
    WriteError(String, io::Error),
    Corrupted(String),
    RecordCountMismatch {
        expected: usize,
        actual: usize,
    },
    // Metadata errors surfaced to query builders
    MissingColumn(String),
    ColumnTypeMismatch {
        name: String,
        expected: FieldType,
        actual: FieldType,
    },
    InfoMissing(String),
    // Lock protocol
    LockUnavailable(String),
    /// An expired or unreadable lock. `stale` is the token of the expired
    /// lease that was seen, if the file was readable.
    LockBroken {
        name: String,
        stale: Option<u64>,
    },
    InvalidQuery(String),
    InvalidOperation(String),
    InvalidState(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::ReadError(context, err) => write!(f, "Failed to read {}: {}", context, err),
            Error::WriteError(context, err) => write!(f, "Failed to write {}: {}", context, err),
            Error::Corrupted(msg) => write!(f, "Corrupted data: {}", msg),
            Error::RecordCountMismatch { expected, actual } => write!(
                f,
                "Record count mismatch: expected {} records, found {}",
                expected, actual
            ),
            Error::MissingColumn(name) => write!(f, "Missing column: {}", name),
            Error::ColumnTypeMismatch {
                name,
                expected,
                actual,
            } => write!(
                f,
                "Column {} has type {}, expected {}",
                name, actual, expected
            ),
            Error::InfoMissing(table) => write!(
                f,
                "Table info for {} is missing but its flag file exists",
                table
            ),
            Error::LockUnavailable(name) => write!(f, "Could not acquire lock: {}", name),
            Error::LockBroken { name, .. } => write!(f, "Lock is broken: {}", name),
            Error::InvalidQuery(msg) => write!(f, "Invalid query: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
