use std::io;
use std::sync::PoisonError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    InvalidHeader,
    InvalidMagic,
    UnsupportedVersion(u32),
    Corrupted(String),
    ChecksumMismatch,
    InvalidData(String),
    MutexPoisoned,
    ReadOnly,
    LockError(io::Error),
    // Catalog and DDL
    TableNotFound(String),
    TableExists(String),
    Schema(String),
    Parse(String),
    // Write path
    DuplicateKey { table: String, index: String },
    ForeignKey(String),
    Conflict(String),
    TransactionAborted(String),
    InvalidState(String),
    InvalidOperation(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::InvalidHeader => write!(f, "Invalid header"),
            Error::InvalidMagic => write!(f, "Invalid magic number, not a database file"),
            Error::UnsupportedVersion(v) => write!(f, "Unsupported file version: {}", v),
            Error::Corrupted(msg) => write!(f, "Database corrupted: {}", msg),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::ReadOnly => write!(f, "Storage is read-only"),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::TableNotFound(name) => write!(f, "nonexistent table: {}", name),
            Error::TableExists(name) => write!(f, "table already exists: {}", name),
            Error::Schema(msg) => write!(f, "{}", msg),
            Error::Parse(msg) => write!(f, "syntax error: {}", msg),
            Error::DuplicateKey { table, index } => {
                write!(f, "duplicate key: {} in {}", index, table)
            }
            Error::ForeignKey(msg) => write!(f, "foreign key: {}", msg),
            Error::Conflict(msg) => write!(f, "transaction conflict: {}", msg),
            Error::TransactionAborted(msg) => write!(f, "transaction aborted: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) | Error::LockError(err) => Some(err),
            _ => None,
        }
    }
}
