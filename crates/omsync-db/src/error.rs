//! Error types for the storage layer.

use std::io;
use std::path::PathBuf;

use rusqlite::ErrorCode;

/// Errors returned by every operation of the storage layer.
///
/// Nothing is retried internally. [`StoreError::LockTimeout`] is the only
/// variant a caller may reasonably retry (see [`StoreError::is_retryable`]).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure: permissions, missing parent, disk full.
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    /// The file exists but is not a valid SQLite database.
    #[error("database file is corrupt or not a database (code {code}): {source}")]
    CorruptFile {
        /// SQLite extended result code.
        code: i32,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// A lock could not be acquired in time. Safe to retry with backoff.
    #[error("timed out waiting for {0}")]
    LockTimeout(String),

    /// The engine refused a durability setting this layer requires.
    #[error("database configuration rejected: {detail}")]
    Configuration {
        /// What was being configured and what the engine answered.
        detail: String,
        /// SQLite result code, when the engine reported one.
        code: Option<i32>,
    },

    /// The recorded migration history is not a prefix of the known sequence:
    /// the file was written by a newer schema version.
    #[error("database schema is newer than this build: recorded {stored:?}, known {known:?}")]
    IncompatibleSchema {
        /// Migration names recorded in the database.
        stored: Vec<String>,
        /// Migration names compiled into the running build.
        known: Vec<String>,
    },

    /// A migration step failed; the database stays at the last applied step.
    #[error("migration '{name}' failed: {source}")]
    MigrationFailed {
        /// The name of the migration that failed.
        name: String,
        /// What went wrong inside the step.
        source: Box<StoreError>,
    },

    /// The handle was used after [`crate::Database::close`].
    #[error("database handle is closed")]
    HandleClosed,

    /// A write was attempted through a read-only handle.
    #[error("database handle is read-only")]
    ReadOnly,

    /// Another writable handle for the same file is open in this process.
    #[error("database {} is already open for writing in this process", path.display())]
    AlreadyOpen {
        /// Canonical path of the database file.
        path: PathBuf,
    },

    /// A bulk update named a column the record type does not declare.
    #[error("unknown column '{column}' for table '{table}'")]
    UnknownColumn {
        /// Table of the record type.
        table: &'static str,
        /// The rejected column name.
        column: String,
    },

    /// Any other SQLite failure.
    #[error("sqlite error (code {code}): {source}")]
    Sqlite {
        /// SQLite extended result code, or -1 for non-engine errors.
        code: i32,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },
}

impl StoreError {
    /// Returns the SQLite extended result code carried by this error, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::CorruptFile { code, .. } | Self::Sqlite { code, .. } => Some(*code),
            Self::Configuration { code, .. } => *code,
            Self::MigrationFailed { source, .. } => source.code(),
            _ => None,
        }
    }

    /// Whether a caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        let Some((code, extended)) = err.sqlite_error().map(|e| (e.code, e.extended_code)) else {
            return Self::Sqlite {
                code: -1,
                source: err,
            };
        };

        match code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                Self::LockTimeout(format!("sqlite lock ({err})"))
            }
            ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt => Self::CorruptFile {
                code: extended,
                source: err,
            },
            ErrorCode::PermissionDenied | ErrorCode::ReadOnly => {
                Self::Io(io::Error::new(io::ErrorKind::PermissionDenied, err))
            }
            ErrorCode::DiskFull => Self::Io(io::Error::new(io::ErrorKind::StorageFull, err)),
            ErrorCode::CannotOpen | ErrorCode::SystemIoFailure => {
                Self::Io(io::Error::other(err))
            }
            _ => Self::Sqlite {
                code: extended,
                source: err,
            },
        }
    }
}
