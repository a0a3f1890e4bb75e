//! Durable SQLite access layer.
//!
//! Opens a database file with persistent WAL, mediates all access through a
//! single writer and a pool of snapshot readers, applies versioned
//! migrations exactly once, and offers bulk insert/update/delete helpers for
//! types that describe their own row mapping.
//!
//! # Design decisions
//!
//! - **One `Database` per file, passed explicitly**: there is no global
//!   shared instance. The composition root opens the handle and hands the
//!   `Arc` to whoever needs it.
//! - **Single writer, pooled readers**: the writer pool holds one
//!   connection, so write transactions never interleave; callers queue up
//!   to the write timeout and then get `LockTimeout`. Readers see the last
//!   committed state under WAL without blocking the writer.
//! - **Persistent WAL**: writable handles ask SQLite to keep the `-wal` and
//!   `-shm` files after close, so read-only processes can open the database
//!   without a checkpoint first.
//! - **Cross-process open**: the open-and-configure sequence runs under an
//!   advisory lock on a `-coordination` sidecar file.
//! - **Refuse newer schemas**: a migration record that is not a prefix of
//!   the registered sequence fails startup rather than running against a
//!   schema this build does not understand.
//!
//! # Usage
//!
//! ```rust,no_run
//! use omsync_db::{open_database, Migration, Migrator, OpenOptions, StoreError};
//!
//! let migrator = Migrator::new().register(Migration::sql(
//!     "001_notes",
//!     "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL);",
//! ));
//! let db = open_database("data/notes.sqlite", OpenOptions::default().trace_from_env(), &migrator)?;
//!
//! db.write(|conn| {
//!     conn.execute("INSERT INTO notes (body) VALUES (?1)", ["hello"])?;
//!     Ok::<_, StoreError>(())
//! })?;
//! # Ok::<(), StoreError>(())
//! ```

mod coordination;
mod database;
mod error;
mod migrations;
mod paths;
mod pool;
mod records;
mod task;
mod trace;

pub use coordination::{coordination_path, FileCoordinator};
pub use database::{Database, DatabaseHandle};
pub use error::StoreError;
pub use migrations::{
    open_database, read_record, AppliedMigration, Migration, MigrationReport, Migrator,
    MIGRATIONS_TABLE,
};
pub use paths::{database_path_in, default_database_path, SUPPORT_DIR};
pub use pool::{ConnectionHook, OpenOptions};
pub use records::{delete_all, fetch_all, insert, insert_all, update_all, Assignment, Record};
pub use trace::{log_statement, StatementTrace, TraceSink, TRACE_ENV_VAR};

pub use rusqlite;
