//! Connection pool creation and per-connection configuration.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use r2d2::{HandleError, Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{ffi, Connection, OpenFlags};

use crate::error::StoreError;
use crate::trace::StatementTrace;

/// A type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

type RegisterFn = dyn Fn(&Connection) -> rusqlite::Result<()> + Send + Sync;

/// A named callback run on every new connection, typically to register a
/// custom SQL function or collation.
#[derive(Clone)]
pub struct ConnectionHook {
    name: String,
    register: Arc<RegisterFn>,
}

impl ConnectionHook {
    /// Creates a hook. `name` only appears in logs and errors.
    pub fn new<F>(name: impl Into<String>, register: F) -> Self
    where
        F: Fn(&Connection) -> rusqlite::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            register: Arc::new(register),
        }
    }

    /// The hook's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn run(&self, conn: &Connection) -> rusqlite::Result<()> {
        (self.register)(conn)
    }
}

impl fmt::Debug for ConnectionHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHook")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Settings applied when opening a database.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Open without write access. No writer connection is created and the
    /// file is never reconfigured.
    pub read_only: bool,

    /// How long SQLite itself retries a locked database before giving up.
    pub busy_timeout: Duration,

    /// How long a caller waits for the single writer connection.
    pub write_timeout: Duration,

    /// Maximum number of pooled reader connections.
    pub reader_pool_size: u32,

    /// Callbacks run on every connection, in order.
    pub hooks: Vec<ConnectionHook>,

    /// Statement tracing, off unless set.
    pub trace: Option<StatementTrace>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            busy_timeout: Duration::from_millis(5_000),
            write_timeout: Duration::from_millis(5_000),
            reader_pool_size: 4,
            hooks: Vec::new(),
            trace: None,
        }
    }
}

impl OpenOptions {
    /// Options for a read-only handle.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    /// Adds a connection hook.
    pub fn with_hook<F>(mut self, name: impl Into<String>, register: F) -> Self
    where
        F: Fn(&Connection) -> rusqlite::Result<()> + Send + Sync + 'static,
    {
        self.hooks.push(ConnectionHook::new(name, register));
        self
    }

    /// Installs a statement trace.
    pub fn with_trace(mut self, trace: StatementTrace) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Enables statement logging when `SQL_TRACE` is set in the environment.
    pub fn trace_from_env(mut self) -> Self {
        if let Some(trace) = StatementTrace::from_env() {
            self.trace = Some(trace);
        }
        self
    }
}

/// Which side of the single-writer split a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Writer,
    Reader,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Self::Writer => "writer",
            Self::Reader => "reader",
        }
    }
}

/// Switches the journal to WAL and verifies the engine accepted it.
fn enable_wal(conn: &Connection) -> Result<(), StoreError> {
    let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    if !journal_mode.eq_ignore_ascii_case("wal") {
        return Err(StoreError::Configuration {
            detail: format!("failed to set WAL journal mode, got: {journal_mode}"),
            code: None,
        });
    }
    Ok(())
}

/// Keeps the WAL and shared-memory files after the last connection closes,
/// so read-only processes can still open the database.
fn persist_wal(conn: &Connection) -> Result<(), StoreError> {
    let mut flag: std::ffi::c_int = 1;
    // SAFETY: the handle is live, a null name targets the main database,
    // and PERSIST_WAL takes a pointer to an int that outlives the call.
    let rc = unsafe {
        ffi::sqlite3_file_control(
            conn.handle(),
            std::ptr::null(),
            ffi::SQLITE_FCNTL_PERSIST_WAL,
            (&mut flag as *mut std::ffi::c_int).cast(),
        )
    };
    if rc != ffi::SQLITE_OK {
        return Err(StoreError::Configuration {
            detail: "engine refused persistent WAL".to_string(),
            code: Some(rc),
        });
    }
    Ok(())
}

/// Applies pragmas, durability settings, hooks and tracing to a connection.
pub(crate) fn prepare_connection(
    conn: &Connection,
    options: &OpenOptions,
    role: Role,
) -> Result<(), StoreError> {
    conn.busy_timeout(options.busy_timeout)?;

    if role == Role::Writer {
        enable_wal(conn)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;",
        )?;
    }

    if !options.read_only {
        persist_wal(conn)?;
    }

    for hook in &options.hooks {
        hook.run(conn).map_err(|e| StoreError::Configuration {
            detail: format!("connection hook '{}' failed: {e}", hook.name()),
            code: e.sqlite_error().map(|s| s.extended_code),
        })?;
    }

    if let Some(trace) = &options.trace {
        trace.install(conn)?;
    }

    Ok(())
}

/// Describes a setup failure in the error type r2d2 expects.
fn to_sqlite_error(err: &StoreError) -> rusqlite::Error {
    rusqlite::Error::SqliteFailure(
        ffi::Error::new(err.code().unwrap_or(ffi::SQLITE_ERROR)),
        Some(err.to_string()),
    )
}

/// The most recent failure to create a connection for one pool.
type FailureSlot = Arc<Mutex<Option<StoreError>>>;

fn lock_slot(slot: &FailureSlot) -> MutexGuard<'_, Option<StoreError>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes pool-level connection errors into the log and remembers the
/// first one since the last successful checkout.
#[derive(Debug)]
struct LogErrorHandler {
    last_failure: FailureSlot,
}

impl HandleError<rusqlite::Error> for LogErrorHandler {
    fn handle_error(&self, error: rusqlite::Error) {
        tracing::warn!(error = %error, "sqlite pool connection error");
        let mut slot = lock_slot(&self.last_failure);
        if slot.is_none() {
            *slot = Some(StoreError::from(error));
        }
    }
}

/// One side of the single-writer split.
#[derive(Clone)]
pub(crate) struct ConnectionPool {
    pool: DbPool,
    last_failure: FailureSlot,
    role: Role,
    timeout: Duration,
}

impl ConnectionPool {
    /// Checks out a connection, waiting up to the pool's timeout.
    ///
    /// When connections could not be created at all, the setup error is
    /// returned instead of `LockTimeout`, so a broken hook or an unusable
    /// file is not reported as retryable.
    pub(crate) fn get(&self) -> Result<PooledConnection<SqliteConnectionManager>, StoreError> {
        match self.pool.get() {
            Ok(conn) => {
                lock_slot(&self.last_failure).take();
                Ok(conn)
            }
            Err(e) => match lock_slot(&self.last_failure).take() {
                Some(failure) => Err(failure),
                None => Err(StoreError::LockTimeout(format!(
                    "{} connection after {:?} ({e})",
                    self.role.label(),
                    self.timeout
                ))),
            },
        }
    }
}

/// Builds the pool for one side of the single-writer split.
///
/// The writer pool holds exactly one connection, so at most one write
/// transaction is open at a time; waiters block up to `write_timeout`.
/// Connections are created lazily on first checkout.
pub(crate) fn build_pool(path: &Path, options: &Arc<OpenOptions>, role: Role) -> ConnectionPool {
    let flags = match role {
        Role::Writer => {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX
        }
        Role::Reader => OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
    };
    let (max_size, timeout) = match role {
        Role::Writer => (1, options.write_timeout),
        Role::Reader => (options.reader_pool_size.max(1), options.busy_timeout),
    };

    let last_failure = FailureSlot::default();
    let init_options = Arc::clone(options);
    let init_failure = Arc::clone(&last_failure);
    let manager = SqliteConnectionManager::file(path)
        .with_flags(flags)
        .with_init(move |conn| {
            prepare_connection(conn, &init_options, role).map_err(|e| {
                let sqlite = to_sqlite_error(&e);
                *lock_slot(&init_failure) = Some(e);
                sqlite
            })
        });

    let pool = Pool::builder()
        .max_size(max_size)
        .min_idle(Some(0))
        .connection_timeout(timeout)
        .error_handler(Box::new(LogErrorHandler {
            last_failure: Arc::clone(&last_failure),
        }))
        .build_unchecked(manager);

    ConnectionPool {
        pool,
        last_failure,
        role,
        timeout,
    }
}
