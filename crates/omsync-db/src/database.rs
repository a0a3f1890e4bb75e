//! The connection manager: one `Database` per logical database file.
//!
//! Writes go through a pool holding a single writer connection, so exactly
//! one write transaction is open at a time per handle. Reads use a separate
//! pool of read-only connections; under WAL they see the last committed
//! state and never block the writer.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rusqlite::{Connection, OpenFlags, TransactionBehavior};
use tokio::sync::Semaphore;

use crate::coordination::FileCoordinator;
use crate::error::StoreError;
use crate::pool::{build_pool, prepare_connection, ConnectionPool, OpenOptions, Role};

/// Shared, reference-counted handle to an open database.
pub type DatabaseHandle = Arc<Database>;

/// Paths with a live writable `Database` in this process.
static WRITERS: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());

/// Marks a path as held by a writable handle; released on drop.
#[derive(Debug)]
struct WriterClaim {
    path: PathBuf,
}

impl WriterClaim {
    fn acquire(path: &Path) -> Result<Self, StoreError> {
        let mut writers = WRITERS.lock().unwrap_or_else(PoisonError::into_inner);
        if !writers.insert(path.to_path_buf()) {
            return Err(StoreError::AlreadyOpen {
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for WriterClaim {
    fn drop(&mut self) {
        WRITERS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

struct Pools {
    writer: Option<ConnectionPool>,
    readers: ConnectionPool,
    _claim: Option<WriterClaim>,
}

/// An open database file.
pub struct Database {
    path: PathBuf,
    options: Arc<OpenOptions>,
    pools: RwLock<Option<Pools>>,
    pub(crate) write_gate: Arc<Semaphore>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("read_only", &self.options.read_only)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Resolves `path` to an absolute, canonical form. The file itself may not
/// exist yet, so only the parent is canonicalized.
fn canonical_path(path: &Path) -> Result<PathBuf, StoreError> {
    let file_name = path.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("database path {} has no file name", path.display()),
        )
    })?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok(parent.canonicalize()?.join(file_name))
}

/// Opens the file once, applies durability settings and checks that it is
/// a database at all.
fn bootstrap(path: &Path, options: &OpenOptions) -> Result<(), StoreError> {
    let (flags, role) = if options.read_only {
        (OpenFlags::SQLITE_OPEN_READ_ONLY, Role::Reader)
    } else {
        (
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            Role::Writer,
        )
    };
    let conn = Connection::open_with_flags(path, flags)?;
    prepare_connection(&conn, options, role)?;
    // Reading the schema rejects files that are not databases.
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })?;
    Ok(())
}

/// Takes the coordination lock for a read-only open when the sidecar can
/// be created. Missing files and read-only directories open uncoordinated;
/// the former fail in bootstrap anyway.
fn coordinate_read_only(
    path: &Path,
    options: &OpenOptions,
) -> Result<Option<FileCoordinator>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    match FileCoordinator::acquire(path, options.busy_timeout) {
        Ok(coordinator) => Ok(Some(coordinator)),
        Err(StoreError::Io(e))
            if matches!(
                e.kind(),
                std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::ReadOnlyFilesystem
            ) =>
        {
            tracing::debug!(path = %path.display(), error = %e, "opening without coordination lock");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

impl Database {
    /// Opens or creates the database at `path`.
    ///
    /// Writable opens create missing parent directories, then run the
    /// open-and-configure sequence under the file's coordination lock so
    /// another process cannot race the durability setup. Read-only opens
    /// take the same lock when the directory allows creating it.
    ///
    /// # Errors
    ///
    /// - `StoreError::Io` for filesystem failures.
    /// - `StoreError::CorruptFile` if the file is not a database.
    /// - `StoreError::LockTimeout` if another process holds the file.
    /// - `StoreError::Configuration` if WAL cannot be made persistent.
    /// - `StoreError::AlreadyOpen` if this process already holds a writable
    ///   handle for the same file.
    pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> Result<DatabaseHandle, StoreError> {
        let path = path.as_ref();
        if !options.read_only {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
        }
        let path = canonical_path(path)?;

        let claim = if options.read_only {
            let _coordination = coordinate_read_only(&path, &options)?;
            bootstrap(&path, &options)?;
            None
        } else {
            let claim = WriterClaim::acquire(&path)?;
            let _coordination = FileCoordinator::acquire(&path, options.busy_timeout)?;
            bootstrap(&path, &options)?;
            Some(claim)
        };

        let options = Arc::new(options);
        let readers = build_pool(&path, &options, Role::Reader);
        let writer = (!options.read_only).then(|| build_pool(&path, &options, Role::Writer));

        tracing::info!(
            path = %path.display(),
            read_only = options.read_only,
            "opened database"
        );

        Ok(Arc::new(Self {
            path,
            options,
            pools: RwLock::new(Some(Pools {
                writer,
                readers,
                _claim: claim,
            })),
            write_gate: Arc::new(Semaphore::new(1)),
        }))
    }

    /// Canonical path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the handle was opened without write access.
    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    /// Whether [`Database::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub(crate) fn options(&self) -> &OpenOptions {
        &self.options
    }

    fn writer_pool(&self) -> Result<ConnectionPool, StoreError> {
        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
        match pools.as_ref() {
            Some(pools) => pools.writer.clone().ok_or(StoreError::ReadOnly),
            None => Err(StoreError::HandleClosed),
        }
    }

    fn reader_pool(&self) -> Result<ConnectionPool, StoreError> {
        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
        pools
            .as_ref()
            .map(|p| p.readers.clone())
            .ok_or(StoreError::HandleClosed)
    }

    /// Fails with `HandleClosed` after close, or with `ReadOnly` when a
    /// write is requested through a read-only handle.
    pub(crate) fn check_usable(&self, write: bool) -> Result<(), StoreError> {
        if write {
            self.writer_pool().map(drop)
        } else {
            self.reader_pool().map(drop)
        }
    }

    /// Runs `f` inside a write transaction.
    ///
    /// Blocks until the writer connection is free, up to the configured
    /// write timeout. The transaction commits when `f` returns `Ok` and
    /// rolls back when it returns `Err` or panics.
    ///
    /// # Errors
    ///
    /// Returns `f`'s error, or a `StoreError` converted into `E`:
    /// `HandleClosed`, `ReadOnly`, `LockTimeout`, or a failed commit.
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<StoreError>,
    {
        let pool = self.writer_pool()?;
        let mut conn = pool.get()?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }

    /// Runs `f` against a consistent snapshot of the last committed state.
    ///
    /// # Errors
    ///
    /// Returns `f`'s error, or a `StoreError` converted into `E`.
    pub fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<StoreError>,
    {
        let pool = self.reader_pool()?;
        let mut conn = pool.get()?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(StoreError::from)?;
        let value = f(&tx)?;
        tx.finish().map_err(StoreError::from)?;
        Ok(value)
    }

    /// Releases every connection. Further use fails with `HandleClosed`.
    /// Calling it again is a no-op.
    pub fn close(&self) {
        let pools = self
            .pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if pools.is_some() {
            self.write_gate.close();
            drop(pools);
            tracing::info!(path = %self.path.display(), "closed database");
        }
    }
}
