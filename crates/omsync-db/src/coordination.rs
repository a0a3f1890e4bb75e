//! Cross-process coordination of the open-and-configure sequence.
//!
//! Two processes sharing a database file (an app and its extension, say) must
//! not race while one of them switches journal modes or sets the persistent
//! WAL flag. The sequence runs under an exclusive advisory lock on a sidecar
//! file next to the database. Steady-state reads and writes are not
//! coordinated here; SQLite's own locking covers those.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::StoreError;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Returns the sidecar lock file path for a database file.
pub fn coordination_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push("-coordination");
    PathBuf::from(name)
}

/// Exclusive hold on a database file's coordination lock.
///
/// Released when dropped.
#[derive(Debug)]
pub struct FileCoordinator {
    file: File,
    path: PathBuf,
}

impl FileCoordinator {
    /// Acquires the coordination lock for `db_path`, polling until `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the lock file cannot be created and
    /// `StoreError::LockTimeout` if another process holds the lock past
    /// the deadline.
    pub fn acquire(db_path: &Path, timeout: Duration) -> Result<Self, StoreError> {
        let path = coordination_path(db_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock() {
                Ok(()) => {
                    tracing::trace!(path = %path.display(), "acquired coordination lock");
                    return Ok(Self { file, path });
                }
                Err(TryLockError::WouldBlock) if Instant::now() < deadline => {
                    thread::sleep(POLL_INTERVAL);
                }
                Err(TryLockError::WouldBlock) => {
                    return Err(StoreError::LockTimeout(format!(
                        "coordination lock {} after {timeout:?}",
                        path.display()
                    )));
                }
                Err(TryLockError::Error(e)) => return Err(StoreError::Io(e)),
            }
        }
    }
}

impl Drop for FileCoordinator {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release coordination lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_sits_next_to_database() {
        let path = coordination_path(Path::new("/tmp/support/db.sqlite"));
        assert_eq!(path, PathBuf::from("/tmp/support/db.sqlite-coordination"));
    }

    #[test]
    fn second_holder_times_out_until_first_releases() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let db = dir.path().join("db.sqlite");

        let first = FileCoordinator::acquire(&db, Duration::from_millis(100))
            .expect("first acquire should succeed");

        // A second handle on the same file conflicts even within one process.
        let err = FileCoordinator::acquire(&db, Duration::from_millis(50))
            .expect_err("second acquire should time out");
        assert!(matches!(err, StoreError::LockTimeout(_)), "got {err:?}");

        drop(first);
        FileCoordinator::acquire(&db, Duration::from_millis(100))
            .expect("acquire after release should succeed");
    }
}
