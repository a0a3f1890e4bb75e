//! Async access for hosts running on tokio.
//!
//! The blocking work runs on tokio's blocking pool. Async writers queue on
//! a one-permit semaphore first: dropping the future while it is still
//! queued abandons the request, but once the permit is granted the
//! transaction runs to completion whether or not the caller keeps awaiting.

use std::sync::Arc;

use rusqlite::Connection;
use tokio::task::JoinHandle;

use crate::database::Database;
use crate::error::StoreError;

async fn join<T, E>(task: JoinHandle<Result<T, E>>) -> Result<T, E>
where
    E: From<StoreError>,
{
    match task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(StoreError::Io(std::io::Error::other(format!(
            "blocking database task cancelled: {e}"
        )))
        .into()),
    }
}

impl Database {
    /// Async form of [`Database::write`].
    ///
    /// # Errors
    ///
    /// As [`Database::write`]; `LockTimeout` if no write slot frees up
    /// within the write timeout, `HandleClosed` if the handle closes while
    /// queued.
    pub async fn write_async<T, E, F>(self: &Arc<Self>, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let wait = self.options().write_timeout;
        let gate = Arc::clone(&self.write_gate);
        let permit = match tokio::time::timeout(wait, gate.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(StoreError::HandleClosed.into()),
            Err(_elapsed) => {
                return Err(StoreError::LockTimeout(format!("async write slot after {wait:?}")).into())
            }
        };

        let db = Arc::clone(self);
        join(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            db.write(f)
        }))
        .await
    }

    /// Async form of [`Database::read`].
    ///
    /// # Errors
    ///
    /// As [`Database::read`].
    pub async fn read_async<T, E, F>(self: &Arc<Self>, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let db = Arc::clone(self);
        join(tokio::task::spawn_blocking(move || db.read(f))).await
    }
}
