//! Versioned migration runner.
//!
//! Migrations are registered in order on a [`Migrator`] and applied on
//! startup, tracked by the `_omsync_migrations` table. Each migration runs
//! exactly once, in its own write transaction together with the row that
//! records it. A database whose recorded history is not a prefix of the
//! registered sequence was written by a newer build and is refused.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::database::{Database, DatabaseHandle};
use crate::error::StoreError;
use crate::pool::OpenOptions;
use crate::records::quote_identifier;

/// Reserved table holding the migration record.
pub const MIGRATIONS_TABLE: &str = "_omsync_migrations";

const BOOTSTRAP_NAME: &str = "_omsync_migrations_bootstrap";

type ApplyFn = dyn Fn(&Connection) -> Result<(), StoreError> + Send + Sync;

/// A single named schema change.
pub struct Migration {
    name: String,
    apply: Box<ApplyFn>,
}

impl Migration {
    /// A migration that runs arbitrary code inside its transaction.
    pub fn new<F>(name: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&Connection) -> Result<(), StoreError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            apply: Box::new(apply),
        }
    }

    /// A migration that executes a SQL batch, usually from `include_str!`.
    pub fn sql(name: impl Into<String>, sql: &'static str) -> Self {
        Self::new(name, move |conn| {
            conn.execute_batch(sql).map_err(StoreError::from)
        })
    }

    /// The migration's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// One row of the migration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    /// Migration name.
    pub name: String,
    /// When the migration was committed.
    pub applied_at: DateTime<Utc>,
}

/// Outcome of [`Migrator::migrate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Migrations applied by this call, in order.
    pub applied: Vec<String>,
    /// Migrations left unapplied (read-only handles only).
    pub pending: Vec<String>,
    /// Whether the database was erased because its schema changed.
    pub erased: bool,
}

/// Reads the migration record. Returns an empty list when the tracking
/// table does not exist yet.
///
/// # Errors
///
/// Returns `StoreError` on SQL failure or an unreadable timestamp.
pub fn read_record(conn: &Connection) -> Result<Vec<AppliedMigration>, StoreError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [MIGRATIONS_TABLE],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT name, applied_at FROM {MIGRATIONS_TABLE} ORDER BY id"
    ))?;
    let rows = stmt.query_map([], |row| {
        let name: String = row.get(0)?;
        let applied_at: String = row.get(1)?;
        let applied_at = NaiveDateTime::parse_from_str(&applied_at, "%Y-%m-%d %H:%M:%S")
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
            })?
            .and_utc();
        Ok(AppliedMigration { name, applied_at })
    })?;

    let mut record = Vec::new();
    for row in rows {
        record.push(row?);
    }
    Ok(record)
}

/// SHA-256 over the schema objects, excluding SQLite internals and the
/// migration record.
fn schema_fingerprint(conn: &Connection) -> Result<String, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT type, name, tbl_name, COALESCE(sql, '') FROM sqlite_master
         WHERE name NOT LIKE 'sqlite_%' AND name <> ?1
         ORDER BY type, name",
    )?;
    let mut rows = stmt.query([MIGRATIONS_TABLE])?;

    let mut hasher = Sha256::new();
    while let Some(row) = rows.next()? {
        for i in 0..4 {
            hasher.update(row.get::<_, String>(i)?.as_bytes());
            hasher.update([0u8]);
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Drops every schema object, including the migration record.
fn erase_schema(conn: &Connection) -> Result<(), StoreError> {
    // Dropped tables are checked at commit, once nothing references them.
    conn.execute_batch("PRAGMA defer_foreign_keys = ON;")?;

    // Virtual tables go before plain ones so their shadow tables vanish
    // with them.
    let objects: Vec<(String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT type, name FROM sqlite_master
             WHERE name NOT LIKE 'sqlite_%' AND type IN ('view', 'trigger', 'table')
             ORDER BY CASE type WHEN 'view' THEN 0 WHEN 'trigger' THEN 1 ELSE 2 END,
                      COALESCE(sql, '') LIKE 'CREATE VIRTUAL TABLE%' DESC",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<_, _>>()?
    };

    for (kind, name) in objects {
        conn.execute_batch(&format!(
            "DROP {} IF EXISTS {};",
            kind.to_ascii_uppercase(),
            quote_identifier(&name)
        ))?;
    }
    Ok(())
}

/// An ordered set of migrations.
#[derive(Debug, Default)]
pub struct Migrator {
    migrations: Vec<Migration>,
    erase_on_schema_change: bool,
}

impl Migrator {
    /// An empty migrator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a migration.
    ///
    /// # Panics
    ///
    /// Panics if a migration with the same name is already registered.
    pub fn register(mut self, migration: Migration) -> Self {
        assert!(
            self.migrations.iter().all(|m| m.name != migration.name),
            "duplicate migration name '{}'",
            migration.name
        );
        self.migrations.push(migration);
        self
    }

    /// Development convenience: erase and rebuild the database whenever
    /// the registered migrations no longer produce the schema on disk.
    ///
    /// Only honoured in builds with debug assertions; release builds log a
    /// warning and ignore it. This destroys data.
    pub fn erase_on_schema_change(mut self, enabled: bool) -> Self {
        self.erase_on_schema_change = enabled;
        self
    }

    /// Names of all registered migrations, in order.
    pub fn names(&self) -> Vec<&str> {
        self.migrations.iter().map(|m| m.name.as_str()).collect()
    }

    fn erase_enabled(&self) -> bool {
        if !self.erase_on_schema_change {
            return false;
        }
        if cfg!(debug_assertions) {
            true
        } else {
            tracing::warn!("erase_on_schema_change is ignored in release builds");
            false
        }
    }

    fn is_prefix(&self, stored: &[AppliedMigration]) -> bool {
        stored.len() <= self.migrations.len()
            && stored
                .iter()
                .zip(&self.migrations)
                .all(|(s, m)| s.name == m.name)
    }

    fn check_prefix(&self, stored: &[AppliedMigration]) -> Result<(), StoreError> {
        if self.is_prefix(stored) {
            return Ok(());
        }
        Err(StoreError::IncompatibleSchema {
            stored: stored.iter().map(|m| m.name.clone()).collect(),
            known: self.names().into_iter().map(str::to_string).collect(),
        })
    }

    /// Returns the recorded migration history.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on failure to read the record.
    pub fn applied_migrations(&self, db: &Database) -> Result<Vec<AppliedMigration>, StoreError> {
        db.read(read_record)
    }

    /// Names of registered migrations the database has not applied yet.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::IncompatibleSchema` if the database is newer
    /// than this migrator.
    pub fn pending_migrations(&self, db: &Database) -> Result<Vec<String>, StoreError> {
        let stored = db.read(read_record)?;
        self.check_prefix(&stored)?;
        Ok(self.migrations[stored.len()..]
            .iter()
            .map(|m| m.name.clone())
            .collect())
    }

    /// Whether the database records migrations this migrator does not know.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on failure to read the record.
    pub fn has_been_superseded(&self, db: &Database) -> Result<bool, StoreError> {
        let stored = db.read(read_record)?;
        Ok(!self.is_prefix(&stored))
    }

    /// Compares the on-disk schema with a scratch database migrated to the
    /// same point.
    fn schema_changed(&self, db: &Database, stored: &[AppliedMigration]) -> Result<bool, StoreError> {
        if !self.is_prefix(stored) {
            return Ok(true);
        }

        let scratch = Connection::open_in_memory()?;
        for hook in &db.options().hooks {
            hook.run(&scratch)?;
        }
        for migration in &self.migrations[..stored.len()] {
            (migration.apply)(&scratch)?;
        }
        let expected = schema_fingerprint(&scratch)?;
        let actual = db.read(schema_fingerprint)?;
        Ok(expected != actual)
    }

    /// Applies the migration at `index` unless another process already did.
    fn apply_one(&self, conn: &Connection, index: usize) -> Result<bool, StoreError> {
        let migration = &self.migrations[index];
        let current = read_record(conn)?;
        self.check_prefix(&current)?;

        if current.len() > index {
            tracing::debug!(
                migration = migration.name.as_str(),
                "migration already applied, skipping"
            );
            return Ok(false);
        }
        if current.len() < index {
            // The record shrank underneath us; applying out of order would
            // leave a gap in the history.
            return Err(StoreError::IncompatibleSchema {
                stored: current.into_iter().map(|m| m.name).collect(),
                known: self.names().into_iter().map(str::to_string).collect(),
            });
        }

        tracing::info!(migration = migration.name.as_str(), "applying migration");

        let failed = |source: StoreError| StoreError::MigrationFailed {
            name: migration.name.clone(),
            source: Box::new(source),
        };
        (migration.apply)(conn).map_err(failed)?;
        conn.execute(
            &format!("INSERT INTO {MIGRATIONS_TABLE} (name) VALUES (?1)"),
            [migration.name.as_str()],
        )
        .map_err(|e| failed(e.into()))?;

        Ok(true)
    }

    /// Brings the database up to the last registered migration.
    ///
    /// The record is checked before anything is written: a history that is
    /// not a prefix of the registered sequence fails with
    /// `IncompatibleSchema` and leaves the file untouched. Each pending
    /// migration then commits atomically with its record row. On a
    /// read-only handle nothing is applied and the remaining migrations are
    /// reported as pending.
    ///
    /// # Errors
    ///
    /// - `StoreError::IncompatibleSchema` if the database is newer.
    /// - `StoreError::MigrationFailed` if a step fails; earlier steps stay
    ///   committed.
    /// - Any error from acquiring the writer.
    pub fn migrate(&self, db: &Database) -> Result<MigrationReport, StoreError> {
        let mut report = MigrationReport::default();
        let mut stored = db.read(read_record)?;

        if db.is_read_only() {
            self.check_prefix(&stored)?;
            report.pending = self.migrations[stored.len()..]
                .iter()
                .map(|m| m.name.clone())
                .collect();
            if !report.pending.is_empty() {
                tracing::warn!(
                    pending = report.pending.len(),
                    "read-only database has unapplied migrations"
                );
            }
            return Ok(report);
        }

        if self.erase_enabled() && self.schema_changed(db, &stored)? {
            tracing::warn!(path = %db.path().display(), "schema changed, erasing database");
            db.write(erase_schema)?;
            stored.clear();
            report.erased = true;
        } else {
            self.check_prefix(&stored)?;
        }

        db.write(|conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
                );"
            ))
            .map_err(|e| StoreError::MigrationFailed {
                name: BOOTSTRAP_NAME.to_string(),
                source: Box::new(e.into()),
            })
        })?;

        for index in stored.len()..self.migrations.len() {
            if db.write(|conn| self.apply_one(conn, index))? {
                report.applied.push(self.migrations[index].name.clone());
            }
        }

        Ok(report)
    }
}

/// Opens `path` and brings it up to date with `migrator`.
///
/// The handle is closed again if migration fails, so startup can abort
/// without a half-initialised database in circulation.
///
/// # Errors
///
/// Any error from [`Database::open`] or [`Migrator::migrate`].
pub fn open_database(
    path: impl AsRef<Path>,
    options: OpenOptions,
    migrator: &Migrator,
) -> Result<DatabaseHandle, StoreError> {
    let db = Database::open(path, options)?;
    match migrator.migrate(&db) {
        Ok(report) => {
            if !report.applied.is_empty() {
                tracing::info!(count = report.applied.len(), "applied database migrations");
            }
            Ok(db)
        }
        Err(e) => {
            db.close();
            Err(e)
        }
    }
}
