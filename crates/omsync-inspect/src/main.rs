//! omsync-inspect: opens a database the way an application would and prints
//! its journal mode and migration record as JSON.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use omsync_db::{AppliedMigration, Database, StoreError};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize)]
struct Status {
    path: PathBuf,
    read_only: bool,
    journal_mode: String,
    migrations: Vec<AppliedMigration>,
}

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("OMSYNC_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn inspect(config: &config::Config) -> Result<Status, StoreError> {
    let path = match &config.database.path {
        Some(path) => path.clone(),
        None => omsync_db::default_database_path(config.database.name.as_deref())?,
    };

    let db = Database::open(&path, config.database.open_options())?;
    let result = db.read(|conn| {
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let migrations = omsync_db::read_record(conn)?;
        Ok::<_, StoreError>((journal_mode, migrations))
    });
    db.close();

    let (journal_mode, migrations) = result?;
    Ok(Status {
        path: db.path().to_path_buf(),
        read_only: db.is_read_only(),
        journal_mode,
        migrations,
    })
}

fn main() -> ExitCode {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("omsync.toml"));

    let config = match config::load_config(selected_config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("omsync-inspect: {e}");
            return ExitCode::FAILURE;
        }
    };

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let status = match inspect(&config) {
        Ok(status) => status,
        Err(e) => {
            tracing::error!(error = %e, code = ?e.code(), "failed to inspect database");
            return ExitCode::FAILURE;
        }
    };

    match serde_json::to_string_pretty(&status) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode status");
            ExitCode::FAILURE
        }
    }
}
