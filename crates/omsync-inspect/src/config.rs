//! Inspector configuration loading from file and environment variables.

use std::path::PathBuf;
use std::time::Duration;

use omsync_db::{OpenOptions, StatementTrace};
use serde::Deserialize;
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file. Unset means the platform default
    /// under the `support` data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Database name used to derive the default path (`<name>.db.sqlite`).
    #[serde(default)]
    pub name: Option<String>,

    /// Open without write access.
    #[serde(default = "default_read_only")]
    pub read_only: bool,

    /// SQLite busy timeout, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum wait for the writer connection, in milliseconds.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Log executed statements.
    #[serde(default)]
    pub trace_statements: bool,

    /// Include bound parameter values in traced statements.
    #[serde(default)]
    pub trace_arguments: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "omsync_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_read_only() -> bool {
    true
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            name: None,
            read_only: default_read_only(),
            busy_timeout_ms: default_busy_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            trace_statements: false,
            trace_arguments: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl DatabaseConfig {
    /// Builds the open options this configuration describes.
    pub fn open_options(&self) -> OpenOptions {
        let mut options = OpenOptions {
            read_only: self.read_only,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            ..OpenOptions::default()
        };
        if self.trace_statements {
            let trace = StatementTrace::new(omsync_db::log_statement);
            options.trace = Some(if self.trace_arguments {
                trace.with_arguments()
            } else {
                trace
            });
        }
        options
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

fn parse_flag(value: &str) -> bool {
    value == "true" || value == "1"
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `OMSYNC_DB_PATH` overrides `database.path`
/// - `OMSYNC_DB_READ_ONLY` overrides `database.read_only`
/// - `OMSYNC_BUSY_TIMEOUT_MS` overrides `database.busy_timeout_ms`
/// - `SQL_TRACE` (any value) turns on `database.trace_statements`
/// - `OMSYNC_LOG_LEVEL` overrides `logging.level`
/// - `OMSYNC_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(db_path) = std::env::var("OMSYNC_DB_PATH") {
        config.database.path = Some(PathBuf::from(db_path));
    }
    if let Ok(read_only) = std::env::var("OMSYNC_DB_READ_ONLY") {
        config.database.read_only = parse_flag(&read_only);
    }
    if let Ok(timeout) = std::env::var("OMSYNC_BUSY_TIMEOUT_MS") {
        if let Ok(parsed) = timeout.parse() {
            config.database.busy_timeout_ms = parsed;
        }
    }
    if std::env::var_os(omsync_db::TRACE_ENV_VAR).is_some() {
        config.database.trace_statements = true;
    }
    if let Ok(level) = std::env::var("OMSYNC_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("OMSYNC_LOG_JSON") {
        config.logging.json = parse_flag(&json);
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").expect("empty config should parse");
        assert!(config.database.read_only, "inspection is read-only by default");
        assert_eq!(config.database.busy_timeout_ms, 5_000);
        assert!(config.database.path.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn database_section_maps_to_open_options() {
        let config: Config = toml::from_str(
            r#"
            [database]
            path = "/var/lib/omsync/db.sqlite"
            read_only = false
            busy_timeout_ms = 250
            trace_statements = true
            "#,
        )
        .expect("config should parse");

        let options = config.database.open_options();
        assert!(!options.read_only);
        assert_eq!(options.busy_timeout, Duration::from_millis(250));
        let trace = options.trace.expect("trace should be configured");
        assert!(!trace.expand_arguments, "arguments stay hidden unless asked for");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let missing = dir.path().join("absent.toml");
        let config = load_config(missing.to_str()).expect("missing file is not an error");
        assert_eq!(config.logging.level, default_log_level());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[database\npath = ").expect("should write file");
        let err = load_config(path.to_str()).expect_err("malformed toml should fail");
        assert!(matches!(err, ConfigError::Parse(_)), "got {err:?}");
    }
}
