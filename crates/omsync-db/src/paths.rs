//! Default database locations.

use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;

/// Subfolder of the platform data directory that holds database files.
pub const SUPPORT_DIR: &str = "support";

/// Returns the default database path, creating its directory if needed.
///
/// The file lives in the platform's application-support equivalent, under
/// [`SUPPORT_DIR`]: `db.sqlite` when `name` is `None`, `<name>.db.sqlite`
/// otherwise.
///
/// # Errors
///
/// Returns an I/O error if no home directory can be determined or the
/// directory cannot be created.
pub fn default_database_path(name: Option<&str>) -> io::Result<PathBuf> {
    let dirs = ProjectDirs::from("com", "omsync", "omsync").ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "could not determine the platform data directory",
        )
    })?;
    database_path_in(dirs.data_dir(), name)
}

/// Like [`default_database_path`] with an explicit base directory.
pub fn database_path_in(base: &Path, name: Option<&str>) -> io::Result<PathBuf> {
    let dir = base.join(SUPPORT_DIR);
    std::fs::create_dir_all(&dir)?;
    Ok(dir.join(file_name(name)))
}

fn file_name(name: Option<&str>) -> String {
    match name {
        Some(name) if !name.is_empty() => format!("{name}.db.sqlite"),
        _ => "db.sqlite".to_string(),
    }
}
