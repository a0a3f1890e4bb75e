#![allow(dead_code)]

use std::path::PathBuf;

use omsync_db::rusqlite::types::Value;
use omsync_db::rusqlite::Row;
use omsync_db::{Migration, Migrator, Record};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub id: Option<i64>,
    pub title: String,
    pub body: Option<String>,
}

impl Note {
    pub fn new(title: &str) -> Self {
        Self {
            id: None,
            title: title.to_string(),
            body: None,
        }
    }
}

impl Record for Note {
    const TABLE: &'static str = "notes";
    const COLUMNS: &'static [&'static str] = &["title", "body"];

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn to_row(&self) -> Vec<Value> {
        vec![self.title.clone().into(), self.body.clone().into()]
    }

    fn from_row(row: &Row<'_>) -> omsync_db::rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            body: row.get(2)?,
        })
    }
}

pub fn notes_migrator() -> Migrator {
    Migrator::new()
        .register(Migration::sql(
            "001_notes",
            "CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT NOT NULL, body TEXT);",
        ))
        .register(Migration::sql(
            "002_counter",
            "CREATE TABLE counter (id INTEGER PRIMARY KEY, value INTEGER NOT NULL);
             INSERT INTO counter (id, value) VALUES (1, 0);",
        ))
}

pub fn temp_db_path() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("support").join("db.sqlite");
    (dir, path)
}
