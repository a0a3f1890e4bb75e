//! Explicit record mapping and bulk write helpers.
//!
//! Each entity type implements [`Record`] to describe its table and how it
//! converts to and from a row. The free functions operate on a connection
//! that is already inside a transaction; the `Database` methods wrap each
//! call in its own write (or read) transaction.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};

use crate::database::Database;
use crate::error::StoreError;

/// Upper bound on ids bound into a single statement.
const MAX_IDS_PER_STATEMENT: usize = 500;

/// A type stored as one row of one table with an integer primary key.
///
/// `from_row` receives rows selected as the id column followed by
/// [`Record::COLUMNS`] in declaration order.
pub trait Record: Sized {
    /// Table name.
    const TABLE: &'static str;

    /// Primary key column.
    const ID_COLUMN: &'static str = "id";

    /// Every non-key column, in the order `to_row` produces values.
    const COLUMNS: &'static [&'static str];

    /// The primary key, `None` until inserted.
    fn id(&self) -> Option<i64>;

    /// Stores the key assigned on insert.
    fn set_id(&mut self, id: i64);

    /// Column values, aligned with [`Record::COLUMNS`].
    fn to_row(&self) -> Vec<Value>;

    /// Builds a record from `id, COLUMNS...`.
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// One `column = value` pair of a bulk update.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// Column to set.
    pub column: String,
    /// New value; `Value::Null` clears the column.
    pub value: Value,
}

impl Assignment {
    /// Creates an assignment.
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

pub(crate) fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn select_columns<R: Record>() -> String {
    std::iter::once(R::ID_COLUMN)
        .chain(R::COLUMNS.iter().copied())
        .map(quote_identifier)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Inserts one record and returns it with its assigned id.
///
/// A record that already carries an id is inserted with that id.
///
/// # Errors
///
/// Returns `StoreError` on SQL failure, including constraint violations,
/// or when `to_row` does not match [`Record::COLUMNS`].
pub fn insert<R: Record>(conn: &Connection, mut record: R) -> Result<R, StoreError> {
    let mut values = record.to_row();
    if values.len() != R::COLUMNS.len() {
        return Err(rusqlite::Error::InvalidParameterCount(values.len(), R::COLUMNS.len()).into());
    }

    let mut columns: Vec<&str> = R::COLUMNS.to_vec();
    if let Some(id) = record.id() {
        columns.insert(0, R::ID_COLUMN);
        values.insert(0, Value::Integer(id));
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_identifier(R::TABLE),
        columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", "),
        placeholders(columns.len()),
    );
    conn.prepare_cached(&sql)?
        .execute(params_from_iter(values.iter()))?;

    record.set_id(conn.last_insert_rowid());
    Ok(record)
}

/// Inserts every record, returning them with assigned ids.
///
/// # Errors
///
/// Stops at the first failing insert; see [`insert`].
pub fn insert_all<R: Record>(conn: &Connection, records: Vec<R>) -> Result<Vec<R>, StoreError> {
    records.into_iter().map(|r| insert(conn, r)).collect()
}

/// Deletes the rows with the given ids and returns how many were removed.
///
/// # Errors
///
/// Returns `StoreError` on SQL failure.
pub fn delete_all<R: Record>(conn: &Connection, ids: &[i64]) -> Result<usize, StoreError> {
    let mut deleted = 0;
    for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
        let sql = format!(
            "DELETE FROM {} WHERE {} IN ({})",
            quote_identifier(R::TABLE),
            quote_identifier(R::ID_COLUMN),
            placeholders(chunk.len()),
        );
        deleted += conn.execute(&sql, params_from_iter(chunk.iter()))?;
    }
    Ok(deleted)
}

/// Applies `assignments` to the rows with the given ids and returns how
/// many rows changed.
///
/// # Errors
///
/// Returns `StoreError::UnknownColumn` if an assignment names a column the
/// record type does not declare, otherwise `StoreError` on SQL failure. An
/// empty id list returns 0 before any validation.
pub fn update_all<R: Record>(
    conn: &Connection,
    ids: &[i64],
    assignments: &[Assignment],
) -> Result<usize, StoreError> {
    if ids.is_empty() {
        return Ok(0);
    }
    check_columns::<R>(assignments)?;
    if assignments.is_empty() {
        return Ok(0);
    }

    let set_clause = assignments
        .iter()
        .map(|a| format!("{} = ?", quote_identifier(&a.column)))
        .collect::<Vec<_>>()
        .join(", ");

    let mut updated = 0;
    for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
        let sql = format!(
            "UPDATE {} SET {set_clause} WHERE {} IN ({})",
            quote_identifier(R::TABLE),
            quote_identifier(R::ID_COLUMN),
            placeholders(chunk.len()),
        );
        let values = assignments
            .iter()
            .map(|a| a.value.clone())
            .chain(chunk.iter().map(|&id| Value::Integer(id)));
        updated += conn.execute(&sql, params_from_iter(values))?;
    }
    Ok(updated)
}

/// Loads the records with the given ids, ordered by id within each batch.
/// Missing ids are skipped.
///
/// # Errors
///
/// Returns `StoreError` on SQL or row conversion failure.
pub fn fetch_all<R: Record>(conn: &Connection, ids: &[i64]) -> Result<Vec<R>, StoreError> {
    let mut records = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
        let sql = format!(
            "SELECT {} FROM {} WHERE {id} IN ({}) ORDER BY {id}",
            select_columns::<R>(),
            quote_identifier(R::TABLE),
            placeholders(chunk.len()),
            id = quote_identifier(R::ID_COLUMN),
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| R::from_row(row))?;
        for row in rows {
            records.push(row?);
        }
    }
    Ok(records)
}

fn check_columns<R: Record>(assignments: &[Assignment]) -> Result<(), StoreError> {
    match assignments
        .iter()
        .find(|a| !R::COLUMNS.contains(&a.column.as_str()))
    {
        Some(bad) => Err(StoreError::UnknownColumn {
            table: R::TABLE,
            column: bad.column.clone(),
        }),
        None => Ok(()),
    }
}

impl Database {
    /// Inserts `records` in one write transaction and returns them with
    /// their newly assigned ids.
    ///
    /// # Errors
    ///
    /// Any failure rolls back the whole batch.
    pub fn insert_all<R: Record>(&self, records: Vec<R>) -> Result<Vec<R>, StoreError> {
        self.check_usable(true)?;
        if records.is_empty() {
            return Ok(records);
        }
        self.write(|conn| insert_all(conn, records))
    }

    /// Deletes the records with `ids` in one write transaction.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on failure; nothing is deleted in that case.
    pub fn delete_all<R: Record>(&self, ids: &[i64]) -> Result<usize, StoreError> {
        self.check_usable(true)?;
        if ids.is_empty() {
            return Ok(0);
        }
        self.write(|conn| delete_all::<R>(conn, ids))
    }

    /// Applies `assignments` to the records with `ids` in one write
    /// transaction. An empty id list performs no write and returns 0
    /// without validating the assignments.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::HandleClosed` or `StoreError::ReadOnly` when the
    /// handle cannot write, `StoreError::UnknownColumn` for undeclared
    /// columns, otherwise `StoreError` on failure; nothing is updated in
    /// that case.
    pub fn update_all<R: Record>(
        &self,
        ids: &[i64],
        assignments: &[Assignment],
    ) -> Result<usize, StoreError> {
        self.check_usable(true)?;
        if ids.is_empty() {
            return Ok(0);
        }
        check_columns::<R>(assignments)?;
        if assignments.is_empty() {
            return Ok(0);
        }
        self.write(|conn| update_all::<R>(conn, ids, assignments))
    }

    /// Loads the records with `ids` from a read snapshot.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on failure.
    pub fn fetch_all<R: Record>(&self, ids: &[i64]) -> Result<Vec<R>, StoreError> {
        self.check_usable(false)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.read(|conn| fetch_all::<R>(conn, ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Tag {
        id: Option<i64>,
        label: String,
        weight: Option<i64>,
    }

    impl Record for Tag {
        const TABLE: &'static str = "tags";
        const COLUMNS: &'static [&'static str] = &["label", "weight"];

        fn id(&self) -> Option<i64> {
            self.id
        }

        fn set_id(&mut self, id: i64) {
            self.id = Some(id);
        }

        fn to_row(&self) -> Vec<Value> {
            vec![self.label.clone().into(), self.weight.into()]
        }

        fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
            Ok(Self {
                id: row.get(0)?,
                label: row.get(1)?,
                weight: row.get(2)?,
            })
        }
    }

    fn tag(label: &str) -> Tag {
        Tag {
            id: None,
            label: label.to_string(),
            weight: None,
        }
    }

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        conn.execute_batch(
            "CREATE TABLE tags (id INTEGER PRIMARY KEY, label TEXT NOT NULL UNIQUE, weight INTEGER)",
        )
        .expect("should create table");
        conn
    }

    #[test]
    fn insert_keeps_explicit_id() {
        let conn = test_db();
        let inserted = insert(
            &conn,
            Tag {
                id: Some(40),
                ..tag("fixed")
            },
        )
        .expect("insert should succeed");
        assert_eq!(inserted.id, Some(40));

        let next = insert(&conn, tag("next")).expect("insert should succeed");
        assert_eq!(next.id, Some(41));
    }

    #[test]
    fn update_sets_null_and_values() {
        let conn = test_db();
        let tags = insert_all(&conn, vec![tag("a"), tag("b"), tag("c")]).expect("insert should succeed");
        let ids: Vec<i64> = tags.iter().filter_map(|t| t.id).collect();

        let updated = update_all::<Tag>(&conn, &ids[..2], &[Assignment::new("weight", 7_i64)])
            .expect("update should succeed");
        assert_eq!(updated, 2);

        let cleared = update_all::<Tag>(&conn, &ids[..1], &[Assignment::new("weight", Value::Null)])
            .expect("update should succeed");
        assert_eq!(cleared, 1);

        let fetched = fetch_all::<Tag>(&conn, &ids).expect("fetch should succeed");
        let weights: Vec<Option<i64>> = fetched.iter().map(|t| t.weight).collect();
        assert_eq!(weights, vec![None, Some(7), None]);
    }

    #[test]
    fn update_rejects_unknown_column() {
        let conn = test_db();
        let err = update_all::<Tag>(&conn, &[1], &[Assignment::new("label; DROP TABLE tags", "x".to_string())])
            .expect_err("unknown column should be rejected");
        assert!(matches!(err, StoreError::UnknownColumn { table: "tags", .. }), "got {err:?}");
    }

    #[test]
    fn update_with_no_ids_skips_column_check() {
        let conn = test_db();
        let updated = update_all::<Tag>(&conn, &[], &[Assignment::new("missing", 1_i64)])
            .expect("empty id list should short-circuit");
        assert_eq!(updated, 0);
    }

    #[test]
    fn delete_spans_multiple_batches() {
        let conn = test_db();
        let tags: Vec<Tag> = (0..1_200).map(|i| tag(&format!("tag-{i}"))).collect();
        let tags = insert_all(&conn, tags).expect("insert should succeed");
        let ids: Vec<i64> = tags.iter().filter_map(|t| t.id).collect();

        assert_eq!(fetch_all::<Tag>(&conn, &ids).expect("fetch").len(), 1_200);
        assert_eq!(delete_all::<Tag>(&conn, &ids).expect("delete"), 1_200);
        assert!(fetch_all::<Tag>(&conn, &ids).expect("fetch").is_empty());
    }

    #[test]
    fn mismatched_row_width_is_rejected() {
        struct Broken;
        impl Record for Broken {
            const TABLE: &'static str = "tags";
            const COLUMNS: &'static [&'static str] = &["label", "weight"];
            fn id(&self) -> Option<i64> {
                None
            }
            fn set_id(&mut self, _id: i64) {}
            fn to_row(&self) -> Vec<Value> {
                vec![Value::Text("only one".into())]
            }
            fn from_row(_row: &Row<'_>) -> rusqlite::Result<Self> {
                Ok(Broken)
            }
        }

        let conn = test_db();
        assert!(insert(&conn, Broken).is_err());
    }
}
