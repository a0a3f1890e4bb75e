//! Statement tracing hook.
//!
//! Installed through `sqlite3_trace_v2` with `SQLITE_TRACE_STMT`. The sink
//! receives the statement text as written, with placeholders in place of
//! bound values. Argument expansion is only performed when explicitly
//! enabled, since parameter values may carry user data.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};

use rusqlite::{ffi, Connection};

/// Environment variable that switches statement tracing on.
pub const TRACE_ENV_VAR: &str = "SQL_TRACE";

/// Receives the text of every executed statement.
pub type TraceSink = fn(&str);

/// Statement tracing configuration.
#[derive(Debug, Clone, Copy)]
pub struct StatementTrace {
    /// Where statement text goes.
    pub sink: TraceSink,
    /// Render bound parameter values into the traced text.
    pub expand_arguments: bool,
}

impl StatementTrace {
    /// A trace that forwards statements to `sink` without argument values.
    pub fn new(sink: TraceSink) -> Self {
        Self {
            sink,
            expand_arguments: false,
        }
    }

    /// Enables rendering of bound parameter values.
    pub fn with_arguments(mut self) -> Self {
        self.expand_arguments = true;
        self
    }

    /// Returns a [`tracing`]-backed trace when `SQL_TRACE` is set.
    pub fn from_env() -> Option<Self> {
        std::env::var_os(TRACE_ENV_VAR).map(|_| Self::new(log_statement))
    }

    /// Installs the trace on `conn`.
    pub(crate) fn install(&self, conn: &Connection) -> rusqlite::Result<()> {
        let callback: unsafe extern "C" fn(c_uint, *mut c_void, *mut c_void, *mut c_void) -> c_int =
            if self.expand_arguments {
                trace_expanded
            } else {
                trace_statement
            };

        // SAFETY: the handle is live for the duration of the call, and the
        // context pointer is a plain `fn` pointer with 'static lifetime.
        let rc = unsafe {
            ffi::sqlite3_trace_v2(
                conn.handle(),
                ffi::SQLITE_TRACE_STMT as c_uint,
                Some(callback),
                self.sink as *const () as *mut c_void,
            )
        };
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(rusqlite::Error::SqliteFailure(
                ffi::Error::new(rc),
                Some("failed to install statement trace".to_string()),
            ))
        }
    }
}

/// Default sink: a debug event on the `omsync_db::sql` target.
pub fn log_statement(sql: &str) {
    tracing::debug!(target: "omsync_db::sql", "{sql}");
}

/// # Safety
///
/// `ctx` must be a `TraceSink` cast to a pointer, and `x` the unexpanded
/// statement text as documented for `SQLITE_TRACE_STMT`.
unsafe extern "C" fn trace_statement(
    mask: c_uint,
    ctx: *mut c_void,
    _stmt: *mut c_void,
    x: *mut c_void,
) -> c_int {
    if mask != ffi::SQLITE_TRACE_STMT as c_uint || x.is_null() {
        return 0;
    }
    let sink = std::mem::transmute::<*mut c_void, TraceSink>(ctx);
    let text = CStr::from_ptr(x as *const c_char).to_string_lossy();
    sink(&text);
    0
}

/// # Safety
///
/// Same contract as [`trace_statement`]; `stmt` must be the prepared
/// statement handed to the callback.
unsafe extern "C" fn trace_expanded(
    mask: c_uint,
    ctx: *mut c_void,
    stmt: *mut c_void,
    x: *mut c_void,
) -> c_int {
    if mask != ffi::SQLITE_TRACE_STMT as c_uint || stmt.is_null() {
        return 0;
    }
    let expanded = ffi::sqlite3_expanded_sql(stmt as *mut ffi::sqlite3_stmt);
    if expanded.is_null() {
        return trace_statement(mask, ctx, stmt, x);
    }
    let sink = std::mem::transmute::<*mut c_void, TraceSink>(ctx);
    let text = CStr::from_ptr(expanded).to_string_lossy().into_owned();
    ffi::sqlite3_free(expanded as *mut c_void);
    sink(&text);
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static PLAIN: Mutex<Vec<String>> = Mutex::new(Vec::new());
    static EXPANDED: Mutex<Vec<String>> = Mutex::new(Vec::new());

    fn record_plain(sql: &str) {
        PLAIN.lock().unwrap().push(sql.to_string());
    }

    fn record_expanded(sql: &str) {
        EXPANDED.lock().unwrap().push(sql.to_string());
    }

    #[test]
    fn trace_hides_bound_values_by_default() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        StatementTrace::new(record_plain)
            .install(&conn)
            .expect("trace should install");

        conn.execute_batch("CREATE TABLE secrets (value TEXT)")
            .expect("should create table");
        conn.execute("INSERT INTO secrets (value) VALUES (?1)", ["hunter2"])
            .expect("should insert");

        let seen = PLAIN.lock().unwrap().clone();
        assert!(
            seen.iter().any(|s| s.contains("INSERT INTO secrets")),
            "insert should be traced: {seen:?}"
        );
        assert!(
            seen.iter().all(|s| !s.contains("hunter2")),
            "bound value must not reach the sink: {seen:?}"
        );
    }

    #[test]
    fn trace_expands_arguments_when_enabled() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        StatementTrace::new(record_expanded)
            .with_arguments()
            .install(&conn)
            .expect("trace should install");

        conn.execute_batch("CREATE TABLE visible (value TEXT)")
            .expect("should create table");
        conn.execute("INSERT INTO visible (value) VALUES (?1)", ["shown"])
            .expect("should insert");

        let seen = EXPANDED.lock().unwrap().clone();
        assert!(
            seen.iter().any(|s| s.contains("'shown'")),
            "expanded statement should carry the value: {seen:?}"
        );
    }
}
