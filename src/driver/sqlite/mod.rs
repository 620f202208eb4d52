//! `SQLite` Reference Driver
//!
//! This module implements every driver trait on top of `rusqlite`, so the
//! guard layer can be exercised end to end without an external server.
//!
//! # Features
//! - File-based data sources (`/path/to/db.sqlite`)
//! - Shared in-memory data sources (kept alive by an anchor connection)
//! - Auto-commit on/off with lazily opened transactions
//! - Read-only connections via `PRAGMA query_only`
//! - Batches for plain and prepared statements
//! - Generated keys from `last_insert_rowid()`
//!
//! # Implementation Notes
//! - Uses `rusqlite` (synchronous driver, no async needed)
//! - Result rows are materialized when a query executes; cursors hold no
//!   borrow of the connection
//! - Statements hold the connection session, so closing the connection makes
//!   later statement calls fail instead of dangling
//! - Shared in-memory databases use shared-cache mode: a connection with an
//!   open write transaction locks the tables it wrote for the other connections

use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{OpenFlags, ToSql};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::driver::{
    Blob, Column, Connection, DataSource, Handle, PreparedStatement, ResultSet, Statement,
    StatementHandle, Value,
};
use crate::error::{LintError, Result};

const ENGINE: &str = "sqlite";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Column label of the cursor returned by `get_generated_keys`
pub const GENERATED_KEY_COLUMN: &str = "generated_key";

/// Highest bindable parameter index (`SQLITE_MAX_VARIABLE_NUMBER` default)
pub const MAX_PARAMETER_INDEX: usize = 32_766;

static NEXT_MEMORY_DB: AtomicU64 = AtomicU64::new(0);

fn driver_error(context: &str, e: impl std::fmt::Display) -> LintError {
    LintError::driver(ENGINE, format!("{context}: {e}"))
}

/// `SQLite` data source
pub struct SqliteDataSource {
    path: String,
    flags: OpenFlags,
    anchor: Option<Mutex<rusqlite::Connection>>,
}

impl SqliteDataSource {
    /// Data source for a database file (created on first connection)
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_str().ok_or_else(|| {
            LintError::invalid_input("SQLite file path contains invalid UTF-8 characters")
        })?;

        Ok(Self {
            path: path.to_string(),
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            anchor: None,
        })
    }

    /// Private in-memory database shared by every connection of this source
    pub fn in_memory() -> Result<Self> {
        let id = NEXT_MEMORY_DB.fetch_add(1, Ordering::Relaxed);
        let path = format!("file:dblint-mem-{}-{id}?mode=memory&cache=shared", std::process::id());
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI;

        // The database lives as long as at least one connection is open
        let anchor = open_connection(&path, flags)?;
        Ok(Self { path, flags, anchor: Some(Mutex::new(anchor)) })
    }

    /// Path or URI connections are opened with
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub const fn is_in_memory(&self) -> bool {
        self.anchor.is_some()
    }
}

impl DataSource for SqliteDataSource {
    type Error = LintError;
    type Connection = SqliteConnection;

    fn get_connection(&self) -> Result<SqliteConnection> {
        let conn = open_connection(&self.path, self.flags)?;
        Ok(SqliteConnection::new(conn))
    }
}

/// Open `SQLite` connection with appropriate flags
fn open_connection(path: &str, flags: OpenFlags) -> Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open_with_flags(path, flags)
        .map_err(|e| driver_error("Failed to open SQLite database", e))?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(|e| driver_error("Failed to set timeout", e))?;

    tracing::debug!(path, "opened sqlite connection");
    Ok(conn)
}

/// Connection state shared with the statements it created
struct Session {
    conn: Option<rusqlite::Connection>,
    auto_commit: bool,
    read_only: bool,
}

type SharedSession = Arc<Mutex<Session>>;

/// Outcome of running one SQL statement
enum Executed {
    Rows(SqliteResultSet),
    Updated { count: u64, inserted_rowid: Option<i64> },
}

impl Session {
    fn live(&self) -> Result<&rusqlite::Connection> {
        self.conn.as_ref().ok_or_else(|| driver_error("Connection unusable", "connection is closed"))
    }

    fn in_transaction(&self) -> Result<bool> {
        Ok(!self.live()?.is_autocommit())
    }

    fn end_transaction(&self, sql: &str) -> Result<()> {
        if self.in_transaction()? {
            self.live()?.execute_batch(sql).map_err(|e| driver_error(sql, e))?;
        }
        Ok(())
    }

    fn run(&self, sql: &str, params: &[Value]) -> Result<Executed> {
        let conn = self.live()?;
        if !self.auto_commit && conn.is_autocommit() {
            conn.execute_batch("BEGIN").map_err(|e| driver_error("Failed to begin transaction", e))?;
        }

        let mut stmt =
            conn.prepare(sql).map_err(|e| driver_error("Failed to prepare query", e))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|s| (*s).to_string()).collect();
        let params = rusqlite::params_from_iter(params.iter());

        if columns.is_empty() {
            // Non-SELECT query (INSERT, UPDATE, DELETE, DDL)
            let rowid_before = conn.last_insert_rowid();
            stmt.execute(params).map_err(|e| driver_error("Failed to execute query", e))?;
            let rowid_after = conn.last_insert_rowid();

            return Ok(Executed::Updated {
                count: conn.changes(),
                inserted_rowid: (rowid_after != rowid_before).then_some(rowid_after),
            });
        }

        let width = columns.len();
        let mut rows = stmt.query(params).map_err(|e| driver_error("Failed to execute query", e))?;
        let mut data = Vec::new();
        while let Some(row) = rows.next().map_err(|e| driver_error("Failed to fetch row", e))? {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                let value = row.get_ref(idx).map_err(|e| driver_error("Failed to read column", e))?;
                values.push(value_from_ref(value));
            }
            data.push(values);
        }

        Ok(Executed::Rows(SqliteResultSet::new(columns, data)))
    }
}

fn value_from_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(s) => Value::Text(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            Self::Null => ValueRef::Null,
            Self::Integer(i) => ValueRef::Integer(*i),
            Self::Real(f) => ValueRef::Real(*f),
            Self::Text(s) => ValueRef::Text(s.as_bytes()),
            Self::Blob(b) => ValueRef::Blob(b),
        }))
    }
}

/// `SQLite` connection
pub struct SqliteConnection {
    session: SharedSession,
}

impl SqliteConnection {
    fn new(conn: rusqlite::Connection) -> Self {
        Self {
            session: Arc::new(Mutex::new(Session {
                conn: Some(conn),
                auto_commit: true,
                read_only: false,
            })),
        }
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.session.lock().conn.is_none()
    }
}

impl Handle for SqliteConnection {
    type Error = LintError;
}

impl Connection for SqliteConnection {
    type ResultSet = SqliteResultSet;
    type Statement = SqliteStatement;
    type PreparedStatement = SqlitePreparedStatement;

    fn create_statement(&mut self) -> Result<SqliteStatement> {
        self.session.lock().live()?;
        Ok(SqliteStatement { core: StatementCore::new(Arc::clone(&self.session)), batch: Vec::new() })
    }

    fn prepare_statement(&mut self, sql: &str) -> Result<SqlitePreparedStatement> {
        self.session
            .lock()
            .live()?
            .prepare(sql)
            .map_err(|e| driver_error("Failed to prepare query", e))?;

        Ok(SqlitePreparedStatement {
            core: StatementCore::new(Arc::clone(&self.session)),
            sql: sql.to_string(),
            params: Vec::new(),
            batch: Vec::new(),
        })
    }

    fn commit(&mut self) -> Result<()> {
        self.session.lock().end_transaction("COMMIT")
    }

    fn rollback(&mut self) -> Result<()> {
        self.session.lock().end_transaction("ROLLBACK")
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        let mut session = self.session.lock();
        // Switching auto-commit back on commits the open transaction
        if auto_commit && !session.auto_commit {
            session.end_transaction("COMMIT")?;
        }
        session.auto_commit = auto_commit;
        Ok(())
    }

    fn auto_commit(&mut self) -> Result<bool> {
        let session = self.session.lock();
        session.live()?;
        Ok(session.auto_commit)
    }

    fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        let mut session = self.session.lock();
        let pragma = if read_only { "PRAGMA query_only = ON" } else { "PRAGMA query_only = OFF" };
        session.live()?.execute_batch(pragma).map_err(|e| driver_error(pragma, e))?;
        session.read_only = read_only;
        Ok(())
    }

    fn is_read_only(&mut self) -> Result<bool> {
        let session = self.session.lock();
        session.live()?;
        Ok(session.read_only)
    }

    fn close(&mut self) -> Result<()> {
        let Some(conn) = self.session.lock().conn.take() else {
            return Ok(());
        };
        // An open transaction is rolled back by SQLite when the handle closes
        conn.close().map_err(|(_, e)| driver_error("Failed to close connection", e))
    }
}

/// State shared by both statement kinds
struct StatementCore {
    session: SharedSession,
    pending: Option<SqliteResultSet>,
    update_count: Option<u64>,
    generated_key: Option<i64>,
    closed: bool,
}

impl StatementCore {
    fn new(session: SharedSession) -> Self {
        Self { session, pending: None, update_count: None, generated_key: None, closed: false }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(driver_error("Statement unusable", "statement is closed"));
        }
        Ok(())
    }

    fn run(&mut self, sql: &str, params: &[Value]) -> Result<Executed> {
        self.ensure_open()?;
        self.pending = None;
        self.update_count = None;
        let executed = self.session.lock().run(sql, params)?;
        if let Executed::Updated { count, inserted_rowid } = &executed {
            self.update_count = Some(*count);
            self.generated_key = *inserted_rowid;
        }
        Ok(executed)
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<bool> {
        match self.run(sql, params)? {
            Executed::Rows(rs) => {
                self.pending = Some(rs);
                Ok(true)
            }
            Executed::Updated { .. } => Ok(false),
        }
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<SqliteResultSet> {
        match self.run(sql, params)? {
            Executed::Rows(rs) => Ok(rs),
            Executed::Updated { .. } => {
                Err(LintError::invalid_input("Query did not produce a result set"))
            }
        }
    }

    fn update(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        match self.run(sql, params)? {
            Executed::Updated { count, .. } => Ok(count),
            Executed::Rows(_) => Err(LintError::invalid_input("Update produced a result set")),
        }
    }

    fn generated_keys(&mut self) -> Result<Option<SqliteResultSet>> {
        self.ensure_open()?;
        Ok(self.generated_key.map(|key| {
            SqliteResultSet::new(vec![GENERATED_KEY_COLUMN.to_string()], vec![vec![Value::Integer(key)]])
        }))
    }

    fn close(&mut self) {
        self.closed = true;
        self.pending = None;
    }
}

/// `SQLite` statement taking its SQL per call
pub struct SqliteStatement {
    core: StatementCore,
    batch: Vec<String>,
}

impl Handle for SqliteStatement {
    type Error = LintError;
}

impl StatementHandle for SqliteStatement {
    type ResultSet = SqliteResultSet;

    fn execute_batch(&mut self) -> Result<Vec<u64>> {
        let batch = std::mem::take(&mut self.batch);
        batch.iter().map(|sql| self.core.update(sql, &[])).collect()
    }

    fn get_result_set(&mut self) -> Result<Option<SqliteResultSet>> {
        self.core.ensure_open()?;
        Ok(self.core.pending.take())
    }

    fn get_update_count(&mut self) -> Result<Option<u64>> {
        self.core.ensure_open()?;
        Ok(self.core.update_count)
    }

    fn get_generated_keys(&mut self) -> Result<Option<SqliteResultSet>> {
        self.core.generated_keys()
    }

    fn close(&mut self) -> Result<()> {
        self.batch.clear();
        self.core.close();
        Ok(())
    }
}

impl Statement for SqliteStatement {
    fn add_batch(&mut self, sql: &str) -> Result<()> {
        self.core.ensure_open()?;
        self.batch.push(sql.to_string());
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<bool> {
        self.core.execute(sql, &[])
    }

    fn execute_query(&mut self, sql: &str) -> Result<SqliteResultSet> {
        self.core.query(sql, &[])
    }

    fn execute_update(&mut self, sql: &str) -> Result<u64> {
        self.core.update(sql, &[])
    }
}

/// `SQLite` prepared statement
pub struct SqlitePreparedStatement {
    core: StatementCore,
    sql: String,
    params: Vec<Value>,
    batch: Vec<Vec<Value>>,
}

impl Handle for SqlitePreparedStatement {
    type Error = LintError;
}

impl StatementHandle for SqlitePreparedStatement {
    type ResultSet = SqliteResultSet;

    fn execute_batch(&mut self) -> Result<Vec<u64>> {
        let batch = std::mem::take(&mut self.batch);
        batch.iter().map(|params| self.core.update(&self.sql, params)).collect()
    }

    fn get_result_set(&mut self) -> Result<Option<SqliteResultSet>> {
        self.core.ensure_open()?;
        Ok(self.core.pending.take())
    }

    fn get_update_count(&mut self) -> Result<Option<u64>> {
        self.core.ensure_open()?;
        Ok(self.core.update_count)
    }

    fn get_generated_keys(&mut self) -> Result<Option<SqliteResultSet>> {
        self.core.generated_keys()
    }

    fn close(&mut self) -> Result<()> {
        self.params.clear();
        self.batch.clear();
        self.core.close();
        Ok(())
    }
}

impl PreparedStatement for SqlitePreparedStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn bind(&mut self, index: usize, value: Value) -> Result<()> {
        self.core.ensure_open()?;
        if index == 0 {
            return Err(LintError::invalid_input("Parameter indexes start at 1"));
        }
        if index > MAX_PARAMETER_INDEX {
            return Err(LintError::invalid_input(format!(
                "Parameter index {index} exceeds the limit of {MAX_PARAMETER_INDEX}"
            )));
        }
        if self.params.len() < index {
            self.params.resize(index, Value::Null);
        }
        self.params[index - 1] = value;
        Ok(())
    }

    fn clear_parameters(&mut self) -> Result<()> {
        self.params.clear();
        Ok(())
    }

    fn add_batch(&mut self) -> Result<()> {
        self.core.ensure_open()?;
        self.batch.push(self.params.clone());
        Ok(())
    }

    fn execute(&mut self) -> Result<bool> {
        self.core.execute(&self.sql, &self.params)
    }

    fn execute_query(&mut self) -> Result<SqliteResultSet> {
        self.core.query(&self.sql, &self.params)
    }

    fn execute_update(&mut self) -> Result<u64> {
        self.core.update(&self.sql, &self.params)
    }
}

/// Materialized `SQLite` result cursor
pub struct SqliteResultSet {
    columns: Vec<String>,
    rows: std::vec::IntoIter<Vec<Value>>,
    current: Option<Vec<Value>>,
    closed: bool,
}

impl SqliteResultSet {
    fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows: rows.into_iter(), current: None, closed: false }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(driver_error("ResultSet unusable", "result set is closed"));
        }
        Ok(())
    }

    fn position(&self, column: &Column) -> Result<usize> {
        match column {
            Column::Index(index) if (1..=self.columns.len()).contains(index) => Ok(index - 1),
            Column::Index(index) => {
                Err(LintError::invalid_input(format!("Column index {index} out of range")))
            }
            Column::Label(label) => self
                .columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(label))
                .ok_or_else(|| LintError::invalid_input(format!("Unknown column '{label}'"))),
        }
    }

    fn value(&self, column: &Column) -> Result<&Value> {
        self.ensure_open()?;
        let position = self.position(column)?;
        let row = self
            .current
            .as_ref()
            .ok_or_else(|| LintError::invalid_input("No current row; call next() first"))?;
        Ok(&row[position])
    }
}

impl Handle for SqliteResultSet {
    type Error = LintError;
}

impl ResultSet for SqliteResultSet {
    type Blob = SqliteBlob;

    fn next(&mut self) -> Result<bool> {
        self.ensure_open()?;
        self.current = self.rows.next();
        Ok(self.current.is_some())
    }

    fn column_count(&mut self) -> Result<usize> {
        Ok(self.columns.len())
    }

    fn column_label(&mut self, index: usize) -> Result<String> {
        self.position(&Column::Index(index)).map(|position| self.columns[position].clone())
    }

    fn get(&mut self, column: &Column) -> Result<Value> {
        self.value(column).cloned()
    }

    fn get_blob(&mut self, column: &Column) -> Result<Option<SqliteBlob>> {
        match self.value(column)? {
            Value::Null => Ok(None),
            Value::Blob(bytes) => Ok(Some(SqliteBlob::new(bytes.clone()))),
            Value::Text(text) => Ok(Some(SqliteBlob::new(text.clone().into_bytes()))),
            _ => Err(LintError::invalid_input(format!("Column {column} is not a blob"))),
        }
    }

    fn clear_warnings(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.current = None;
        Ok(())
    }
}

/// In-memory copy of a `SQLite` BLOB value
pub struct SqliteBlob {
    data: Vec<u8>,
    freed: bool,
}

impl SqliteBlob {
    const fn new(data: Vec<u8>) -> Self {
        Self { data, freed: false }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.freed {
            return Err(driver_error("Blob unusable", "blob has been freed"));
        }
        Ok(())
    }
}

impl Handle for SqliteBlob {
    type Error = LintError;
}

impl Blob for SqliteBlob {
    fn length(&mut self) -> Result<u64> {
        self.ensure_live()?;
        Ok(self.data.len() as u64)
    }

    fn bytes(&mut self, position: u64, length: usize) -> Result<Vec<u8>> {
        self.ensure_live()?;
        let start = usize::try_from(position)
            .ok()
            .and_then(|p| p.checked_sub(1))
            .filter(|start| *start <= self.data.len())
            .ok_or_else(|| LintError::invalid_input(format!("Blob position {position} out of range")))?;
        let end = start.saturating_add(length).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }

    fn free(&mut self) -> Result<()> {
        self.freed = true;
        self.data = Vec::new();
        Ok(())
    }
}
