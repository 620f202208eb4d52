//! Database Driver Traits and Core Types
//!
//! This module defines the client surface the guards wrap: data sources,
//! connections, statements, result cursors and large objects. Any driver
//! exposing this contract can be linted; the bundled [`sqlite`] driver is the
//! reference implementation.
//!
//! # Error Contract
//! Every handle names its driver error type through [`Handle`]. The error must
//! be constructible from a [`Violation`] so that a raised violation reaches the
//! caller through the same `Result` as a genuine driver failure.
//!
//! # Indexing
//! Column and parameter indexes are 1-based, blob positions too.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::report::Violation;

#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Error type a driver reports through every handle
pub trait DriverError: std::error::Error + From<Violation> + Send + Sync + 'static {}

impl<E> DriverError for E where E: std::error::Error + From<Violation> + Send + Sync + 'static {}

/// Base trait of every wrappable handle
pub trait Handle: Send {
    type Error: DriverError;
}

/// Single SQL value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Real(f) => Some(*f),
            #[allow(clippy::cast_precision_loss)]
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) => Some(b),
            Self::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Column reference: 1-based index or label
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Column {
    Index(usize),
    Label(String),
}

impl From<usize> for Column {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for Column {
    fn from(label: &str) -> Self {
        Self::Label(label.to_string())
    }
}

impl From<String> for Column {
    fn from(label: String) -> Self {
        Self::Label(label)
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "#{index}"),
            Self::Label(label) => f.write_str(label),
        }
    }
}

/// Entry point that hands out connections
pub trait DataSource: Send + Sync {
    type Error: DriverError;
    type Connection: Connection<Error = Self::Error>;

    fn get_connection(&self) -> Result<Self::Connection, Self::Error>;
}

/// Database connection
pub trait Connection: Handle {
    type ResultSet: ResultSet<Error = Self::Error>;
    type Statement: Statement<Error = Self::Error, ResultSet = Self::ResultSet>;
    type PreparedStatement: PreparedStatement<Error = Self::Error, ResultSet = Self::ResultSet>;

    fn create_statement(&mut self) -> Result<Self::Statement, Self::Error>;
    fn prepare_statement(&mut self, sql: &str) -> Result<Self::PreparedStatement, Self::Error>;
    fn commit(&mut self) -> Result<(), Self::Error>;
    fn rollback(&mut self) -> Result<(), Self::Error>;
    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), Self::Error>;
    fn auto_commit(&mut self) -> Result<bool, Self::Error>;
    fn set_read_only(&mut self, read_only: bool) -> Result<(), Self::Error>;
    fn is_read_only(&mut self) -> Result<bool, Self::Error>;

    /// Close the connection; closing a closed connection is a no-op
    fn close(&mut self) -> Result<(), Self::Error>;
}

/// Operations shared by plain and prepared statements
pub trait StatementHandle: Handle {
    type ResultSet: ResultSet<Error = Self::Error>;

    /// Run the queued batch, returning per-entry update counts
    fn execute_batch(&mut self) -> Result<Vec<u64>, Self::Error>;

    /// Result cursor of the last `execute` that produced rows
    fn get_result_set(&mut self) -> Result<Option<Self::ResultSet>, Self::Error>;

    /// Update count of the last execute; `None` when it produced rows
    fn get_update_count(&mut self) -> Result<Option<u64>, Self::Error>;

    /// Keys generated by the last insert, if the driver reports any
    fn get_generated_keys(&mut self) -> Result<Option<Self::ResultSet>, Self::Error>;

    /// Close the statement; closing a closed statement is a no-op
    fn close(&mut self) -> Result<(), Self::Error>;
}

/// Statement taking its SQL per call
pub trait Statement: StatementHandle {
    fn add_batch(&mut self, sql: &str) -> Result<(), Self::Error>;

    /// Execute any statement; `true` when it produced a result cursor
    fn execute(&mut self, sql: &str) -> Result<bool, Self::Error>;
    fn execute_query(&mut self, sql: &str) -> Result<Self::ResultSet, Self::Error>;
    fn execute_update(&mut self, sql: &str) -> Result<u64, Self::Error>;
}

/// Statement with SQL fixed at prepare time and bound parameters
pub trait PreparedStatement: StatementHandle {
    /// SQL this statement was prepared with
    fn sql(&self) -> &str;

    fn bind(&mut self, index: usize, value: Value) -> Result<(), Self::Error>;
    fn clear_parameters(&mut self) -> Result<(), Self::Error>;

    /// Queue the current parameter set
    fn add_batch(&mut self) -> Result<(), Self::Error>;

    fn execute(&mut self) -> Result<bool, Self::Error>;
    fn execute_query(&mut self) -> Result<Self::ResultSet, Self::Error>;
    fn execute_update(&mut self) -> Result<u64, Self::Error>;
}

/// Forward-only result cursor
pub trait ResultSet: Handle {
    type Blob: Blob<Error = Self::Error>;

    /// Advance to the next row; `false` once rows are exhausted
    fn next(&mut self) -> Result<bool, Self::Error>;
    fn column_count(&mut self) -> Result<usize, Self::Error>;
    fn column_label(&mut self, index: usize) -> Result<String, Self::Error>;
    fn get(&mut self, column: &Column) -> Result<Value, Self::Error>;

    /// Large object in the current row; `None` for SQL NULL
    fn get_blob(&mut self, column: &Column) -> Result<Option<Self::Blob>, Self::Error>;
    fn clear_warnings(&mut self) -> Result<(), Self::Error>;
    fn close(&mut self) -> Result<(), Self::Error>;
}

/// Large binary object
pub trait Blob: Handle {
    fn length(&mut self) -> Result<u64, Self::Error>;

    /// `length` bytes starting at 1-based `position`
    fn bytes(&mut self, position: u64, length: usize) -> Result<Vec<u8>, Self::Error>;
    fn free(&mut self) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::from(7).as_i64(), Some(7));
        assert_eq!(Value::from(7_i64).as_f64(), Some(7.0));
        assert_eq!(Value::from("abc").as_str(), Some("abc"));
        assert_eq!(Value::from(vec![1_u8, 2]).as_bytes(), Some(&[1_u8, 2][..]));
        assert!(Value::from(None::<i64>).is_null());
        assert_eq!(Value::Null.as_i64(), None);
    }

    #[test]
    fn test_value_serialization() {
        assert_eq!(serde_json::to_string(&Value::Integer(3)).unwrap(), "3");
        assert_eq!(serde_json::to_string(&Value::Null).unwrap(), "null");
        assert_eq!(serde_json::to_string(&Value::from("x")).unwrap(), r#""x""#);
    }

    #[test]
    fn test_column_conversions() {
        assert_eq!(Column::from(2_usize), Column::Index(2));
        assert_eq!(Column::from("name"), Column::Label("name".to_string()));
        assert_eq!(Column::Index(3).to_string(), "#3");
    }
}
