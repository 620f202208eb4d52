//! JSON Output Envelope Types
//!
//! This module defines the structured JSON output of the `dblint` CLI.
//! Every command prints either a SuccessEnvelope or an ErrorEnvelope to stdout.
//!
//! # Output Contract
//! - Success: `{"ok": true, "engine": "...", "command": "...", "data": {...}, "meta": {...}}`
//! - Error: `{"ok": false, "engine": "...", "command": "...", "error": {"code": "...", "message": "..."}}`
//!
//! BLOB values are Base64 encoded; every other [`Value`] maps to its natural
//! JSON form.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::driver::Value;
use crate::error::LintError;
use crate::policy::Check;
use crate::report::Violation;

/// Success envelope for command results
///
/// Generic over the data type to support different command return values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    /// Always true for success envelopes
    pub ok: bool,

    /// Database engine used (empty when the command touches no database)
    pub engine: String,

    /// Command that was executed (checks, run)
    pub command: String,

    /// Command-specific data
    pub data: T,

    /// Execution metadata
    pub meta: Metadata,
}

impl<T> SuccessEnvelope<T> {
    /// Create a new success envelope
    pub fn new(engine: impl Into<String>, command: impl Into<String>, data: T, meta: Metadata) -> Self {
        Self { ok: true, engine: engine.into(), command: command.into(), data, meta }
    }
}

/// Error envelope for command failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always false for error envelopes
    pub ok: bool,

    /// Database engine (empty string if not engine-specific)
    pub engine: String,

    /// Command that was attempted
    pub command: String,

    /// Error information
    pub error: ErrorInfo,
}

impl ErrorEnvelope {
    /// Create a new error envelope
    pub fn new(engine: impl Into<String>, command: impl Into<String>, error: ErrorInfo) -> Self {
        Self { ok: false, engine: engine.into(), command: command.into(), error }
    }

    /// Create error envelope from LintError
    pub fn from_error(engine: impl Into<String>, command: impl Into<String>, err: &LintError) -> Self {
        Self::new(engine, command, ErrorInfo::new(err.error_code(), err.message()))
    }
}

/// Error information structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g., "LINT_VIOLATION", "DRIVER_ERROR")
    pub code: String,

    /// Human-readable error message
    pub message: String,
}

impl ErrorInfo {
    /// Create a new error info
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }
}

/// Execution metadata included in all success responses
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Execution time in milliseconds
    pub execution_ms: u64,

    /// Number of rows returned (None for commands that read no rows)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_returned: Option<usize>,

    /// Number of violations reported while the command ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violations: Option<usize>,
}

impl Metadata {
    /// Create new metadata with just execution time
    #[must_use]
    pub const fn new(execution_ms: u64) -> Self {
        Self { execution_ms, rows_returned: None, violations: None }
    }

    /// Add a row count
    #[must_use]
    pub const fn with_rows(mut self, rows_returned: usize) -> Self {
        self.rows_returned = Some(rows_returned);
        self
    }

    /// Add a violation count
    #[must_use]
    pub const fn with_violations(mut self, violations: usize) -> Self {
        self.violations = Some(violations);
        self
    }
}

/// One check as listed by `dblint checks`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInfo {
    pub check: Check,
    /// Property key, including the `dblint.` prefix
    pub property: String,
    pub enabled_by_default: bool,
}

impl From<Check> for CheckInfo {
    fn from(check: Check) -> Self {
        Self {
            check,
            property: format!("{}{}", crate::policy::PROPERTY_PREFIX, check.property_key()),
            enabled_by_default: check.enabled_by_default(),
        }
    }
}

/// A reported violation in JSON form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub check: Check,
    pub message: String,
    /// Handle kind the violation is about (Connection, Statement, ...)
    pub handle: String,
    pub handle_id: u64,
    /// `file:line:column` where the handle was created
    pub created_at: String,
}

impl From<&Violation> for ViolationRecord {
    fn from(violation: &Violation) -> Self {
        let context = violation.context();
        Self {
            check: violation.check(),
            message: violation.message().to_string(),
            handle: context.handle().to_string(),
            handle_id: context.id(),
            created_at: context.location().to_string(),
        }
    }
}

/// Result of one statement run by `dblint run`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatementOutcome {
    pub sql: String,

    /// Column labels (empty for statements producing no rows)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,

    /// Rows as JSON values, in column order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<Vec<serde_json::Value>>,

    /// Update count for statements producing no rows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
}

/// Convert a driver value to JSON (BLOBs as Base64)
#[must_use]
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Real(f) => serde_json::Number::from_f64(*f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Blob(b) => serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b)),
    }
}
