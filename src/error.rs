//! Error Handling Infrastructure
//!
//! This module defines the error type used by the bundled driver, the policy
//! loader and the CLI.
//!
//! # Error Categories
//! - `Violation`: A usage-contract breach raised by the `raise_error` action
//! - `Driver`: A genuine failure reported by the wrapped database driver
//! - `InvalidInput`: Malformed input or missing required parameters
//! - `ConfigError`: Unknown check names, unknown fail methods, bad properties
//!
//! Guards are generic over the driver's own error type; this type is the error
//! of the bundled SQLite driver, so a raised violation surfaces through the same
//! `Result` a caller already handles for driver failures.

use thiserror::Error;

use crate::report::Violation;

/// Main error type for dblint operations
#[derive(Error, Debug)]
pub enum LintError {
    /// Usage-contract violation raised by the action pipeline
    #[error(transparent)]
    Violation(#[from] Violation),

    /// Failure reported by the underlying database driver
    #[error("Driver error ({engine}): {detail}")]
    Driver { engine: String, detail: String },

    /// Invalid input or missing required parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error (unknown check, unknown fail method, etc.)
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl LintError {
    /// Convert error to error code string for JSON output
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Violation(_) => "LINT_VIOLATION",
            Self::Driver { .. } => "DRIVER_ERROR",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::ConfigError(_) => "CONFIG_ERROR",
        }
    }

    /// Get human-readable error message
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// The violation carried by this error, if any
    #[must_use]
    pub const fn violation(&self) -> Option<&Violation> {
        match self {
            Self::Violation(violation) => Some(violation),
            _ => None,
        }
    }

    /// Create a driver error
    pub fn driver(engine: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Driver { engine: engine.into(), detail: detail.into() }
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }
}

/// Result type alias for dblint operations
pub type Result<T> = std::result::Result<T, LintError>;
