//! dblint - Runtime Contract Checks for Database Client Handles
//!
//! dblint wraps database client handles (connections, statements, result
//! cursors, large objects) so that every call passes through a guard that
//! tracks the handle's lifecycle and reports misuse: closing twice, never
//! closing, closing a statement that never executed, leaving columns of a
//! fetched row unread, or never declaring a query-only connection read-only.
//!
//! # Core Principles
//! - Observe, never alter: calls are forwarded unchanged and real driver
//!   failures are returned untouched
//! - One entry point: everything obtained through a [`GuardedDataSource`] is
//!   guarded, down to blobs
//! - Immutable policy: enabled checks and violation actions are fixed when the
//!   [`Policy`] is built and shared by every guard
//! - Raised violations surface as the driver's own error type
//!
//! # Module Organization
//! - [`error`] - Error types and handling
//! - [`policy`] - Checks, actions and the violation policy
//! - [`report`] - Violations, diagnostic context, action dispatch
//! - [`intercept`] - Generic interception engine
//! - [`driver`] - Driver traits the guards wrap, plus the bundled SQLite driver
//! - [`guard`] - Guard state machines and guarded handle types
//! - [`classify`] - SQL statement classification
//! - [`output`] - JSON output envelope types for the CLI
//!
//! # Example
//! ```no_run
//! # #[cfg(feature = "sqlite")]
//! # fn main() -> dblint::Result<()> {
//! use dblint::{FailMethod, GuardedDataSource, Policy, SqliteDataSource};
//!
//! let policy = Policy::defaults().fail_method(FailMethod::RaiseError).build();
//! let source = GuardedDataSource::new(SqliteDataSource::open("app.db")?, policy);
//!
//! let conn = source.get_connection()?;
//! let stmt = conn.create_statement()?;
//! let rs = stmt.execute_query("SELECT id, name FROM users")?;
//! while rs.next()? {
//!     let _id = rs.get("id")?;
//!     let _name = rs.get("name")?;
//! }
//! rs.close()?;
//! stmt.close()?;
//! conn.close()?;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "sqlite"))]
//! # fn main() {}
//! ```

pub mod classify;
pub mod driver;
pub mod error;
pub mod guard;
pub mod intercept;
pub mod output;
pub mod policy;
pub mod report;

// Re-export commonly used types for convenience
pub use driver::{Column, Value};
pub use error::{LintError, Result};
pub use guard::{
    GuardedBlob, GuardedConnection, GuardedDataSource, GuardedPreparedStatement, GuardedResultSet,
    GuardedStatement,
};
pub use output::{ErrorEnvelope, ErrorInfo, Metadata, SuccessEnvelope};
pub use policy::{Action, Check, FailMethod, LogTarget, Policy, PolicyBuilder};
pub use report::{DiagnosticContext, HandleKind, Violation};

#[cfg(feature = "sqlite")]
pub use driver::sqlite::SqliteDataSource;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_api_exports() {
        let policy = Policy::default();
        assert!(policy.is_enabled(Check::ConnectionDoubleClose));
        assert_eq!(HandleKind::PreparedStatement.label(), "PreparedStatement");
        assert_eq!(Column::from("id"), Column::Label("id".to_string()));
    }
}
