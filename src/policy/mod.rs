//! Violation Policy
//!
//! This module defines which checks are enforced and what happens when one of
//! them fails.
//!
//! # Model
//! - [`Check`] is the closed set of rules a guard can enforce
//! - [`Action`] is one response to a violation (log, raise, panic, terminate, no-op)
//! - [`Policy`] is the immutable pair of enabled checks and ordered actions,
//!   shared read-only (`Arc<Policy>`) by every guard
//!
//! # Sources
//! 1. Builder presets: [`Policy::defaults`], [`Policy::all_enabled`], [`Policy::all_disabled`]
//! 2. Key/value properties: `dblint.<handle>.<check> = true|false`,
//!    `dblint.fail_method`, `dblint.log_file`
//! 3. Environment: `DBLINT_FAIL_METHOD`, `DBLINT_LOG_FILE`, `DBLINT_ENABLE`, `DBLINT_DISABLE`
//!
//! Unknown check names and fail methods are rejected when the policy is built.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{LintError, Result};
use crate::report::{self, DiagnosticContext, Violation};

/// Prefix shared by every policy property key
pub const PROPERTY_PREFIX: &str = "dblint.";

/// A single rule a guard can enforce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    BlobDoubleFree,
    BlobMissingFree,
    ConnectionDoubleClose,
    ConnectionMissingClose,
    ConnectionMissingCommitOrRollback,
    ConnectionMissingStatement,
    ConnectionMissingReadOnly,
    PreparedStatementDoubleClose,
    PreparedStatementMissingClose,
    PreparedStatementMissingExecute,
    PreparedStatementMissingExecuteBatch,
    ResultSetDoubleClose,
    ResultSetMissingClose,
    ResultSetUnreadColumn,
    StatementDoubleClose,
    StatementMissingClose,
    StatementMissingExecute,
    StatementMissingExecuteBatch,
}

impl Check {
    /// Every check, in declaration order
    pub const ALL: [Self; 18] = [
        Self::BlobDoubleFree,
        Self::BlobMissingFree,
        Self::ConnectionDoubleClose,
        Self::ConnectionMissingClose,
        Self::ConnectionMissingCommitOrRollback,
        Self::ConnectionMissingStatement,
        Self::ConnectionMissingReadOnly,
        Self::PreparedStatementDoubleClose,
        Self::PreparedStatementMissingClose,
        Self::PreparedStatementMissingExecute,
        Self::PreparedStatementMissingExecuteBatch,
        Self::ResultSetDoubleClose,
        Self::ResultSetMissingClose,
        Self::ResultSetUnreadColumn,
        Self::StatementDoubleClose,
        Self::StatementMissingClose,
        Self::StatementMissingExecute,
        Self::StatementMissingExecuteBatch,
    ];

    /// Stable snake_case name (matches the serde representation)
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::BlobDoubleFree => "blob_double_free",
            Self::BlobMissingFree => "blob_missing_free",
            Self::ConnectionDoubleClose => "connection_double_close",
            Self::ConnectionMissingClose => "connection_missing_close",
            Self::ConnectionMissingCommitOrRollback => "connection_missing_commit_or_rollback",
            Self::ConnectionMissingStatement => "connection_missing_statement",
            Self::ConnectionMissingReadOnly => "connection_missing_read_only",
            Self::PreparedStatementDoubleClose => "prepared_statement_double_close",
            Self::PreparedStatementMissingClose => "prepared_statement_missing_close",
            Self::PreparedStatementMissingExecute => "prepared_statement_missing_execute",
            Self::PreparedStatementMissingExecuteBatch => {
                "prepared_statement_missing_execute_batch"
            }
            Self::ResultSetDoubleClose => "result_set_double_close",
            Self::ResultSetMissingClose => "result_set_missing_close",
            Self::ResultSetUnreadColumn => "result_set_unread_column",
            Self::StatementDoubleClose => "statement_double_close",
            Self::StatementMissingClose => "statement_missing_close",
            Self::StatementMissingExecute => "statement_missing_execute",
            Self::StatementMissingExecuteBatch => "statement_missing_execute_batch",
        }
    }

    /// Property key without the `dblint.` prefix, e.g. `connection.double_close`
    #[must_use]
    pub const fn property_key(self) -> &'static str {
        match self {
            Self::BlobDoubleFree => "blob.double_free",
            Self::BlobMissingFree => "blob.missing_free",
            Self::ConnectionDoubleClose => "connection.double_close",
            Self::ConnectionMissingClose => "connection.missing_close",
            Self::ConnectionMissingCommitOrRollback => "connection.missing_commit_or_rollback",
            Self::ConnectionMissingStatement => "connection.missing_statement",
            Self::ConnectionMissingReadOnly => "connection.missing_read_only",
            Self::PreparedStatementDoubleClose => "preparedstatement.double_close",
            Self::PreparedStatementMissingClose => "preparedstatement.missing_close",
            Self::PreparedStatementMissingExecute => "preparedstatement.missing_execute",
            Self::PreparedStatementMissingExecuteBatch => "preparedstatement.missing_execute_batch",
            Self::ResultSetDoubleClose => "resultset.double_close",
            Self::ResultSetMissingClose => "resultset.missing_close",
            Self::ResultSetUnreadColumn => "resultset.unread_column",
            Self::StatementDoubleClose => "statement.double_close",
            Self::StatementMissingClose => "statement.missing_close",
            Self::StatementMissingExecute => "statement.missing_execute",
            Self::StatementMissingExecuteBatch => "statement.missing_execute_batch",
        }
    }

    /// Whether the check is part of [`Policy::defaults`]
    ///
    /// `connection_missing_read_only` is opt-in: plenty of correct code never
    /// declares read-only connections.
    #[must_use]
    pub const fn enabled_by_default(self) -> bool {
        !matches!(self, Self::ConnectionMissingReadOnly)
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Check {
    type Err = LintError;

    /// Accepts the snake_case name, the property key (with or without the
    /// `dblint.` prefix), case-insensitively, with `-` as a word separator.
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        let key = normalized.strip_prefix(PROPERTY_PREFIX).unwrap_or(&normalized);

        Self::ALL
            .into_iter()
            .find(|check| check.name() == key || check.property_key() == key)
            .ok_or_else(|| LintError::config_error(format!("Unknown check '{s}'")))
    }
}

/// Where a write-to-stream action sends its record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogTarget {
    /// Standard error
    Stderr,
    /// Append to a file (created if missing)
    File(PathBuf),
}

/// Host-supplied receiver for violations
#[derive(Clone)]
pub struct ViolationCallback(Arc<dyn Fn(&Violation) + Send + Sync>);

impl ViolationCallback {
    pub fn new(f: impl Fn(&Violation) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub(crate) fn call(&self, violation: &Violation) {
        (self.0)(violation);
    }
}

impl fmt::Debug for ViolationCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ViolationCallback(..)")
    }
}

/// One configured response to a violation
///
/// Actions run in the order they are listed. `RaiseError` and `Panic` are
/// deferred until every action has run; `Terminate` exits the process as soon
/// as it is reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Write the message and diagnostic context to a stream
    WriteToStream(LogTarget),
    /// Return the violation to the caller as the driver's error type
    RaiseError,
    /// Panic with the violation message
    Panic,
    /// Exit the process with status 1
    Terminate,
    /// Do nothing
    NoOp,
    /// Hand the violation to a callback
    #[serde(skip)]
    Callback(ViolationCallback),
}

impl Action {
    /// Create a callback action
    pub fn callback(f: impl Fn(&Violation) + Send + Sync + 'static) -> Self {
        Self::Callback(ViolationCallback::new(f))
    }
}

/// Preset failure handling: log, then fail the way the preset says
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMethod {
    /// Log and exit the process
    Exit,
    /// Log only
    #[default]
    NoOperation,
    /// Log and return the violation as an error
    RaiseError,
    /// Log and panic
    Panic,
}

impl FailMethod {
    /// Expand the preset into its action list
    #[must_use]
    pub fn actions(self, target: LogTarget) -> Vec<Action> {
        let log = Action::WriteToStream(target);
        match self {
            Self::Exit => vec![log, Action::Terminate],
            Self::NoOperation => vec![log],
            Self::RaiseError => vec![log, Action::RaiseError],
            Self::Panic => vec![log, Action::Panic],
        }
    }
}

impl FromStr for FailMethod {
    type Err = LintError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "exit" => Ok(Self::Exit),
            "no_operation" | "noop" | "" => Ok(Self::NoOperation),
            "raise_error" | "throw_sql_exception" => Ok(Self::RaiseError),
            "panic" | "throw_runtime_exception" => Ok(Self::Panic),
            other => Err(LintError::config_error(format!("Unknown fail method '{other}'"))),
        }
    }
}

/// Immutable violation policy shared by all guards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    checks: BTreeSet<Check>,
    actions: Vec<Action>,
}

impl Default for Policy {
    fn default() -> Self {
        Self::defaults().build()
    }
}

impl Policy {
    /// Every check except `connection_missing_read_only`, logging to stderr
    #[must_use]
    pub fn defaults() -> PolicyBuilder {
        PolicyBuilder::new(Check::ALL.into_iter().filter(|c| c.enabled_by_default()).collect())
    }

    #[must_use]
    pub fn all_enabled() -> PolicyBuilder {
        PolicyBuilder::new(Check::ALL.into_iter().collect())
    }

    #[must_use]
    pub fn all_disabled() -> PolicyBuilder {
        PolicyBuilder::new(BTreeSet::new())
    }

    /// Build the default policy adjusted by `DBLINT_*` environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self::defaults().apply_lookup(|name| std::env::var(name).ok())?.build())
    }

    /// Whether a check is enforced
    #[must_use]
    pub fn is_enabled(&self, check: Check) -> bool {
        self.checks.contains(&check)
    }

    /// Enabled checks in declaration order
    pub fn checks(&self) -> impl Iterator<Item = Check> + '_ {
        self.checks.iter().copied()
    }

    /// Configured actions in dispatch order
    #[must_use]
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Run the action pipeline for a failed check
    ///
    /// Returns `Err` when a raise-error action is configured.
    pub fn report(
        &self,
        check: Check,
        message: impl Into<String>,
        context: &Arc<DiagnosticContext>,
    ) -> std::result::Result<(), Violation> {
        report::dispatch(&self.actions, Violation::new(check, message, Arc::clone(context)))
    }

    /// Run the action pipeline where an error cannot be returned (destructors)
    pub(crate) fn report_detached(
        &self,
        check: Check,
        message: impl Into<String>,
        context: &Arc<DiagnosticContext>,
    ) {
        report::dispatch_detached(
            &self.actions,
            Violation::new(check, message, Arc::clone(context)),
        );
    }
}

/// Builder for [`Policy`]
#[derive(Debug, Clone)]
pub struct PolicyBuilder {
    checks: BTreeSet<Check>,
    fail_method: FailMethod,
    log_target: LogTarget,
    observers: Vec<Action>,
    actions: Option<Vec<Action>>,
}

impl PolicyBuilder {
    fn new(checks: BTreeSet<Check>) -> Self {
        Self {
            checks,
            fail_method: FailMethod::default(),
            log_target: LogTarget::Stderr,
            observers: Vec::new(),
            actions: None,
        }
    }

    #[must_use]
    pub fn add_check(mut self, check: Check) -> Self {
        self.checks.insert(check);
        self
    }

    #[must_use]
    pub fn remove_check(mut self, check: Check) -> Self {
        self.checks.remove(&check);
        self
    }

    /// Enable or disable a check
    #[must_use]
    pub fn set_check(self, check: Check, enabled: bool) -> Self {
        if enabled {
            self.add_check(check)
        } else {
            self.remove_check(check)
        }
    }

    /// Select a preset action list (ignored once explicit actions are given)
    #[must_use]
    pub const fn fail_method(mut self, method: FailMethod) -> Self {
        self.fail_method = method;
        self
    }

    /// Log to an append-mode file instead of stderr
    #[must_use]
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_target = LogTarget::File(path.into());
        self
    }

    /// Append an explicit action; replaces the fail-method preset
    #[must_use]
    pub fn action(mut self, action: Action) -> Self {
        self.actions.get_or_insert_with(Vec::new).push(action);
        self
    }

    /// Run `action` ahead of the failure actions, whichever list is in effect
    #[must_use]
    pub fn observe(mut self, action: Action) -> Self {
        self.observers.push(action);
        self
    }

    /// Replace the action list
    #[must_use]
    pub fn actions(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.actions = Some(actions.into_iter().collect());
        self
    }

    /// Apply `dblint.*` properties; other keys are ignored
    ///
    /// A check property set to an empty string or `true` enables the check,
    /// `false` disables it.
    pub fn apply_properties<I, K, V>(mut self, properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in properties {
            let (key, value) = (key.as_ref(), value.as_ref());
            let Some(name) = key.strip_prefix(PROPERTY_PREFIX) else {
                continue;
            };
            match name {
                "fail_method" => self.fail_method = value.parse()?,
                "log_file" if value.is_empty() => self.log_target = LogTarget::Stderr,
                "log_file" => self.log_target = LogTarget::File(PathBuf::from(value)),
                _ => {
                    let check: Check = name.parse()?;
                    self = self.set_check(check, parse_flag(key, value)?);
                }
            }
        }
        Ok(self)
    }

    /// Apply `DBLINT_*` variables through a lookup function
    pub fn apply_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(method) = lookup("DBLINT_FAIL_METHOD") {
            self.fail_method = method.parse()?;
        }
        if let Some(path) = lookup("DBLINT_LOG_FILE").filter(|p| !p.is_empty()) {
            self.log_target = LogTarget::File(PathBuf::from(path));
        }
        for check in split_list(lookup("DBLINT_ENABLE").as_deref()) {
            self = self.add_check(check.parse()?);
        }
        for check in split_list(lookup("DBLINT_DISABLE").as_deref()) {
            self = self.remove_check(check.parse()?);
        }
        Ok(self)
    }

    #[must_use]
    pub fn build(self) -> Policy {
        let failure =
            self.actions.unwrap_or_else(|| self.fail_method.actions(self.log_target.clone()));
        let actions = self.observers.into_iter().chain(failure).collect();
        Policy { checks: self.checks, actions }
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "true" => Ok(true),
        "false" => Ok(false),
        other => Err(LintError::config_error(format!(
            "Property {key} must be true or false, got '{other}'"
        ))),
    }
}

fn split_list(value: Option<&str>) -> impl Iterator<Item = &str> {
    value.unwrap_or_default().split(',').map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_exclude_missing_read_only() {
        let policy = Policy::default();
        for check in Check::ALL {
            assert_eq!(policy.is_enabled(check), check != Check::ConnectionMissingReadOnly);
        }
    }

    #[test]
    fn test_presets() {
        let all = Policy::all_enabled().build();
        assert_eq!(all.checks().count(), Check::ALL.len());

        let none = Policy::all_disabled().add_check(Check::BlobDoubleFree).build();
        assert_eq!(none.checks().collect::<Vec<_>>(), vec![Check::BlobDoubleFree]);
    }

    #[test]
    fn test_check_names_round_trip() {
        for check in Check::ALL {
            assert_eq!(check.name().parse::<Check>().unwrap(), check);
            assert_eq!(check.property_key().parse::<Check>().unwrap(), check);
            assert_eq!(
                serde_json::to_string(&check).unwrap(),
                format!("\"{}\"", check.name())
            );
        }
        assert_eq!(
            "dblint.ResultSet.Unread-Column".parse::<Check>().unwrap(),
            Check::ResultSetUnreadColumn
        );
    }

    #[test]
    fn test_unknown_check_is_config_error() {
        let err = "connection.triple_close".parse::<Check>().unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_fail_method_presets() {
        let actions = FailMethod::RaiseError.actions(LogTarget::Stderr);
        assert!(matches!(actions[0], Action::WriteToStream(LogTarget::Stderr)));
        assert!(matches!(actions[1], Action::RaiseError));

        assert_eq!(
            "throw_sql_exception".parse::<FailMethod>().unwrap(),
            FailMethod::RaiseError
        );
        assert_eq!("exit".parse::<FailMethod>().unwrap(), FailMethod::Exit);
        assert!("explode".parse::<FailMethod>().is_err());
    }

    #[test]
    fn test_explicit_actions_replace_preset() {
        let policy = Policy::defaults()
            .fail_method(FailMethod::Exit)
            .action(Action::NoOp)
            .build();
        assert_eq!(policy.actions().len(), 1);
        assert!(matches!(policy.actions()[0], Action::NoOp));
    }

    #[test]
    fn test_observers_run_ahead_of_resolved_preset() {
        let vars = HashMap::from([("DBLINT_FAIL_METHOD", "raise_error"), ("DBLINT_LOG_FILE", "lint.log")]);
        let policy = Policy::defaults()
            .observe(Action::NoOp)
            .apply_lookup(|name| vars.get(name).map(|v| (*v).to_string()))
            .unwrap()
            .build();

        assert_eq!(policy.actions().len(), 3);
        assert!(matches!(policy.actions()[0], Action::NoOp));
        assert!(
            matches!(&policy.actions()[1], Action::WriteToStream(LogTarget::File(path)) if path == &PathBuf::from("lint.log"))
        );
        assert!(matches!(policy.actions()[2], Action::RaiseError));
    }

    #[test]
    fn test_apply_properties() {
        let properties = HashMap::from([
            ("dblint.connection.double_close", "false"),
            ("dblint.connection.missing_read_only", ""),
            ("dblint.fail_method", "raise_error"),
            ("dblint.log_file", "/tmp/dblint.log"),
            ("java.home", "/usr/lib/jvm"),
        ]);

        let policy = Policy::defaults().apply_properties(properties).unwrap().build();
        assert!(!policy.is_enabled(Check::ConnectionDoubleClose));
        assert!(policy.is_enabled(Check::ConnectionMissingReadOnly));
        assert!(matches!(
            &policy.actions()[0],
            Action::WriteToStream(LogTarget::File(path)) if path == &PathBuf::from("/tmp/dblint.log")
        ));
        assert!(matches!(policy.actions()[1], Action::RaiseError));
    }

    #[test]
    fn test_apply_properties_rejects_bad_values() {
        let err = Policy::defaults()
            .apply_properties([("dblint.blob.double_free", "maybe")])
            .unwrap_err();
        assert!(err.message().contains("must be true or false"));

        let err = Policy::defaults()
            .apply_properties([("dblint.blob.triple_free", "true")])
            .unwrap_err();
        assert!(err.message().contains("Unknown check"));
    }

    #[test]
    fn test_apply_lookup() {
        let env = HashMap::from([
            ("DBLINT_FAIL_METHOD", "panic".to_string()),
            ("DBLINT_ENABLE", "connection_missing_read_only".to_string()),
            ("DBLINT_DISABLE", "blob_missing_free, result_set_unread_column".to_string()),
        ]);

        let policy = Policy::defaults()
            .apply_lookup(|name| env.get(name).cloned())
            .unwrap()
            .build();
        assert!(policy.is_enabled(Check::ConnectionMissingReadOnly));
        assert!(!policy.is_enabled(Check::BlobMissingFree));
        assert!(!policy.is_enabled(Check::ResultSetUnreadColumn));
        assert!(matches!(policy.actions()[1], Action::Panic));
    }

    #[test]
    fn test_policy_serialization() {
        let policy = Policy::all_disabled()
            .add_check(Check::StatementDoubleClose)
            .fail_method(FailMethod::RaiseError)
            .build();

        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["checks"], serde_json::json!(["statement_double_close"]));
        assert_eq!(json["actions"], serde_json::json!([{"write_to_stream": "stderr"}, "raise_error"]));

        let back: Policy = serde_json::from_value(json).unwrap();
        assert!(back.is_enabled(Check::StatementDoubleClose));
        assert_eq!(back.actions().len(), 2);
    }
}
