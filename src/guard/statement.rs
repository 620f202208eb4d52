//! Statement guard, shared by plain and prepared statements
//!
//! # States
//! `Opened -> InAddBatch -> Executed -> Closed`
//!
//! A mutating execute notifies the owning connection guard through a weak
//! back-reference, which feeds its missing-read-only check.

use std::panic::Location;
use std::sync::{Arc, Weak};

use super::connection::ConnectionGuard;
use super::result_set::GuardedResultSet;
use super::{present, GuardCore, Lifecycle, StateCell};
use crate::classify;
use crate::driver::{PreparedStatement, Statement, StatementHandle, Value};
use crate::intercept::{Dispatch, Intercepted, Interceptor, Operation, Outcome};
use crate::policy::{Check, Policy};
use crate::report::{DiagnosticContext, HandleKind, Violation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum StatementState {
    Opened,
    InAddBatch,
    Executed,
    Closed,
}

impl Lifecycle for StatementState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Opened,
            1 => Self::InAddBatch,
            2 => Self::Executed,
            _ => Self::Closed,
        }
    }

    fn into_raw(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum StatementOp {
    AddBatch,
    Execute { mutating: bool },
    ExecuteQuery,
    ExecuteUpdate,
    ExecuteBatch,
    Bind,
    ClearParameters,
    GetResultSet,
    GetUpdateCount,
    GetGeneratedKeys,
    Close,
}

impl Operation for StatementOp {
    fn name(&self) -> &'static str {
        match self {
            Self::AddBatch => "add_batch",
            Self::Execute { .. } => "execute",
            Self::ExecuteQuery => "execute_query",
            Self::ExecuteUpdate => "execute_update",
            Self::ExecuteBatch => "execute_batch",
            Self::Bind => "bind",
            Self::ClearParameters => "clear_parameters",
            Self::GetResultSet => "get_result_set",
            Self::GetUpdateCount => "get_update_count",
            Self::GetGeneratedKeys => "get_generated_keys",
            Self::Close => "close",
        }
    }
}

impl StatementOp {
    const fn is_execute(self) -> bool {
        matches!(
            self,
            Self::Execute { .. } | Self::ExecuteQuery | Self::ExecuteUpdate | Self::ExecuteBatch
        )
    }

    const fn is_mutating(self) -> bool {
        matches!(
            self,
            Self::Execute { mutating: true } | Self::ExecuteUpdate | Self::ExecuteBatch
        )
    }
}

/// Checks enforced for one statement variant
struct StatementChecks {
    double_close: Check,
    missing_close: Check,
    missing_execute: Check,
    missing_execute_batch: Check,
}

static STATEMENT_CHECKS: StatementChecks = StatementChecks {
    double_close: Check::StatementDoubleClose,
    missing_close: Check::StatementMissingClose,
    missing_execute: Check::StatementMissingExecute,
    missing_execute_batch: Check::StatementMissingExecuteBatch,
};

static PREPARED_STATEMENT_CHECKS: StatementChecks = StatementChecks {
    double_close: Check::PreparedStatementDoubleClose,
    missing_close: Check::PreparedStatementMissingClose,
    missing_execute: Check::PreparedStatementMissingExecute,
    missing_execute_batch: Check::PreparedStatementMissingExecuteBatch,
};

pub(crate) struct StatementGuard {
    core: GuardCore,
    checks: &'static StatementChecks,
    state: StateCell<StatementState>,
    connection: Weak<ConnectionGuard>,
}

impl StatementGuard {
    pub(crate) fn new(
        policy: Arc<Policy>,
        kind: HandleKind,
        location: &'static Location<'static>,
        connection: Weak<ConnectionGuard>,
    ) -> Self {
        let checks = match kind {
            HandleKind::PreparedStatement => &PREPARED_STATEMENT_CHECKS,
            _ => &STATEMENT_CHECKS,
        };
        Self {
            core: GuardCore::new(policy, kind, location),
            checks,
            state: StateCell::new(StatementState::Opened),
            connection,
        }
    }

    fn label(&self) -> &'static str {
        self.core.kind().label()
    }

    fn is_closed(&self) -> bool {
        self.state.get() == StatementState::Closed
    }

    fn finalize(&self) -> Result<(), Violation> {
        self.core.finalize(
            self.is_closed(),
            self.checks.missing_close,
            format!("{} not closed", self.label()),
        )
    }

    fn finalize_detached(&self) {
        self.core.finalize_detached(
            self.is_closed(),
            self.checks.missing_close,
            format!("{} not closed", self.label()),
        );
    }
}

impl<S: StatementHandle> Interceptor<S> for StatementGuard {
    type Op = StatementOp;

    fn kind(&self) -> HandleKind {
        self.core.kind()
    }

    fn before_call(&self, op: &StatementOp, _statement: &mut S) -> Result<(), S::Error> {
        match op {
            StatementOp::AddBatch => {
                self.state.update(|s| (s == StatementState::Opened).then_some(StatementState::InAddBatch));
            }
            op if op.is_execute() => {
                self.state.update(|s| (s != StatementState::Closed).then_some(StatementState::Executed));
            }
            _ => {}
        }
        Ok(())
    }

    fn after_call(&self, op: &StatementOp, _statement: &mut S, _outcome: Outcome) -> Result<(), S::Error> {
        if op.is_mutating() {
            if let Some(connection) = self.connection.upgrade() {
                connection.mark_mutated();
            }
        }
        Ok(())
    }

    fn before_release(&self, _op: &StatementOp, statement: &mut S) -> Result<Dispatch, S::Error> {
        let previous = self.state.swap(StatementState::Closed);

        match previous {
            StatementState::Closed if self.core.enabled(self.checks.double_close) => {
                self.core.report(self.checks.double_close, format!("{} already closed", self.label()))?;
            }
            StatementState::Opened if self.core.enabled(self.checks.missing_execute) => {
                statement.close()?;
                self.core.report(self.checks.missing_execute, format!("{} without execute", self.label()))?;
                return Ok(Dispatch::Released);
            }
            StatementState::InAddBatch if self.core.enabled(self.checks.missing_execute_batch) => {
                statement.close()?;
                self.core.report(
                    self.checks.missing_execute_batch,
                    format!("{} addBatch without executeBatch", self.label()),
                )?;
                return Ok(Dispatch::Released);
            }
            _ => {}
        }
        Ok(Dispatch::Forward)
    }
}

/// Guards the result cursors a statement hands out
fn wrap_result_set<S: StatementHandle>(
    guard: &StatementGuard,
    result_set: S::ResultSet,
    location: &'static Location<'static>,
) -> GuardedResultSet<S::ResultSet> {
    GuardedResultSet::at(result_set, Arc::clone(guard.core.policy()), location)
}

/// A plain statement whose usage is checked against a [`Policy`]
pub struct GuardedStatement<S: Statement> {
    engine: Intercepted<S, StatementGuard>,
}

impl<S: Statement> GuardedStatement<S> {
    pub(crate) fn new(statement: S, guard: StatementGuard) -> Self {
        Self { engine: Intercepted::new(statement, guard) }
    }

    /// Where this statement was created
    #[must_use]
    pub fn context(&self) -> &DiagnosticContext {
        self.engine.guard().core.context()
    }

    pub fn add_batch(&self, sql: &str) -> Result<(), S::Error> {
        self.engine.invoke(StatementOp::AddBatch, |s| s.add_batch(sql))
    }

    /// Execute any statement; `true` when it produced a result set
    pub fn execute(&self, sql: &str) -> Result<bool, S::Error> {
        let op = StatementOp::Execute { mutating: classify::is_mutation(sql) };
        self.engine.invoke(op, |s| s.execute(sql))
    }

    #[track_caller]
    pub fn execute_query(&self, sql: &str) -> Result<GuardedResultSet<S::ResultSet>, S::Error> {
        let location = Location::caller();
        let result_set = self.engine.invoke(StatementOp::ExecuteQuery, |s| s.execute_query(sql))?;
        Ok(wrap_result_set::<S>(self.engine.guard(), result_set, location))
    }

    pub fn execute_update(&self, sql: &str) -> Result<u64, S::Error> {
        self.engine.invoke(StatementOp::ExecuteUpdate, |s| s.execute_update(sql))
    }

    pub fn execute_batch(&self) -> Result<Vec<u64>, S::Error> {
        self.engine.invoke(StatementOp::ExecuteBatch, S::execute_batch)
    }

    #[track_caller]
    pub fn get_result_set(&self) -> Result<Option<GuardedResultSet<S::ResultSet>>, S::Error> {
        let location = Location::caller();
        let result_set = self.engine.invoke_with(StatementOp::GetResultSet, S::get_result_set, present)?;
        Ok(result_set.map(|rs| wrap_result_set::<S>(self.engine.guard(), rs, location)))
    }

    /// Update count of the last execute; `None` when it produced rows
    pub fn get_update_count(&self) -> Result<Option<u64>, S::Error> {
        self.engine.invoke(StatementOp::GetUpdateCount, S::get_update_count)
    }

    #[track_caller]
    pub fn get_generated_keys(&self) -> Result<Option<GuardedResultSet<S::ResultSet>>, S::Error> {
        let location = Location::caller();
        let keys = self.engine.invoke_with(StatementOp::GetGeneratedKeys, S::get_generated_keys, present)?;
        Ok(keys.map(|rs| wrap_result_set::<S>(self.engine.guard(), rs, location)))
    }

    pub fn close(&self) -> Result<(), S::Error> {
        self.engine.release(StatementOp::Close, S::close)
    }

    /// Report "Statement not closed" if `close` was never called
    pub fn finalize(&self) -> Result<(), S::Error> {
        self.engine.guard().finalize()?;
        Ok(())
    }
}

impl<S: Statement> Drop for GuardedStatement<S> {
    fn drop(&mut self) {
        self.engine.guard().finalize_detached();
    }
}

/// A prepared statement whose usage is checked against a [`Policy`]
pub struct GuardedPreparedStatement<P: PreparedStatement> {
    engine: Intercepted<P, StatementGuard>,
    mutating: bool,
}

impl<P: PreparedStatement> GuardedPreparedStatement<P> {
    pub(crate) fn new(statement: P, guard: StatementGuard) -> Self {
        let mutating = classify::is_mutation(statement.sql());
        Self { engine: Intercepted::new(statement, guard), mutating }
    }

    /// Where this statement was prepared
    #[must_use]
    pub fn context(&self) -> &DiagnosticContext {
        self.engine.guard().core.context()
    }

    /// Bind a value to a 1-based parameter index
    pub fn bind(&self, index: usize, value: impl Into<Value>) -> Result<(), P::Error> {
        let value = value.into();
        self.engine.invoke(StatementOp::Bind, |s| s.bind(index, value))
    }

    pub fn clear_parameters(&self) -> Result<(), P::Error> {
        self.engine.invoke(StatementOp::ClearParameters, P::clear_parameters)
    }

    /// Queue the currently bound parameters
    pub fn add_batch(&self) -> Result<(), P::Error> {
        self.engine.invoke(StatementOp::AddBatch, P::add_batch)
    }

    pub fn execute(&self) -> Result<bool, P::Error> {
        self.engine.invoke(StatementOp::Execute { mutating: self.mutating }, P::execute)
    }

    #[track_caller]
    pub fn execute_query(&self) -> Result<GuardedResultSet<P::ResultSet>, P::Error> {
        let location = Location::caller();
        let result_set = self.engine.invoke(StatementOp::ExecuteQuery, P::execute_query)?;
        Ok(wrap_result_set::<P>(self.engine.guard(), result_set, location))
    }

    pub fn execute_update(&self) -> Result<u64, P::Error> {
        self.engine.invoke(StatementOp::ExecuteUpdate, P::execute_update)
    }

    pub fn execute_batch(&self) -> Result<Vec<u64>, P::Error> {
        self.engine.invoke(StatementOp::ExecuteBatch, P::execute_batch)
    }

    #[track_caller]
    pub fn get_result_set(&self) -> Result<Option<GuardedResultSet<P::ResultSet>>, P::Error> {
        let location = Location::caller();
        let result_set = self.engine.invoke_with(StatementOp::GetResultSet, P::get_result_set, present)?;
        Ok(result_set.map(|rs| wrap_result_set::<P>(self.engine.guard(), rs, location)))
    }

    /// Update count of the last execute; `None` when it produced rows
    pub fn get_update_count(&self) -> Result<Option<u64>, P::Error> {
        self.engine.invoke(StatementOp::GetUpdateCount, P::get_update_count)
    }

    #[track_caller]
    pub fn get_generated_keys(&self) -> Result<Option<GuardedResultSet<P::ResultSet>>, P::Error> {
        let location = Location::caller();
        let keys = self.engine.invoke_with(StatementOp::GetGeneratedKeys, P::get_generated_keys, present)?;
        Ok(keys.map(|rs| wrap_result_set::<P>(self.engine.guard(), rs, location)))
    }

    pub fn close(&self) -> Result<(), P::Error> {
        self.engine.release(StatementOp::Close, P::close)
    }

    /// Report "PreparedStatement not closed" if `close` was never called
    pub fn finalize(&self) -> Result<(), P::Error> {
        self.engine.guard().finalize()?;
        Ok(())
    }
}

impl<P: PreparedStatement> Drop for GuardedPreparedStatement<P> {
    fn drop(&mut self) {
        self.engine.guard().finalize_detached();
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::driver::sqlite::SqliteDataSource;
    use crate::guard::GuardedDataSource;
    use crate::policy::{Action, FailMethod, PolicyBuilder};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    type Seen = Arc<Mutex<Vec<(Check, String)>>>;

    fn recording(builder: PolicyBuilder) -> (GuardedDataSource<SqliteDataSource>, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let policy = builder
            .action(Action::callback(move |v: &Violation| {
                sink.lock().push((v.check(), v.message().to_string()));
            }))
            .build();
        (GuardedDataSource::new(SqliteDataSource::in_memory().unwrap(), policy), seen)
    }

    #[test]
    fn test_statement_without_execute() {
        let (source, seen) = recording(Policy::defaults());
        let conn = source.get_connection().unwrap();
        let stmt = conn.create_statement().unwrap();
        stmt.close().unwrap();
        assert_eq!(
            *seen.lock(),
            vec![(Check::StatementMissingExecute, "Statement without execute".to_string())]
        );
        conn.close().unwrap();
    }

    #[test]
    fn test_prepared_statement_messages_use_its_kind() {
        let (source, seen) = recording(Policy::defaults());
        let conn = source.get_connection().unwrap();
        let stmt = conn.prepare_statement("SELECT 1").unwrap();
        stmt.close().unwrap();
        stmt.close().unwrap();
        assert_eq!(
            *seen.lock(),
            vec![
                (Check::PreparedStatementMissingExecute, "PreparedStatement without execute".to_string()),
                (Check::PreparedStatementDoubleClose, "PreparedStatement already closed".to_string()),
            ]
        );
        conn.close().unwrap();
    }

    #[test]
    fn test_add_batch_without_execute_batch() {
        let source = GuardedDataSource::new(
            SqliteDataSource::in_memory().unwrap(),
            Policy::defaults().fail_method(FailMethod::RaiseError).build(),
        );
        let conn = source.get_connection().unwrap();
        let stmt = conn.create_statement().unwrap();
        stmt.add_batch("CREATE TABLE t (v INTEGER)").unwrap();

        let err = stmt.close().unwrap_err();
        assert_eq!(err.message(), "Statement addBatch without executeBatch");
        // The statement was closed before the violation was raised
        assert!(stmt.close().unwrap_err().message().contains("already closed"));
        conn.close().unwrap();
    }

    #[test]
    fn test_execute_batch_suppresses_violation() {
        let (source, seen) = recording(Policy::defaults());
        let conn = source.get_connection().unwrap();
        let stmt = conn.create_statement().unwrap();
        stmt.add_batch("CREATE TABLE t (v INTEGER)").unwrap();
        stmt.add_batch("INSERT INTO t VALUES (1)").unwrap();
        assert_eq!(stmt.execute_batch().unwrap(), vec![0, 1]);
        stmt.close().unwrap();
        conn.close().unwrap();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_add_batch_after_execute_is_not_flagged() {
        let (source, seen) = recording(Policy::defaults());
        let conn = source.get_connection().unwrap();
        let stmt = conn.create_statement().unwrap();
        stmt.execute_update("CREATE TABLE t (v INTEGER)").unwrap();
        stmt.add_batch("INSERT INTO t VALUES (1)").unwrap();
        stmt.close().unwrap();
        conn.close().unwrap();
        // State only moves forward; executed stays executed
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_mutating_execute_marks_connection() {
        let (source, seen) = recording(Policy::defaults().add_check(Check::ConnectionMissingReadOnly));
        let conn = source.get_connection().unwrap();
        let stmt = conn.create_statement().unwrap();
        assert!(!stmt.execute("CREATE TABLE t (v INTEGER)").unwrap());
        stmt.close().unwrap();
        conn.close().unwrap();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_query_execute_does_not_mark_connection() {
        let (source, seen) = recording(Policy::defaults().add_check(Check::ConnectionMissingReadOnly));
        let conn = source.get_connection().unwrap();
        let stmt = conn.create_statement().unwrap();
        assert!(stmt.execute("SELECT 1").unwrap());
        let rs = stmt.get_result_set().unwrap().unwrap();
        rs.close().unwrap();
        stmt.close().unwrap();
        conn.close().unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].0, Check::ConnectionMissingReadOnly);
    }

    #[test]
    fn test_generated_keys_are_guarded() {
        let (source, seen) = recording(Policy::defaults());
        let conn = source.get_connection().unwrap();
        let ddl = conn.create_statement().unwrap();
        ddl.execute_update("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
        ddl.close().unwrap();

        let insert = conn.prepare_statement("INSERT INTO t (v) VALUES (?)").unwrap();
        insert.bind(1, "a").unwrap();
        assert_eq!(insert.execute_update().unwrap(), 1);
        let keys = insert.get_generated_keys().unwrap().unwrap();
        assert!(keys.next().unwrap());
        assert_eq!(keys.get(1_usize).unwrap(), Value::Integer(1));
        keys.close().unwrap();
        keys.close().unwrap();
        insert.close().unwrap();
        conn.close().unwrap();

        assert_eq!(
            *seen.lock(),
            vec![(Check::ResultSetDoubleClose, "ResultSet already closed".to_string())]
        );
    }

    #[test]
    fn test_finalize_reports_unclosed_statement() {
        let (source, seen) = recording(Policy::defaults());
        let conn = source.get_connection().unwrap();
        let stmt = conn.create_statement().unwrap();
        stmt.execute("SELECT 1").unwrap();
        stmt.finalize().unwrap();
        drop(stmt);
        conn.close().unwrap();

        assert_eq!(
            *seen.lock(),
            vec![(Check::StatementMissingClose, "Statement not closed".to_string())]
        );
    }
}
