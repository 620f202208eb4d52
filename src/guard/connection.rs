//! Connection guard and the data-source entry point
//!
//! # States
//! `Opened -> InTransaction -> Committed -> Closed`, with `Committed` going
//! back to `InTransaction` when another statement is created.
//!
//! # Close Checks (in order, first match wins)
//! 1. double close
//! 2. missing commit or rollback (auto-commit off, statements created since
//!    the last commit/rollback)
//! 3. missing statement (no statement ever created)
//! 4. missing read-only, reported after the real close

use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::statement::{GuardedPreparedStatement, GuardedStatement, StatementGuard};
use super::{GuardCore, Lifecycle, StateCell};
use crate::driver::{Connection, DataSource};
use crate::intercept::{Dispatch, Intercepted, Interceptor, Operation, Outcome};
use crate::policy::{Check, Policy};
use crate::report::{DiagnosticContext, HandleKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ConnectionState {
    Opened,
    InTransaction,
    Committed,
    Closed,
}

impl Lifecycle for ConnectionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Opened,
            1 => Self::InTransaction,
            2 => Self::Committed,
            _ => Self::Closed,
        }
    }

    fn into_raw(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ConnectionOp {
    CreateStatement,
    PrepareStatement,
    Commit,
    Rollback,
    SetAutoCommit,
    GetAutoCommit,
    SetReadOnly,
    IsReadOnly,
    Close,
}

impl Operation for ConnectionOp {
    fn name(&self) -> &'static str {
        match self {
            Self::CreateStatement => "create_statement",
            Self::PrepareStatement => "prepare_statement",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::SetAutoCommit => "set_auto_commit",
            Self::GetAutoCommit => "auto_commit",
            Self::SetReadOnly => "set_read_only",
            Self::IsReadOnly => "is_read_only",
            Self::Close => "close",
        }
    }
}

pub(crate) struct ConnectionGuard {
    core: GuardCore,
    state: StateCell<ConnectionState>,
    mutated: AtomicBool,
    suggest_read_only: AtomicBool,
}

impl ConnectionGuard {
    fn new(policy: Arc<Policy>, location: &'static Location<'static>) -> Self {
        Self {
            core: GuardCore::new(policy, HandleKind::Connection, location),
            state: StateCell::new(ConnectionState::Opened),
            mutated: AtomicBool::new(false),
            suggest_read_only: AtomicBool::new(false),
        }
    }

    /// Record that a statement of this connection changed data
    pub(crate) fn mark_mutated(&self) {
        self.mutated.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.state.get() == ConnectionState::Closed
    }

    /// Close the real handle ahead of a report; on failure the guard reopens
    fn force_close<C: Connection>(&self, connection: &mut C, previous: ConnectionState) -> Result<(), C::Error> {
        connection.close().inspect_err(|_| {
            self.state.swap(previous);
        })
    }
}

impl<C: Connection> Interceptor<C> for ConnectionGuard {
    type Op = ConnectionOp;

    fn kind(&self) -> HandleKind {
        HandleKind::Connection
    }

    fn before_call(&self, op: &ConnectionOp, _connection: &mut C) -> Result<(), C::Error> {
        if matches!(op, ConnectionOp::Commit | ConnectionOp::Rollback) {
            self.state.update(|s| (s != ConnectionState::Closed).then_some(ConnectionState::Committed));
        }
        Ok(())
    }

    fn after_call(&self, op: &ConnectionOp, _connection: &mut C, _outcome: Outcome) -> Result<(), C::Error> {
        match op {
            ConnectionOp::CreateStatement | ConnectionOp::PrepareStatement => {
                self.state.update(|s| {
                    matches!(s, ConnectionState::Opened | ConnectionState::Committed)
                        .then_some(ConnectionState::InTransaction)
                });
            }
            ConnectionOp::Close if self.suggest_read_only.swap(false, Ordering::AcqRel) => {
                self.core.report(
                    Check::ConnectionMissingReadOnly,
                    "Connection did not execute updates, consider declaring read-only",
                )?;
            }
            _ => {}
        }
        Ok(())
    }

    fn before_release(&self, _op: &ConnectionOp, connection: &mut C) -> Result<Dispatch, C::Error> {
        self.suggest_read_only.store(false, Ordering::Release);
        let current = self.state.get();

        // Ask the driver before marking the guard closed
        let suggest = current != ConnectionState::Closed
            && self.core.enabled(Check::ConnectionMissingReadOnly)
            && !self.mutated.load(Ordering::Acquire)
            && !connection.is_read_only()?;
        let uncommitted = current == ConnectionState::InTransaction
            && self.core.enabled(Check::ConnectionMissingCommitOrRollback)
            && !connection.auto_commit()?;

        let previous = self.state.swap(ConnectionState::Closed);

        if previous == ConnectionState::Closed {
            if self.core.enabled(Check::ConnectionDoubleClose) {
                self.core.report(Check::ConnectionDoubleClose, "Connection already closed")?;
            }
            return Ok(Dispatch::Forward);
        }

        if uncommitted {
            self.force_close(connection, previous)?;
            self.core.report(
                Check::ConnectionMissingCommitOrRollback,
                "Connection did not commit or roll back",
            )?;
            return Ok(Dispatch::Released);
        }

        if previous == ConnectionState::Opened && self.core.enabled(Check::ConnectionMissingStatement) {
            self.force_close(connection, previous)?;
            self.core.report(Check::ConnectionMissingStatement, "Connection without statement")?;
            return Ok(Dispatch::Released);
        }

        self.suggest_read_only.store(suggest, Ordering::Release);
        Ok(Dispatch::Forward)
    }
}

/// A connection whose usage is checked against a [`Policy`]
///
/// Statements created through it are guarded too.
pub struct GuardedConnection<C: Connection> {
    engine: Intercepted<C, Arc<ConnectionGuard>>,
}

impl<C: Connection> GuardedConnection<C> {
    /// Guard a connection obtained outside a [`GuardedDataSource`]
    #[track_caller]
    pub fn wrap(connection: C, policy: Arc<Policy>) -> Self {
        Self::at(connection, policy, Location::caller())
    }

    pub(crate) fn at(connection: C, policy: Arc<Policy>, location: &'static Location<'static>) -> Self {
        let guard = Arc::new(ConnectionGuard::new(policy, location));
        Self { engine: Intercepted::new(connection, guard) }
    }

    /// Where this connection was obtained
    #[must_use]
    pub fn context(&self) -> &DiagnosticContext {
        self.engine.guard().core.context()
    }

    fn policy(&self) -> Arc<Policy> {
        Arc::clone(self.engine.guard().core.policy())
    }

    #[track_caller]
    pub fn create_statement(&self) -> Result<GuardedStatement<C::Statement>, C::Error> {
        let location = Location::caller();
        let statement = self.engine.invoke(ConnectionOp::CreateStatement, C::create_statement)?;
        let guard = StatementGuard::new(
            self.policy(),
            HandleKind::Statement,
            location,
            Arc::downgrade(self.engine.guard()),
        );
        Ok(GuardedStatement::new(statement, guard))
    }

    #[track_caller]
    pub fn prepare_statement(&self, sql: &str) -> Result<GuardedPreparedStatement<C::PreparedStatement>, C::Error> {
        let location = Location::caller();
        let statement =
            self.engine.invoke(ConnectionOp::PrepareStatement, |c| c.prepare_statement(sql))?;
        let guard = StatementGuard::new(
            self.policy(),
            HandleKind::PreparedStatement,
            location,
            Arc::downgrade(self.engine.guard()),
        );
        Ok(GuardedPreparedStatement::new(statement, guard))
    }

    pub fn commit(&self) -> Result<(), C::Error> {
        self.engine.invoke(ConnectionOp::Commit, C::commit)
    }

    pub fn rollback(&self) -> Result<(), C::Error> {
        self.engine.invoke(ConnectionOp::Rollback, C::rollback)
    }

    pub fn set_auto_commit(&self, auto_commit: bool) -> Result<(), C::Error> {
        self.engine.invoke(ConnectionOp::SetAutoCommit, |c| c.set_auto_commit(auto_commit))
    }

    pub fn auto_commit(&self) -> Result<bool, C::Error> {
        self.engine.invoke(ConnectionOp::GetAutoCommit, C::auto_commit)
    }

    pub fn set_read_only(&self, read_only: bool) -> Result<(), C::Error> {
        self.engine.invoke(ConnectionOp::SetReadOnly, |c| c.set_read_only(read_only))
    }

    pub fn is_read_only(&self) -> Result<bool, C::Error> {
        self.engine.invoke(ConnectionOp::IsReadOnly, C::is_read_only)
    }

    pub fn close(&self) -> Result<(), C::Error> {
        self.engine.release(ConnectionOp::Close, C::close)
    }

    /// Report "Connection not closed" if `close` was never called
    pub fn finalize(&self) -> Result<(), C::Error> {
        let guard = self.engine.guard();
        guard.core.finalize(guard.is_closed(), Check::ConnectionMissingClose, "Connection not closed")?;
        Ok(())
    }
}

impl<C: Connection> Drop for GuardedConnection<C> {
    fn drop(&mut self) {
        let guard = self.engine.guard();
        guard.core.finalize_detached(
            guard.is_closed(),
            Check::ConnectionMissingClose,
            "Connection not closed",
        );
    }
}

/// Entry point wrapping every connection it hands out
pub struct GuardedDataSource<D: DataSource> {
    source: D,
    policy: Arc<Policy>,
}

impl<D: DataSource> GuardedDataSource<D> {
    pub fn new(source: D, policy: impl Into<Arc<Policy>>) -> Self {
        Self { source, policy: policy.into() }
    }

    #[must_use]
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The unguarded data source
    #[must_use]
    pub const fn inner(&self) -> &D {
        &self.source
    }

    #[track_caller]
    pub fn get_connection(&self) -> Result<GuardedConnection<D::Connection>, D::Error> {
        let location = Location::caller();
        let connection = self.source.get_connection()?;
        tracing::trace!(location = %location, "guarding new connection");
        Ok(GuardedConnection::at(connection, Arc::clone(&self.policy), location))
    }
}
