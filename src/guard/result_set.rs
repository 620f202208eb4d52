//! Result cursor guard
//!
//! Tracks the columns of the current row that have not been read yet. Column
//! names are compared lowercased, so reading by index or by label in any case
//! marks the same column as read.

use parking_lot::Mutex;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::blob::GuardedBlob;
use super::{present, GuardCore};
use crate::driver::{Column, ResultSet, Value};
use crate::intercept::{Dispatch, Intercepted, Interceptor, Operation, Outcome};
use crate::policy::{Check, Policy};
use crate::report::{DiagnosticContext, HandleKind};

#[derive(Debug, Clone)]
pub(crate) enum ResultSetOp {
    Next,
    ColumnCount,
    ColumnLabel,
    Get(Column),
    GetBlob(Column),
    ClearPendingReads,
    Close,
}

impl Operation for ResultSetOp {
    fn name(&self) -> &'static str {
        match self {
            Self::Next => "next",
            Self::ColumnCount => "column_count",
            Self::ColumnLabel => "column_label",
            Self::Get(_) => "get",
            Self::GetBlob(_) => "get_blob",
            Self::ClearPendingReads => "clear_pending_reads",
            Self::Close => "close",
        }
    }
}

pub(crate) struct ResultSetGuard {
    core: GuardCore,
    closed: AtomicBool,
    /// Unread columns of the current row, in column order
    unread: Mutex<Vec<String>>,
}

impl ResultSetGuard {
    fn new(policy: Arc<Policy>, location: &'static Location<'static>) -> Self {
        Self {
            core: GuardCore::new(policy, HandleKind::ResultSet, location),
            closed: AtomicBool::new(false),
            unread: Mutex::new(Vec::new()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// First unread column of the row; clears the pending set
    fn take_unread(&self) -> Option<String> {
        let mut unread = self.unread.lock();
        let first = unread.first().cloned();
        unread.clear();
        first
    }

    fn mark_read<R: ResultSet>(&self, column: &Column, result_set: &mut R) {
        if self.unread.lock().is_empty() {
            return;
        }
        let name = match column {
            Column::Label(label) => label.to_lowercase(),
            // An out-of-range index fails in the forwarded call
            Column::Index(index) => match result_set.column_label(*index) {
                Ok(label) => label.to_lowercase(),
                Err(_) => return,
            },
        };
        self.unread.lock().retain(|c| *c != name);
    }

    fn unread_message(column: &str) -> String {
        format!("ResultSet has unread column: {column}")
    }
}

impl<R: ResultSet> Interceptor<R> for ResultSetGuard {
    type Op = ResultSetOp;

    fn kind(&self) -> HandleKind {
        HandleKind::ResultSet
    }

    fn before_call(&self, op: &ResultSetOp, result_set: &mut R) -> Result<(), R::Error> {
        match op {
            ResultSetOp::Next if self.core.enabled(Check::ResultSetUnreadColumn) => {
                if let Some(column) = self.take_unread() {
                    self.core.report(Check::ResultSetUnreadColumn, Self::unread_message(&column))?;
                }
            }
            ResultSetOp::Get(column) | ResultSetOp::GetBlob(column) => {
                self.mark_read(column, result_set);
            }
            ResultSetOp::ClearPendingReads => self.unread.lock().clear(),
            _ => {}
        }
        Ok(())
    }

    fn after_call(&self, op: &ResultSetOp, result_set: &mut R, outcome: Outcome) -> Result<(), R::Error> {
        match (op, outcome) {
            (ResultSetOp::Next, Outcome::Row(true)) if self.core.enabled(Check::ResultSetUnreadColumn) => {
                let count = result_set.column_count()?;
                let columns = (1..=count)
                    .map(|index| result_set.column_label(index).map(|label| label.to_lowercase()))
                    .collect::<Result<Vec<_>, _>>()?;
                *self.unread.lock() = columns;
            }
            (ResultSetOp::Next, _) => self.unread.lock().clear(),
            _ => {}
        }
        Ok(())
    }

    fn before_release(&self, _op: &ResultSetOp, result_set: &mut R) -> Result<Dispatch, R::Error> {
        if self.closed.swap(true, Ordering::AcqRel) && self.core.enabled(Check::ResultSetDoubleClose) {
            self.core.report(Check::ResultSetDoubleClose, "ResultSet already closed")?;
        }

        if let Some(column) = self.take_unread() {
            result_set.close()?;
            self.core.report(Check::ResultSetUnreadColumn, Self::unread_message(&column))?;
            return Ok(Dispatch::Released);
        }
        Ok(Dispatch::Forward)
    }
}

/// A result cursor whose usage is checked against a [`Policy`]
pub struct GuardedResultSet<R: ResultSet> {
    engine: Intercepted<R, ResultSetGuard>,
}

impl<R: ResultSet> GuardedResultSet<R> {
    pub(crate) fn at(result_set: R, policy: Arc<Policy>, location: &'static Location<'static>) -> Self {
        Self { engine: Intercepted::new(result_set, ResultSetGuard::new(policy, location)) }
    }

    /// Where this result set was obtained
    #[must_use]
    pub fn context(&self) -> &DiagnosticContext {
        self.engine.guard().core.context()
    }

    /// Advance to the next row; `false` once rows are exhausted
    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> Result<bool, R::Error> {
        self.engine.invoke_with(ResultSetOp::Next, R::next, |row| Outcome::Row(*row))
    }

    pub fn column_count(&self) -> Result<usize, R::Error> {
        self.engine.invoke(ResultSetOp::ColumnCount, R::column_count)
    }

    /// Label of a 1-based column
    pub fn column_label(&self, index: usize) -> Result<String, R::Error> {
        self.engine.invoke(ResultSetOp::ColumnLabel, |rs| rs.column_label(index))
    }

    /// Value of a column in the current row, by 1-based index or label
    pub fn get(&self, column: impl Into<Column>) -> Result<Value, R::Error> {
        let column = column.into();
        self.engine.invoke(ResultSetOp::Get(column.clone()), |rs| rs.get(&column))
    }

    /// Large object in the current row; `None` for SQL NULL
    #[track_caller]
    pub fn get_blob(&self, column: impl Into<Column>) -> Result<Option<GuardedBlob<R::Blob>>, R::Error> {
        let location = Location::caller();
        let column = column.into();
        let blob = self.engine.invoke_with(
            ResultSetOp::GetBlob(column.clone()),
            |rs| rs.get_blob(&column),
            present,
        )?;
        let policy = self.engine.guard().core.policy();
        Ok(blob.map(|blob| GuardedBlob::at(blob, Arc::clone(policy), location)))
    }

    /// Drop the pending unread-column report for the current row
    pub fn clear_pending_reads(&self) -> Result<(), R::Error> {
        self.engine.invoke(ResultSetOp::ClearPendingReads, R::clear_warnings)
    }

    pub fn close(&self) -> Result<(), R::Error> {
        self.engine.release(ResultSetOp::Close, R::close)
    }

    /// Report "ResultSet not closed" if `close` was never called
    pub fn finalize(&self) -> Result<(), R::Error> {
        let guard = self.engine.guard();
        guard.core.finalize(guard.is_closed(), Check::ResultSetMissingClose, "ResultSet not closed")?;
        Ok(())
    }
}

impl<R: ResultSet> Drop for GuardedResultSet<R> {
    fn drop(&mut self) {
        let guard = self.engine.guard();
        guard.core.finalize_detached(guard.is_closed(), Check::ResultSetMissingClose, "ResultSet not closed");
    }
}
