//! Violations and the Action Dispatcher
//!
//! A [`Violation`] is a failed check plus the [`DiagnosticContext`] captured
//! when the offending handle was wrapped. [`dispatch`] runs a policy's action
//! list over a violation, in order, on the calling thread.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::policy::{Action, Check, LogTarget};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Kind of handle a guard wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Connection,
    Statement,
    PreparedStatement,
    ResultSet,
    Blob,
}

impl HandleKind {
    /// Name used in violation messages
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Connection => "Connection",
            Self::Statement => "Statement",
            Self::PreparedStatement => "PreparedStatement",
            Self::ResultSet => "ResultSet",
            Self::Blob => "Blob",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where and when a handle was wrapped
///
/// Captured once at wrap time and attached to every violation later raised
/// about the handle. The backtrace is only resolved when `RUST_BACKTRACE` or
/// `RUST_LIB_BACKTRACE` enables it.
#[derive(Debug)]
pub struct DiagnosticContext {
    handle: HandleKind,
    id: u64,
    location: &'static Location<'static>,
    thread: Option<String>,
    backtrace: Backtrace,
}

impl DiagnosticContext {
    /// Capture a context at the caller's location
    #[track_caller]
    #[must_use]
    pub fn capture(handle: HandleKind) -> Self {
        Self::at(handle, Location::caller())
    }

    /// Capture a context for a known location
    #[must_use]
    pub fn at(handle: HandleKind, location: &'static Location<'static>) -> Self {
        Self {
            handle,
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            location,
            thread: std::thread::current().name().map(str::to_owned),
            backtrace: Backtrace::capture(),
        }
    }

    #[must_use]
    pub const fn handle(&self) -> HandleKind {
        self.handle
    }

    /// Process-unique handle id
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Source location that created the handle
    #[must_use]
    pub const fn location(&self) -> &'static Location<'static> {
        self.location
    }

    #[must_use]
    pub fn thread(&self) -> Option<&str> {
        self.thread.as_deref()
    }

    #[must_use]
    pub const fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl fmt::Display for DiagnosticContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{} created at {}", self.handle, self.id, self.location)?;
        if let Some(thread) = &self.thread {
            write!(f, " on thread '{thread}'")?;
        }
        Ok(())
    }
}

/// A detected usage-contract breach
#[derive(Debug, Clone)]
pub struct Violation {
    check: Check,
    message: String,
    context: Arc<DiagnosticContext>,
}

impl Violation {
    pub fn new(
        check: Check,
        message: impl Into<String>,
        context: impl Into<Arc<DiagnosticContext>>,
    ) -> Self {
        Self { check, message: message.into(), context: context.into() }
    }

    #[must_use]
    pub const fn check(&self) -> Check {
        self.check
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn context(&self) -> &DiagnosticContext {
        &self.context
    }

    /// Text record written by the write-to-stream action
    #[must_use]
    pub fn render(&self) -> String {
        let mut record = format!("{}\n    at {}\n", self.message, self.context);
        let backtrace = self.context.backtrace();
        if backtrace.status() == BacktraceStatus::Captured {
            record.push_str(&format!("{backtrace}\n"));
        }
        record
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Violation {}

#[derive(Clone, Copy)]
enum Failure {
    Raise,
    Panic,
}

/// Run every action over a violation, in order
///
/// The first raise-error or panic action decides how the call fails, but only
/// after all later actions have run too. Terminate exits immediately.
pub fn dispatch(actions: &[Action], violation: Violation) -> Result<(), Violation> {
    match run_actions(actions, &violation) {
        None => Ok(()),
        Some(Failure::Raise) => Err(violation),
        Some(Failure::Panic) => panic!("{violation}"),
    }
}

/// Like [`dispatch`], for callers that cannot fail or unwind
///
/// Raise-error and panic outcomes are downgraded to an error event.
pub fn dispatch_detached(actions: &[Action], violation: Violation) {
    if run_actions(actions, &violation).is_some() {
        tracing::error!(
            check = %violation.check(),
            handle = %violation.context(),
            "{} (detected during drop, cannot be raised)",
            violation.message()
        );
    }
}

fn run_actions(actions: &[Action], violation: &Violation) -> Option<Failure> {
    let context = violation.context();
    tracing::warn!(
        check = %violation.check(),
        handle = %context.handle(),
        id = context.id(),
        location = %context.location(),
        "{}",
        violation.message()
    );

    let mut failure = None;
    for action in actions {
        match action {
            Action::WriteToStream(target) => write_record(target, violation),
            Action::RaiseError => {
                failure.get_or_insert(Failure::Raise);
            }
            Action::Panic => {
                failure.get_or_insert(Failure::Panic);
            }
            Action::Terminate => {
                tracing::error!(check = %violation.check(), "terminating on violation");
                std::process::exit(1);
            }
            Action::NoOp => {}
            Action::Callback(callback) => callback.call(violation),
        }
    }
    failure
}

fn write_record(target: &LogTarget, violation: &Violation) {
    let record = violation.render();
    let result = match target {
        LogTarget::Stderr => std::io::stderr().lock().write_all(record.as_bytes()),
        LogTarget::File(path) => OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(record.as_bytes())),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, target = ?target, "failed to write violation record");
    }
}
