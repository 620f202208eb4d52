//! Guard State Machines and Wrapped Handles
//!
//! Each wrapper type pairs a driver handle with a guard through the
//! interception engine. Wrapping composes: a guarded data source hands out
//! guarded connections, which hand out guarded statements, which hand out
//! guarded result sets, which hand out guarded blobs. Once a caller holds a
//! guarded entry point every handle it obtains is observed.
//!
//! # Lifecycle State
//! Guard state lives in atomics. Terminal transitions (closed, freed) are a
//! single `swap`, so two threads closing the same handle cannot both see it
//! open.
//!
//! # Leak Detection
//! Missing close/free checks run in two places:
//! - `finalize()`, an explicit disposal hook that reports through the full
//!   action pipeline and can return the violation as an error
//! - `Drop`, a best-effort fallback that cannot fail: raise-error and panic
//!   actions are downgraded to an error event
//!
//! Each handle reports a leak at most once.

mod blob;
mod connection;
mod result_set;
mod statement;

pub use blob::GuardedBlob;
pub use connection::{GuardedConnection, GuardedDataSource};
pub use result_set::GuardedResultSet;
pub use statement::{GuardedPreparedStatement, GuardedStatement};

use std::marker::PhantomData;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crate::intercept::Outcome;
use crate::policy::{Check, Policy};
use crate::report::{DiagnosticContext, HandleKind, Violation};

/// Lifecycle enum storable in a [`StateCell`]
pub(crate) trait Lifecycle: Copy + Eq {
    fn from_raw(raw: u8) -> Self;
    fn into_raw(self) -> u8;
}

/// Atomic cell holding a lifecycle state
pub(crate) struct StateCell<S> {
    raw: AtomicU8,
    marker: PhantomData<S>,
}

impl<S: Lifecycle> StateCell<S> {
    pub(crate) fn new(initial: S) -> Self {
        Self { raw: AtomicU8::new(initial.into_raw()), marker: PhantomData }
    }

    pub(crate) fn get(&self) -> S {
        S::from_raw(self.raw.load(Ordering::Acquire))
    }

    /// Store `next`, returning the previous state
    pub(crate) fn swap(&self, next: S) -> S {
        S::from_raw(self.raw.swap(next.into_raw(), Ordering::AcqRel))
    }

    /// Atomically apply `step`; `None` leaves the state unchanged
    ///
    /// Returns the state observed before the update.
    pub(crate) fn update(&self, step: impl Fn(S) -> Option<S>) -> S {
        let result = self.raw.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            step(S::from_raw(raw)).map(Lifecycle::into_raw)
        });
        S::from_raw(match result {
            Ok(raw) | Err(raw) => raw,
        })
    }
}

/// Outcome of a call returning an optional child handle
pub(crate) fn present<T>(result: &Option<T>) -> Outcome {
    if result.is_some() {
        Outcome::Completed
    } else {
        Outcome::Absent
    }
}

/// Policy, birth context and leak bookkeeping shared by every guard
pub(crate) struct GuardCore {
    policy: Arc<Policy>,
    context: Arc<DiagnosticContext>,
    finalized: AtomicBool,
}

impl GuardCore {
    pub(crate) fn new(
        policy: Arc<Policy>,
        handle: HandleKind,
        location: &'static Location<'static>,
    ) -> Self {
        Self {
            policy,
            context: Arc::new(DiagnosticContext::at(handle, location)),
            finalized: AtomicBool::new(false),
        }
    }

    pub(crate) const fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    pub(crate) fn kind(&self) -> HandleKind {
        self.context.handle()
    }

    pub(crate) fn context(&self) -> &DiagnosticContext {
        &self.context
    }

    pub(crate) fn enabled(&self, check: Check) -> bool {
        self.policy.is_enabled(check)
    }

    /// Run the action pipeline for a failed check
    pub(crate) fn report(&self, check: Check, message: impl Into<String>) -> Result<(), Violation> {
        self.policy.report(check, message, &self.context)
    }

    /// Missing close/free check for `finalize()`
    pub(crate) fn finalize(
        &self,
        released: bool,
        check: Check,
        message: impl Into<String>,
    ) -> Result<(), Violation> {
        if self.should_report_leak(released, check) {
            self.report(check, message)?;
        }
        Ok(())
    }

    /// Missing close/free check for `Drop`
    pub(crate) fn finalize_detached(&self, released: bool, check: Check, message: impl Into<String>) {
        if self.should_report_leak(released, check) {
            self.policy.report_detached(check, message, &self.context);
        }
    }

    fn should_report_leak(&self, released: bool, check: Check) -> bool {
        !released && self.enabled(check) && !self.finalized.swap(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Action, FailMethod};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Light {
        Off,
        On,
        Broken,
    }

    impl Lifecycle for Light {
        fn from_raw(raw: u8) -> Self {
            match raw {
                0 => Self::Off,
                1 => Self::On,
                _ => Self::Broken,
            }
        }

        fn into_raw(self) -> u8 {
            self as u8
        }
    }

    #[test]
    fn test_state_cell_swap_and_update() {
        let cell = StateCell::new(Light::Off);
        assert_eq!(cell.update(|s| (s == Light::Off).then_some(Light::On)), Light::Off);
        assert_eq!(cell.get(), Light::On);

        // Rejected step leaves the state alone
        assert_eq!(cell.update(|s| (s == Light::Off).then_some(Light::Broken)), Light::On);
        assert_eq!(cell.get(), Light::On);

        assert_eq!(cell.swap(Light::Broken), Light::On);
        assert_eq!(cell.swap(Light::Broken), Light::Broken);
    }

    #[test]
    fn test_leak_reported_once() {
        let seen = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&seen);
        let policy = Policy::defaults()
            .action(Action::callback(move |_| *counter.lock() += 1))
            .build();
        let core = GuardCore::new(Arc::new(policy), HandleKind::Blob, Location::caller());

        core.finalize(false, Check::BlobMissingFree, "Blob not freed").unwrap();
        core.finalize(false, Check::BlobMissingFree, "Blob not freed").unwrap();
        core.finalize_detached(false, Check::BlobMissingFree, "Blob not freed");
        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn test_released_handle_is_not_a_leak() {
        let policy = Policy::defaults().fail_method(FailMethod::RaiseError).build();
        let core = GuardCore::new(Arc::new(policy), HandleKind::Blob, Location::caller());

        assert!(core.finalize(true, Check::BlobMissingFree, "Blob not freed").is_ok());
        let violation = core.finalize(false, Check::BlobMissingFree, "Blob not freed").unwrap_err();
        assert_eq!(violation.message(), "Blob not freed");
    }

    #[test]
    fn test_disabled_leak_check_is_silent() {
        let policy = Policy::all_disabled().fail_method(FailMethod::RaiseError).build();
        let core = GuardCore::new(Arc::new(policy), HandleKind::Connection, Location::caller());

        assert!(core.finalize(false, Check::ConnectionMissingClose, "Connection not closed").is_ok());
        assert_eq!(core.kind(), HandleKind::Connection);
    }
}
