//! Generic Interception Engine
//!
//! [`Intercepted`] owns a driver handle and an [`Interceptor`]. Typed wrappers
//! (one per driver trait, see `guard`) route every method through one of
//! three entry points:
//!
//! - [`Intercepted::invoke`]: before hook, forward, after hook
//! - [`Intercepted::invoke_with`]: same, with the real result mapped to an
//!   [`Outcome`] for the after hook
//! - [`Intercepted::release`]: terminal operations (close, free), where the
//!   before hook may already have released the real handle
//!
//! # Failure Semantics
//! - A hook error (a raised violation) is returned before the forward runs
//! - A real handle failure is returned unchanged and the after hook is skipped
//!
//! # Locking
//! The handle sits behind a `parking_lot::Mutex` held for the whole call, hooks
//! included. A violation callback must not call back into the handle it is
//! reporting on.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::driver::Handle;
use crate::report::HandleKind;

/// An intercepted operation
pub trait Operation: fmt::Debug {
    /// Operation name used in trace events
    fn name(&self) -> &'static str;
}

/// What the forwarded call produced, as seen by the after hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The call returned normally
    Completed,
    /// A cursor advance; `true` when it landed on a row
    Row(bool),
    /// An optional result was not produced
    Absent,
}

/// Decision of a release hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Forward the terminal call to the real handle
    Forward,
    /// The hook already released the real handle
    Released,
}

/// Check logic invoked around every call on a handle
pub trait Interceptor<H: Handle> {
    type Op: Operation;

    fn kind(&self) -> HandleKind;

    fn before_call(&self, op: &Self::Op, handle: &mut H) -> Result<(), H::Error>;

    fn after_call(&self, _op: &Self::Op, _handle: &mut H, _outcome: Outcome) -> Result<(), H::Error> {
        Ok(())
    }

    fn before_release(&self, op: &Self::Op, handle: &mut H) -> Result<Dispatch, H::Error> {
        self.before_call(op, handle).map(|()| Dispatch::Forward)
    }
}

impl<H: Handle, G: Interceptor<H> + ?Sized> Interceptor<H> for Arc<G> {
    type Op = G::Op;

    fn kind(&self) -> HandleKind {
        (**self).kind()
    }

    fn before_call(&self, op: &Self::Op, handle: &mut H) -> Result<(), H::Error> {
        (**self).before_call(op, handle)
    }

    fn after_call(&self, op: &Self::Op, handle: &mut H, outcome: Outcome) -> Result<(), H::Error> {
        (**self).after_call(op, handle, outcome)
    }

    fn before_release(&self, op: &Self::Op, handle: &mut H) -> Result<Dispatch, H::Error> {
        (**self).before_release(op, handle)
    }
}

/// A handle whose every call passes through an interceptor
pub struct Intercepted<H, G> {
    handle: Mutex<H>,
    guard: G,
}

impl<H: Handle, G: Interceptor<H>> Intercepted<H, G> {
    pub fn new(handle: H, guard: G) -> Self {
        Self { handle: Mutex::new(handle), guard }
    }

    #[must_use]
    pub const fn guard(&self) -> &G {
        &self.guard
    }

    /// Intercept a call whose result the after hook does not need
    pub fn invoke<T>(
        &self,
        op: G::Op,
        call: impl FnOnce(&mut H) -> Result<T, H::Error>,
    ) -> Result<T, H::Error> {
        self.invoke_with(op, call, |_| Outcome::Completed)
    }

    /// Intercept a call, describing its result to the after hook
    pub fn invoke_with<T>(
        &self,
        op: G::Op,
        call: impl FnOnce(&mut H) -> Result<T, H::Error>,
        observe: impl FnOnce(&T) -> Outcome,
    ) -> Result<T, H::Error> {
        let mut handle = self.handle.lock();
        tracing::trace!(handle = %self.guard.kind(), op = op.name(), "intercepted call");

        self.guard.before_call(&op, &mut handle)?;
        let result = call(&mut handle)?;
        self.guard.after_call(&op, &mut handle, observe(&result))?;
        Ok(result)
    }

    /// Intercept a terminal call (close, free)
    pub fn release(
        &self,
        op: G::Op,
        call: impl FnOnce(&mut H) -> Result<(), H::Error>,
    ) -> Result<(), H::Error> {
        let mut handle = self.handle.lock();
        tracing::trace!(handle = %self.guard.kind(), op = op.name(), "intercepted release");

        if self.guard.before_release(&op, &mut handle)? == Dispatch::Forward {
            call(&mut handle)?;
        }
        self.guard.after_call(&op, &mut handle, Outcome::Completed)
    }
}

impl<H, G> fmt::Debug for Intercepted<H, G>
where
    H: Handle,
    G: Interceptor<H>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Intercepted").field("kind", &self.guard.kind()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LintError;
    use crate::policy::Check;
    use crate::report::{DiagnosticContext, Violation};
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct FakeHandle {
        calls: Vec<&'static str>,
        closed: bool,
    }

    impl Handle for FakeHandle {
        type Error = LintError;
    }

    #[derive(Debug, Clone, Copy)]
    enum FakeOp {
        Read,
        Fail,
        Close,
    }

    impl Operation for FakeOp {
        fn name(&self) -> &'static str {
            match self {
                Self::Read => "read",
                Self::Fail => "fail",
                Self::Close => "close",
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        reject: bool,
        release_early: bool,
    }

    impl Interceptor<FakeHandle> for Recorder {
        type Op = FakeOp;

        fn kind(&self) -> HandleKind {
            HandleKind::Statement
        }

        fn before_call(&self, op: &FakeOp, _handle: &mut FakeHandle) -> Result<(), LintError> {
            self.events.lock().push(format!("before {}", op.name()));
            if self.reject {
                return Err(Violation::new(
                    Check::StatementDoubleClose,
                    "rejected",
                    DiagnosticContext::capture(HandleKind::Statement),
                )
                .into());
            }
            Ok(())
        }

        fn after_call(&self, op: &FakeOp, _handle: &mut FakeHandle, outcome: Outcome) -> Result<(), LintError> {
            self.events.lock().push(format!("after {} {outcome:?}", op.name()));
            Ok(())
        }

        fn before_release(&self, op: &FakeOp, handle: &mut FakeHandle) -> Result<Dispatch, LintError> {
            self.before_call(op, handle)?;
            if self.release_early {
                handle.closed = true;
                return Ok(Dispatch::Released);
            }
            Ok(Dispatch::Forward)
        }
    }

    fn read(handle: &mut FakeHandle) -> Result<u32, LintError> {
        handle.calls.push("read");
        Ok(7)
    }

    fn close(handle: &mut FakeHandle) -> Result<(), LintError> {
        handle.calls.push("close");
        handle.closed = true;
        Ok(())
    }

    #[test]
    fn test_invoke_runs_hooks_around_forward() {
        let engine = Intercepted::new(FakeHandle::default(), Recorder::default());

        assert_eq!(engine.invoke(FakeOp::Read, read).unwrap(), 7);
        assert_eq!(
            *engine.guard().events.lock(),
            vec!["before read".to_string(), "after read Completed".to_string()]
        );
        assert_eq!(engine.handle.lock().calls, vec!["read"]);
    }

    #[test]
    fn test_invoke_with_observes_result() {
        let engine = Intercepted::new(FakeHandle::default(), Recorder::default());

        let value = engine.invoke_with(FakeOp::Read, read, |v| Outcome::Row(*v > 0)).unwrap();
        assert_eq!(value, 7);
        assert_eq!(engine.guard().events.lock()[1], "after read Row(true)");
    }

    #[test]
    fn test_rejection_skips_forward() {
        let guard = Recorder { reject: true, ..Recorder::default() };
        let engine = Intercepted::new(FakeHandle::default(), guard);

        let err = engine.invoke(FakeOp::Read, read).unwrap_err();
        assert_eq!(err.error_code(), "LINT_VIOLATION");
        assert!(engine.handle.lock().calls.is_empty());
    }

    #[test]
    fn test_handle_failure_propagates_unchanged() {
        let engine = Intercepted::new(FakeHandle::default(), Recorder::default());

        let err = engine
            .invoke(FakeOp::Fail, |_: &mut FakeHandle| -> Result<(), LintError> {
                Err(LintError::driver("fake", "boom"))
            })
            .unwrap_err();
        assert_eq!(err.message(), "Driver error (fake): boom");
        assert_eq!(*engine.guard().events.lock(), vec!["before fail".to_string()]);
    }

    #[test]
    fn test_release_forwards() {
        let engine = Intercepted::new(FakeHandle::default(), Recorder::default());

        engine.release(FakeOp::Close, close).unwrap();
        assert_eq!(engine.handle.lock().calls, vec!["close"]);
        assert_eq!(engine.guard().events.lock().last().unwrap(), "after close Completed");
    }

    #[test]
    fn test_release_skips_forward_when_already_released() {
        let guard = Recorder { release_early: true, ..Recorder::default() };
        let engine = Intercepted::new(FakeHandle::default(), guard);

        engine.release(FakeOp::Close, close).unwrap();
        let handle = engine.handle.lock();
        assert!(handle.closed);
        assert!(handle.calls.is_empty());
    }

    #[test]
    fn test_shared_interceptor() {
        let guard = Arc::new(Recorder::default());
        let engine = Intercepted::new(FakeHandle::default(), Arc::clone(&guard));

        engine.invoke(FakeOp::Read, read).unwrap();
        assert_eq!(guard.events.lock().len(), 2);
        assert_eq!(Interceptor::<FakeHandle>::kind(engine.guard()), HandleKind::Statement);
    }
}
