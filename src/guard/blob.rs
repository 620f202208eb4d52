//! Large object guard

use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::GuardCore;
use crate::driver::Blob;
use crate::intercept::{Dispatch, Intercepted, Interceptor, Operation};
use crate::policy::{Check, Policy};
use crate::report::{DiagnosticContext, HandleKind};

#[derive(Debug, Clone, Copy)]
pub(crate) enum BlobOp {
    Length,
    Bytes,
    Free,
}

impl Operation for BlobOp {
    fn name(&self) -> &'static str {
        match self {
            Self::Length => "length",
            Self::Bytes => "bytes",
            Self::Free => "free",
        }
    }
}

pub(crate) struct BlobGuard {
    core: GuardCore,
    freed: AtomicBool,
}

impl BlobGuard {
    fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }
}

impl<B: Blob> Interceptor<B> for BlobGuard {
    type Op = BlobOp;

    fn kind(&self) -> HandleKind {
        HandleKind::Blob
    }

    fn before_call(&self, _op: &BlobOp, _blob: &mut B) -> Result<(), B::Error> {
        Ok(())
    }

    fn before_release(&self, _op: &BlobOp, _blob: &mut B) -> Result<Dispatch, B::Error> {
        if self.freed.swap(true, Ordering::AcqRel) && self.core.enabled(Check::BlobDoubleFree) {
            self.core.report(Check::BlobDoubleFree, "Blob already freed")?;
        }
        Ok(Dispatch::Forward)
    }
}

/// A large object whose usage is checked against a [`Policy`]
pub struct GuardedBlob<B: Blob> {
    engine: Intercepted<B, BlobGuard>,
}

impl<B: Blob> GuardedBlob<B> {
    pub(crate) fn at(blob: B, policy: Arc<Policy>, location: &'static Location<'static>) -> Self {
        let guard = BlobGuard {
            core: GuardCore::new(policy, HandleKind::Blob, location),
            freed: AtomicBool::new(false),
        };
        Self { engine: Intercepted::new(blob, guard) }
    }

    #[must_use]
    pub fn context(&self) -> &DiagnosticContext {
        self.engine.guard().core.context()
    }

    pub fn length(&self) -> Result<u64, B::Error> {
        self.engine.invoke(BlobOp::Length, B::length)
    }

    /// `length` bytes starting at 1-based `position`
    pub fn bytes(&self, position: u64, length: usize) -> Result<Vec<u8>, B::Error> {
        self.engine.invoke(BlobOp::Bytes, |b| b.bytes(position, length))
    }

    pub fn free(&self) -> Result<(), B::Error> {
        self.engine.release(BlobOp::Free, B::free)
    }

    /// Report "Blob not freed" if `free` was never called
    pub fn finalize(&self) -> Result<(), B::Error> {
        let guard = self.engine.guard();
        guard.core.finalize(guard.is_freed(), Check::BlobMissingFree, "Blob not freed")?;
        Ok(())
    }
}

impl<B: Blob> Drop for GuardedBlob<B> {
    fn drop(&mut self) {
        let guard = self.engine.guard();
        guard.core.finalize_detached(guard.is_freed(), Check::BlobMissingFree, "Blob not freed");
    }
}
