//! Fault resolvers.
//!
//! A resolver decides whether a fault inside its region was expected and
//! has been remedied. It runs on the faulting thread from inside the
//! platform fault handler, so implementations must not block, allocate or
//! take locks the interrupted thread may already hold.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Kind of memory access that raised the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Load (or an access the platform could not classify).
    Read,
    /// Store.
    Write,
}

impl AccessKind {
    /// Build from a raw "was this a write" flag.
    #[inline]
    pub const fn from_write_flag(is_write: bool) -> Self {
        if is_write { Self::Write } else { Self::Read }
    }

    /// Whether the access was a write.
    #[inline]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }

    /// Short label for display.
    pub fn label(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

/// Decides the outcome of a fault inside a tracked region.
pub trait FaultResolver: Sync {
    /// Called with the fault's offset from the region base.
    ///
    /// Returns true once the access has been made legal (for example by
    /// changing page permissions) so the faulting instruction can be
    /// retried. Returning false lets the fault propagate.
    fn resolve(&self, offset: usize, access: AccessKind) -> bool;
}

impl<F> FaultResolver for F
where
    F: Fn(usize, AccessKind) -> bool + Sync,
{
    #[inline]
    fn resolve(&self, offset: usize, access: AccessKind) -> bool {
        self(offset, access)
    }
}

/// Resolver that declines every fault.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decline;

impl FaultResolver for Decline {
    fn resolve(&self, _offset: usize, _access: AccessKind) -> bool {
        false
    }
}

/// Wraps another resolver and records what it was asked to do.
///
/// Only atomic stores happen on the fault path, which makes this the
/// signal-safe way to observe faults; read the counters back with
/// [`CountingResolver::snapshot`] once execution has resumed.
#[derive(Debug)]
pub struct CountingResolver<R> {
    inner: R,
    hits: AtomicUsize,
    resolved: AtomicUsize,
    last_offset: AtomicUsize,
    last_write: AtomicBool,
}

/// Point-in-time view of a [`CountingResolver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverSnapshot {
    /// Number of times the resolver was invoked.
    pub hits: usize,
    /// Number of invocations the inner resolver resolved.
    pub resolved: usize,
    /// Offset of the most recent fault.
    pub last_offset: usize,
    /// Access kind of the most recent fault.
    pub last_access: AccessKind,
}

impl<R> CountingResolver<R> {
    pub const fn new(inner: R) -> Self {
        Self {
            inner,
            hits: AtomicUsize::new(0),
            resolved: AtomicUsize::new(0),
            last_offset: AtomicUsize::new(0),
            last_write: AtomicBool::new(false),
        }
    }

    /// The wrapped resolver.
    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ResolverSnapshot {
        ResolverSnapshot {
            hits: self.hits.load(Ordering::Acquire),
            resolved: self.resolved.load(Ordering::Relaxed),
            last_offset: self.last_offset.load(Ordering::Relaxed),
            last_access: AccessKind::from_write_flag(self.last_write.load(Ordering::Relaxed)),
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.resolved.store(0, Ordering::Relaxed);
        self.last_offset.store(0, Ordering::Relaxed);
        self.last_write.store(false, Ordering::Relaxed);
    }
}

impl<R: FaultResolver> FaultResolver for CountingResolver<R> {
    fn resolve(&self, offset: usize, access: AccessKind) -> bool {
        self.last_offset.store(offset, Ordering::Relaxed);
        self.last_write.store(access.is_write(), Ordering::Relaxed);
        // Release pairs with the Acquire in `hits()`/`snapshot()`.
        self.hits.fetch_add(1, Ordering::Release);

        let handled = self.inner.resolve(offset, access);
        if handled {
            self.resolved.fetch_add(1, Ordering::Relaxed);
        }
        handled
    }
}
