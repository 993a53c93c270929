//! Process-wide fault interception.
//!
//! A [`FaultInterceptor`] hooks the operating system's access-violation
//! delivery path. Backends share one contract: classify the fault, hand a
//! [`FaultInfo`] to the process-wide tracker, and turn the returned
//! [`FaultDisposition`] into the platform's resume/propagate protocol.
//!
//! Backends:
//! - `unix` - `sigaction` on SIGSEGV (and SIGBUS on Apple targets)
//! - `windows` - vectored exception handler
//! - `mock` - in-process backend for tests and hosted builds without `os-backend`

pub mod mock;

#[cfg(all(unix, feature = "os-backend"))]
pub mod unix;

#[cfg(all(windows, feature = "os-backend"))]
pub mod windows;

use crate::resolver::AccessKind;

/// A memory-protection fault as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    /// Faulting virtual address.
    pub address: usize,
    /// Whether the trapped instruction was reading or writing.
    pub access: AccessKind,
}

impl FaultInfo {
    pub const fn new(address: usize, access: AccessKind) -> Self {
        Self { address, access }
    }
}

/// What the platform handler should do after dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// The access was made legal; retry the faulting instruction.
    Resume,
    /// Not ours or not fixable; let the platform's default behavior run.
    Decline,
}

impl FaultDisposition {
    pub fn is_resume(self) -> bool {
        matches!(self, Self::Resume)
    }
}

/// Installs and removes the process-wide fault hook.
///
/// Installation is driven by [`FaultTracker`](crate::FaultTracker), which
/// guarantees `install` is not called again while a hook is active.
pub trait FaultInterceptor: Sync {
    /// Hook into fault delivery.
    ///
    /// Returns an opaque token needed to uninstall, or the OS error code.
    fn install(&self) -> Result<usize, i32>;

    /// Remove a hook previously returned by [`install`](Self::install).
    fn uninstall(&self, token: usize);

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

// =============================================================================
// Platform Type Alias
// =============================================================================

/// The backend used by the process-wide tracker.
///
/// With `os-backend` on Unix: [`unix::SignalInterceptor`]
/// With `os-backend` on Windows: [`windows::VectoredInterceptor`]
/// Otherwise: [`mock::MockInterceptor`]
#[cfg(all(unix, feature = "os-backend"))]
pub type PlatformInterceptor = unix::SignalInterceptor;

#[cfg(all(windows, feature = "os-backend"))]
pub type PlatformInterceptor = windows::VectoredInterceptor;

#[cfg(not(all(any(unix, windows), feature = "os-backend")))]
pub type PlatformInterceptor = mock::MockInterceptor;
