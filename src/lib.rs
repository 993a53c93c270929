//! Access-violation interception for tracked memory regions.
//!
//! A memory-management layer registers ranges of the process's address
//! space together with a resolver. When a memory-protection fault hits a
//! registered range, the resolver is called on the faulting thread with the
//! offset into the range and the access kind; it can fix the cause (usually
//! by changing page permissions) and let execution resume, or decline and
//! let the fault crash the process as it normally would.
//!
//! # Features
//!
//! - `os-backend` - Real platform hook: POSIX signals on Unix, vectored
//!   exception handling on Windows, plus the [`protect`] helpers (default).
//!   Without it the process-wide tracker runs on the mock backend.
//!
//! # Quick Start
//!
//! ```ignore
//! use axfault::protect::{PagePermission, ReprotectResolver};
//!
//! // `base` points at `len` bytes mapped with no access.
//! let resolver: &'static ReprotectResolver =
//!     Box::leak(Box::new(ReprotectResolver::new(base, PagePermission::ReadWrite)));
//!
//! let handle = axfault::start_tracking(base, len, resolver)?;
//!
//! // First write to each page traps, the page becomes writable, the write retries.
//! unsafe { (base as *mut u8).write_volatile(1) };
//!
//! axfault::stop_tracking(handle)?;
//! ```

#![no_std]

#[macro_use]
extern crate log;

// =============================================================================
// Core Modules
// =============================================================================

pub mod interceptor;
pub mod region;
pub mod resolver;
pub mod stats;
pub mod tracker;

// =============================================================================
// Page Protection
// =============================================================================

#[cfg(all(any(unix, windows), feature = "os-backend"))]
pub mod protect;

// Re-export key types for convenience
pub use interceptor::{FaultDisposition, FaultInfo, FaultInterceptor, PlatformInterceptor};
pub use region::{MAX_TRACKED_REGIONS, RegionHandle, RegionRegistry, TrackedRegion};
pub use resolver::{AccessKind, CountingResolver, Decline, FaultResolver, ResolverSnapshot};
pub use stats::{FaultStats, FaultStatsSnapshot};
pub use tracker::{Error, FaultTracker};

// =============================================================================
// Process-wide Tracker
// =============================================================================

static TRACKER: FaultTracker<PlatformInterceptor> =
    FaultTracker::with_interceptor(PlatformInterceptor::new());

/// The tracker fed by the process-wide fault hook.
#[inline]
pub fn tracker() -> &'static FaultTracker<PlatformInterceptor> {
    &TRACKER
}

/// Start intercepting access violations in `[base, base + size)`.
///
/// The first successful call installs the process-wide hook. Fails when all
/// [`MAX_TRACKED_REGIONS`] slots are taken or the hook cannot be installed.
pub fn start_tracking(
    base: usize,
    size: usize,
    resolver: &'static dyn FaultResolver,
) -> Result<RegionHandle, Error> {
    TRACKER.start_tracking(base, size, resolver)
}

/// Stop intercepting faults for a region.
///
/// No other thread may still be faulting inside the region.
pub fn stop_tracking(handle: RegionHandle) -> Result<(), Error> {
    TRACKER.stop_tracking(handle)
}

/// Remove the process-wide hook once no region is tracked.
pub fn uninstall() -> Result<(), Error> {
    let result = TRACKER.uninstall();
    if let Err(e) = &result {
        debug!("uninstall refused: {}", e);
    }
    result
}

/// Dispatch counters of the process-wide tracker.
pub fn stats() -> FaultStatsSnapshot {
    TRACKER.stats()
}
