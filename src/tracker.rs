//! Region tracking and fault dispatch.
//!
//! [`FaultTracker`] ties the region table to a [`FaultInterceptor`]:
//! registering the first region installs the process-wide hook, and every
//! delivered fault is matched against the table and handed to the owning
//! region's resolver.
//!
//! Hook lifecycle:
//! - Uninstalled until the first successful registration.
//! - Installed exactly once; it stays installed when the last region goes
//!   away.
//! - [`FaultTracker::uninstall`] removes it explicitly once no region is
//!   live. The next registration installs it again.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use axerrno::AxResult;
use spin::Mutex;

use crate::interceptor::{FaultDisposition, FaultInfo, FaultInterceptor};
use crate::region::{RegionHandle, RegionRegistry, TrackedRegion};
use crate::resolver::FaultResolver;
use crate::stats::{FaultStats, FaultStatsSnapshot};

/// Error types for tracking operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Every region slot is in use.
    TableFull,
    /// The platform refused to install the fault hook (OS error code).
    InstallFailed(i32),
    /// Empty range, or one that wraps past the end of the address space.
    InvalidRange { base: usize, size: usize },
    /// The handle does not refer to a live region (slot index).
    NotTracked(usize),
    /// The hook cannot be removed while regions are live.
    RegionsLive(usize),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TableFull => write!(f, "Tracked region table is full"),
            Self::InstallFailed(code) => write!(f, "Failed to install fault hook: os error {}", code),
            Self::InvalidRange { base, size } => {
                write!(f, "Invalid region: base={:#x} size={:#x}", base, size)
            }
            Self::NotTracked(slot) => write!(f, "Region slot {} is not tracked", slot),
            Self::RegionsLive(count) => {
                write!(f, "Fault hook still serves {} tracked regions", count)
            }
        }
    }
}

impl core::error::Error for Error {}

impl Error {
    /// Convert into an ArceOS error result.
    pub fn into_ax_result<T>(self) -> AxResult<T> {
        match self {
            Self::TableFull => axerrno::ax_err!(NoMemory, "tracked region table is full"),
            Self::InstallFailed(_) => axerrno::ax_err!(Unsupported, "fault hook installation failed"),
            Self::InvalidRange { .. } => axerrno::ax_err!(InvalidInput, "invalid tracked region"),
            Self::NotTracked(_) => axerrno::ax_err!(NotFound, "region is not tracked"),
            Self::RegionsLive(_) => axerrno::ax_err!(ResourceBusy, "tracked regions still live"),
        }
    }
}

/// Singleton hook state. Mutated only under the tracker's admin lock.
struct HookState {
    installed: AtomicBool,
    token: AtomicUsize,
}

/// Region table plus the process-wide hook that feeds it.
pub struct FaultTracker<I: FaultInterceptor> {
    registry: RegionRegistry,
    hook: HookState,
    /// Serializes registration, removal and hook changes.
    /// Never taken on the fault path.
    admin: Mutex<()>,
    stats: FaultStats,
    interceptor: I,
}

impl<I: FaultInterceptor> FaultTracker<I> {
    /// Create a tracker driving `interceptor`.
    pub const fn with_interceptor(interceptor: I) -> Self {
        Self {
            registry: RegionRegistry::new(),
            hook: HookState {
                installed: AtomicBool::new(false),
                token: AtomicUsize::new(0),
            },
            admin: Mutex::new(()),
            stats: FaultStats::new(),
            interceptor,
        }
    }

    /// Start intercepting faults in `[base, base + size)`.
    ///
    /// Installs the fault hook on first use. Fails with
    /// [`Error::TableFull`] when all [`MAX_TRACKED_REGIONS`](crate::MAX_TRACKED_REGIONS)
    /// slots are taken (nothing else is touched), or with
    /// [`Error::InstallFailed`] when the platform refuses the hook, in which
    /// case the slot is released again and no region becomes visible.
    pub fn start_tracking(
        &self,
        base: usize,
        size: usize,
        resolver: &'static dyn FaultResolver,
    ) -> Result<RegionHandle, Error> {
        if size == 0 || base.checked_add(size).is_none() {
            return Err(Error::InvalidRange { base, size });
        }

        let _guard = self.admin.lock();

        let Some(handle) = self.registry.allocate() else {
            log::warn!(
                "fault tracker: no free slot for {:#x}+{:#x}",
                base,
                size
            );
            return Err(Error::TableFull);
        };

        let token = match self.ensure_installed() {
            Ok(token) => token,
            Err(code) => {
                self.registry.free(handle);
                return Err(Error::InstallFailed(code));
            }
        };

        let published = self.registry.describe(handle, base, size, token, resolver);
        debug_assert!(published, "slot {} lost its reservation", handle.index());
        log::debug!(
            "fault tracker: tracking {:#x}-{:#x} in slot {}",
            base,
            base + size,
            handle.index()
        );

        Ok(handle)
    }

    /// Stop intercepting faults for `handle`'s region.
    ///
    /// The caller must make sure no other thread can still fault inside the
    /// range while this runs. The hook stays installed.
    pub fn stop_tracking(&self, handle: RegionHandle) -> Result<(), Error> {
        let _guard = self.admin.lock();

        let region = self.registry.get(handle).ok_or(Error::NotTracked(handle.index()))?;
        self.registry.free(handle);

        log::debug!(
            "fault tracker: stopped tracking {:#x}-{:#x} (slot {})",
            region.base,
            region.base + region.size,
            handle.index()
        );
        Ok(())
    }

    /// Remove the fault hook.
    ///
    /// Idempotent. Refused with [`Error::RegionsLive`] while any region is
    /// still tracked.
    pub fn uninstall(&self) -> Result<(), Error> {
        let _guard = self.admin.lock();

        let live = self.registry.live_count();
        if live > 0 {
            return Err(Error::RegionsLive(live));
        }

        if self.hook.installed.load(Ordering::Acquire) {
            let token = self.hook.token.load(Ordering::Relaxed);
            self.interceptor.uninstall(token);
            self.hook.installed.store(false, Ordering::Release);
            log::info!("fault tracker: {} hook removed", self.interceptor.name());
        }

        Ok(())
    }

    /// Dispatch one fault.
    ///
    /// Runs inside the platform fault handler: lock-free, allocation-free,
    /// and nothing here logs. The first live region (lowest slot) containing
    /// the address decides; if its resolver declines, no other region is
    /// consulted.
    pub fn handle_fault(&self, fault: FaultInfo) -> FaultDisposition {
        self.stats.record_fault();

        let Some(region) = self.registry.lookup(fault.address) else {
            self.stats.record_unmatched();
            return FaultDisposition::Decline;
        };

        let offset = fault.address - region.base;
        if region.resolver.resolve(offset, fault.access) {
            self.stats.record_resolved();
            FaultDisposition::Resume
        } else {
            self.stats.record_declined();
            FaultDisposition::Decline
        }
    }

    /// Whether the fault hook is currently installed.
    pub fn is_installed(&self) -> bool {
        self.hook.installed.load(Ordering::Acquire)
    }

    /// The region behind `handle`, if still tracked.
    pub fn region(&self, handle: RegionHandle) -> Option<TrackedRegion> {
        self.registry.get(handle)
    }

    /// Number of live regions.
    pub fn tracked_count(&self) -> usize {
        self.registry.live_count()
    }

    /// Dispatch counters since creation or the last [`reset_stats`](Self::reset_stats).
    pub fn stats(&self) -> FaultStatsSnapshot {
        self.stats.snapshot()
    }

    /// Zero the dispatch counters.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// The backend driving this tracker.
    pub fn interceptor(&self) -> &I {
        &self.interceptor
    }

    /// Install the hook unless it already is. Caller holds `admin`.
    fn ensure_installed(&self) -> Result<usize, i32> {
        if self.hook.installed.load(Ordering::Acquire) {
            return Ok(self.hook.token.load(Ordering::Relaxed));
        }

        match self.interceptor.install() {
            Ok(token) => {
                self.hook.token.store(token, Ordering::Relaxed);
                self.hook.installed.store(true, Ordering::Release);
                log::info!(
                    "fault tracker: {} hook installed (token {:#x})",
                    self.interceptor.name(),
                    token
                );
                Ok(token)
            }
            Err(code) => {
                log::warn!(
                    "fault tracker: {} hook installation failed: {}",
                    self.interceptor.name(),
                    code
                );
                Err(code)
            }
        }
    }
}
