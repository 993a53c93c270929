//! POSIX signal backend.
//!
//! Memory-protection faults arrive as SIGSEGV (SIGBUS on Apple targets for
//! protected anonymous mappings). The handler extracts the faulting address
//! from `si_addr` and the access kind from the saved machine context, then
//! dispatches to the process-wide tracker.
//!
//! Declined faults are forwarded to whatever action was installed before us.
//! If that was the default action (or "ignore", which cannot apply to a
//! synchronous fault), the default is restored and the handler returns: the
//! faulting instruction re-executes and the process dies the normal way.

use core::cell::UnsafeCell;
use core::ffi::{c_int, c_void};
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

use libc::siginfo_t;

use super::{FaultDisposition, FaultInfo, FaultInterceptor};
use crate::resolver::AccessKind;

#[cfg(target_vendor = "apple")]
const SIGNAL_COUNT: usize = 2;
#[cfg(target_vendor = "apple")]
const FAULT_SIGNALS: [c_int; SIGNAL_COUNT] = [libc::SIGSEGV, libc::SIGBUS];

#[cfg(not(target_vendor = "apple"))]
const SIGNAL_COUNT: usize = 1;
#[cfg(not(target_vendor = "apple"))]
const FAULT_SIGNALS: [c_int; SIGNAL_COUNT] = [libc::SIGSEGV];

/// Actions that were installed before ours, indexed like `FAULT_SIGNALS`.
struct SavedActions(UnsafeCell<[MaybeUninit<libc::sigaction>; SIGNAL_COUNT]>);

// SAFETY: written only by `install`/`uninstall` (serialized by the tracker's
// admin lock) and read by the handler after `SAVED` is observed set.
unsafe impl Sync for SavedActions {}

static PREVIOUS: SavedActions =
    SavedActions(UnsafeCell::new([const { MaybeUninit::uninit() }; SIGNAL_COUNT]));
static SAVED: AtomicBool = AtomicBool::new(false);

/// Interceptor built on `sigaction`.
///
/// POSIX has no per-hook handle, so the install token is always 0.
#[derive(Debug)]
pub struct SignalInterceptor {
    _private: (),
}

impl SignalInterceptor {
    pub(crate) const fn new() -> Self {
        Self { _private: () }
    }
}

impl FaultInterceptor for SignalInterceptor {
    fn install(&self) -> Result<usize, i32> {
        let mut action: libc::sigaction = unsafe { core::mem::zeroed() };
        action.sa_sigaction = on_fault as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER;
        unsafe { libc::sigemptyset(&mut action.sa_mask) };

        let previous = PREVIOUS.0.get().cast::<libc::sigaction>();

        for (index, &signum) in FAULT_SIGNALS.iter().enumerate() {
            // SAFETY: `previous` points at SIGNAL_COUNT slots.
            let rc = unsafe { libc::sigaction(signum, &action, previous.add(index)) };
            if rc != 0 {
                let code = last_errno();
                // Put back the signals already taken over.
                for (undo, &undo_signum) in FAULT_SIGNALS.iter().enumerate().take(index) {
                    unsafe { libc::sigaction(undo_signum, previous.add(undo), core::ptr::null_mut()) };
                }
                log::warn!("signal interceptor: sigaction({}) failed, errno {}", signum, code);
                return Err(code);
            }
        }

        SAVED.store(true, Ordering::Release);
        Ok(0)
    }

    fn uninstall(&self, _token: usize) {
        if !SAVED.swap(false, Ordering::AcqRel) {
            return;
        }

        let previous = PREVIOUS.0.get().cast::<libc::sigaction>();
        for (index, &signum) in FAULT_SIGNALS.iter().enumerate() {
            // SAFETY: the slot was filled by a successful `install`.
            unsafe { libc::sigaction(signum, previous.add(index), core::ptr::null_mut()) };
        }
    }

    fn name(&self) -> &'static str {
        "posix-signal"
    }
}

unsafe extern "C" fn on_fault(signum: c_int, info: *mut siginfo_t, context: *mut c_void) {
    // Resolvers may call mprotect and friends; keep the interrupted code's errno.
    let saved_errno = last_errno();

    // SAFETY: the kernel passes valid siginfo and ucontext pointers to
    // SA_SIGINFO handlers.
    let code = unsafe { (*info).si_code };

    let disposition = if is_protection_fault(signum, code) {
        let address = unsafe { (*info).si_addr() } as usize;
        let access = unsafe { access_kind(context) };
        crate::tracker().handle_fault(FaultInfo::new(address, access))
    } else {
        FaultDisposition::Decline
    };

    if disposition == FaultDisposition::Decline {
        unsafe { forward(signum, info, context) };
    }

    set_errno(saved_errno);
}

/// Whether a delivered signal is a kernel-reported access to a mapped page
/// whose protection forbids it.
///
/// Signals sent by a process (`kill`, `raise`, `sigqueue`) carry a
/// non-positive `si_code` and no fault address. Faults on unmapped addresses
/// (`SEGV_MAPERR`) are not protection faults.
fn is_protection_fault(signum: c_int, code: c_int) -> bool {
    if code <= 0 {
        return false;
    }
    match signum {
        libc::SIGSEGV => code == SEGV_ACCERR,
        // Apple reports protected anonymous mappings as SIGBUS; any
        // kernel-generated code qualifies.
        #[cfg(target_vendor = "apple")]
        libc::SIGBUS => true,
        _ => false,
    }
}

/// `si_code` of a SIGSEGV raised by a permission check on a mapped page.
const SEGV_ACCERR: c_int = 2;

/// Hand a declined fault to the previous action.
unsafe fn forward(signum: c_int, info: *mut siginfo_t, context: *mut c_void) {
    let Some(index) = FAULT_SIGNALS.iter().position(|&s| s == signum) else {
        return;
    };

    if !SAVED.load(Ordering::Acquire) {
        unsafe { reset_to_default(signum) };
        return;
    }

    // SAFETY: SAVED guarantees the slot was written by `install`.
    let previous = unsafe { (*PREVIOUS.0.get())[index].assume_init_ref() };
    let handler = previous.sa_sigaction;

    if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
        unsafe { reset_to_default(signum) };
    } else if previous.sa_flags & libc::SA_SIGINFO != 0 {
        // SAFETY: SA_SIGINFO handlers have this signature.
        let handler: unsafe extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
            unsafe { core::mem::transmute(handler) };
        unsafe { handler(signum, info, context) };
    } else {
        let handler: unsafe extern "C" fn(c_int) = unsafe { core::mem::transmute(handler) };
        unsafe { handler(signum) };
    }
}

unsafe fn reset_to_default(signum: c_int) {
    let mut action: libc::sigaction = unsafe { core::mem::zeroed() };
    action.sa_sigaction = libc::SIG_DFL;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signum, &action, core::ptr::null_mut());
    }
}

// =============================================================================
// Access Kind Decoding
// =============================================================================

/// AArch64 data abort syndrome: Write-not-Read.
#[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_vendor = "apple")))]
const ESR_WNR: u64 = 1 << 6;
/// AArch64 data abort syndrome: cache maintenance, reported with WnR set but
/// not a store.
#[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_vendor = "apple")))]
const ESR_CM: u64 = 1 << 8;

#[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_vendor = "apple")))]
fn esr_is_write(esr: u64) -> bool {
    esr & ESR_WNR != 0 && esr & ESR_CM == 0
}

/// x86-64 page-fault error code: bit 1 set for writes.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn access_kind(context: *mut c_void) -> AccessKind {
    const PF_WRITE: i64 = 1 << 1;

    let uc = unsafe { &*(context as *const libc::ucontext_t) };
    let err = uc.uc_mcontext.gregs[libc::REG_ERR as usize];
    AccessKind::from_write_flag(err & PF_WRITE != 0)
}

/// AArch64 Linux stores the fault syndrome as an `esr_context` record in the
/// `__reserved` area that follows `pstate` in the machine context.
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn access_kind(context: *mut c_void) -> AccessKind {
    const ESR_MAGIC: u32 = 0x4553_5201;
    const RESERVED_SIZE: usize = 4096;
    #[repr(C)]
    struct CtxHeader {
        magic: u32,
        size: u32,
    }

    let uc = unsafe { &*(context as *const libc::ucontext_t) };
    let pstate_end = core::ptr::addr_of!(uc.uc_mcontext.pstate) as usize + 8;
    let reserved = (pstate_end + 15) & !15;
    let end = reserved + RESERVED_SIZE;

    let mut cursor = reserved;
    while cursor + core::mem::size_of::<CtxHeader>() <= end {
        let head = unsafe { &*(cursor as *const CtxHeader) };
        if head.magic == 0 || head.size == 0 {
            break;
        }
        if head.magic == ESR_MAGIC {
            let esr = unsafe { *((cursor + 8) as *const u64) };
            return AccessKind::from_write_flag(esr_is_write(esr));
        }
        cursor += head.size as usize;
    }

    AccessKind::Read
}

#[cfg(all(target_vendor = "apple", target_arch = "x86_64"))]
unsafe fn access_kind(context: *mut c_void) -> AccessKind {
    let uc = unsafe { &*(context as *const libc::ucontext_t) };
    let err = unsafe { (*uc.uc_mcontext).__es.__err };
    AccessKind::from_write_flag(err & 0x2 != 0)
}

#[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
unsafe fn access_kind(context: *mut c_void) -> AccessKind {
    let uc = unsafe { &*(context as *const libc::ucontext_t) };
    let esr = unsafe { (*uc.uc_mcontext).__es.__esr } as u64;
    AccessKind::from_write_flag(esr_is_write(esr))
}

/// No decoder for this target; every fault is reported as a read.
#[cfg(not(any(
    all(target_os = "linux", target_arch = "x86_64"),
    all(target_os = "linux", target_arch = "aarch64"),
    all(target_vendor = "apple", any(target_arch = "x86_64", target_arch = "aarch64")),
)))]
unsafe fn access_kind(_context: *mut c_void) -> AccessKind {
    AccessKind::Read
}

// =============================================================================
// errno
// =============================================================================

#[cfg(target_os = "linux")]
fn errno_location() -> *mut c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(target_os = "android")]
fn errno_location() -> *mut c_int {
    unsafe { libc::__errno() }
}

#[cfg(any(target_vendor = "apple", target_os = "freebsd"))]
fn errno_location() -> *mut c_int {
    unsafe { libc::__error() }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "freebsd"
)))]
fn errno_location() -> *mut c_int {
    core::ptr::null_mut()
}

pub(crate) fn last_errno() -> i32 {
    let location = errno_location();
    if location.is_null() { -1 } else { unsafe { *location } }
}

fn set_errno(value: i32) {
    let location = errno_location();
    if !location.is_null() {
        unsafe { *location = value };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sent_signals_are_not_faults() {
        // SI_USER (kill) and SI_TKILL (raise on Linux).
        assert!(!is_protection_fault(libc::SIGSEGV, 0));
        assert!(!is_protection_fault(libc::SIGSEGV, -6));
    }

    #[test]
    fn test_only_access_errors_are_faults() {
        assert!(is_protection_fault(libc::SIGSEGV, SEGV_ACCERR));
        // SEGV_MAPERR
        assert!(!is_protection_fault(libc::SIGSEGV, 1));
        assert!(!is_protection_fault(libc::SIGILL, SEGV_ACCERR));
    }

    #[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_vendor = "apple")))]
    #[test]
    fn test_cache_maintenance_is_not_a_write() {
        assert!(esr_is_write(ESR_WNR));
        assert!(!esr_is_write(ESR_WNR | ESR_CM));
        assert!(!esr_is_write(0));
    }
}
