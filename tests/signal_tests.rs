//! Integration tests with real memory-protection faults.
//!
//! Pages are mapped with no access, registered with the process-wide
//! tracker, and then touched. Outcomes that end the process (declined or
//! unmatched faults, sent signals) run in a child copy of this test binary, selected with
//! the `AXFAULT_CRASH_CASE` environment variable.

#![cfg(all(unix, feature = "os-backend"))]

use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Stdio};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use axfault::protect::{self, PagePermission, ReprotectResolver};
use axfault::{AccessKind, CountingResolver, Decline};

/// Anonymous mapping released on drop.
struct Mapping {
    base: usize,
    len: usize,
}

impl Mapping {
    /// Map `pages` pages with no access.
    fn protected(pages: usize) -> Self {
        let len = pages * protect::page_size();
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED, "mmap failed");
        Self { base: ptr as usize, len }
    }

    fn page(&self, index: usize) -> usize {
        self.base + index * protect::page_size()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
    }
}

fn reprotecting(base: usize) -> &'static CountingResolver<ReprotectResolver> {
    Box::leak(Box::new(CountingResolver::new(ReprotectResolver::new(
        base,
        PagePermission::ReadWrite,
    ))))
}

fn write_byte(addr: usize, value: u8) {
    unsafe { ptr::write_volatile(addr as *mut u8, value) };
}

fn read_byte(addr: usize) -> u8 {
    unsafe { ptr::read_volatile(addr as *const u8) }
}

// =============================================================================
// Resolved Faults
// =============================================================================

#[test]
fn test_write_fault_is_resolved_and_retried() {
    let map = Mapping::protected(4);
    let resolver = reprotecting(map.base);
    let handle = axfault::start_tracking(map.base, 2 * protect::page_size(), resolver).unwrap();

    let addr = map.base + protect::page_size() / 2;
    write_byte(addr, 0x5a);

    let snap = resolver.snapshot();
    assert_eq!(snap.hits, 1);
    assert_eq!(snap.resolved, 1);
    assert_eq!(snap.last_offset, protect::page_size() / 2);
    assert_eq!(snap.last_access, AccessKind::Write);
    assert_eq!(read_byte(addr), 0x5a);

    // Page is now writable: no second fault.
    write_byte(addr + 1, 0x5b);
    assert_eq!(resolver.hits(), 1);

    axfault::stop_tracking(handle).unwrap();
}

#[test]
fn test_read_fault_reports_read_access() {
    let map = Mapping::protected(1);
    let resolver = reprotecting(map.base);
    let handle = axfault::start_tracking(map.base, map.len, resolver).unwrap();

    assert_eq!(read_byte(map.base + 0x10), 0);

    let snap = resolver.snapshot();
    assert_eq!(snap.hits, 1);
    assert_eq!(snap.last_offset, 0x10);
    assert_eq!(snap.last_access, AccessKind::Read);

    axfault::stop_tracking(handle).unwrap();
}

#[test]
fn test_fault_on_other_thread() {
    let map = Mapping::protected(2);
    let resolver = reprotecting(map.base);
    let handle = axfault::start_tracking(map.base, map.len, resolver).unwrap();
    let target = map.page(1) + 8;

    thread::spawn(move || write_byte(target, 7)).join().unwrap();

    assert_eq!(resolver.hits(), 1);
    assert_eq!(resolver.snapshot().last_offset, protect::page_size() + 8);
    assert_eq!(read_byte(target), 7);

    axfault::stop_tracking(handle).unwrap();
}

#[test]
fn test_each_page_faults_once() {
    let map = Mapping::protected(3);
    let resolver = reprotecting(map.base);
    let handle = axfault::start_tracking(map.base, map.len, resolver).unwrap();

    for page in 0..3 {
        for byte in 0..16 {
            write_byte(map.page(page) + byte, byte as u8);
        }
    }

    assert_eq!(resolver.hits(), 3);
    axfault::stop_tracking(handle).unwrap();
}

#[test]
fn test_overlap_and_handover_after_stop() {
    let map = Mapping::protected(2);
    let outer = reprotecting(map.base);
    let inner = reprotecting(map.page(1));
    let outer_handle = axfault::start_tracking(map.base, map.len, outer).unwrap();
    let inner_handle =
        axfault::start_tracking(map.page(1), protect::page_size(), inner).unwrap();

    write_byte(map.page(1), 1);
    assert_eq!(outer.hits(), 1);
    assert_eq!(inner.hits(), 0);

    // Re-arm the page and drop the first-registered region.
    protect::reprotect(map.page(1), protect::page_size(), PagePermission::None).unwrap();
    axfault::stop_tracking(outer_handle).unwrap();

    write_byte(map.page(1) + 4, 2);
    assert_eq!(outer.hits(), 1);
    assert_eq!(inner.hits(), 1);
    assert_eq!(inner.snapshot().last_offset, 4);

    axfault::stop_tracking(inner_handle).unwrap();
}

#[test]
fn test_dirty_tracking_with_closure_resolver() {
    static DIRTY: AtomicUsize = AtomicUsize::new(0);

    let map = Mapping::protected(4);
    let base = map.base;
    let page_size = protect::page_size();
    protect::reprotect(base, map.len, PagePermission::Read).unwrap();

    let resolver = Box::leak(Box::new(move |offset: usize, access: AccessKind| {
        if !access.is_write() {
            return false;
        }
        let page = offset / page_size;
        DIRTY.fetch_or(1 << page, Ordering::Relaxed);
        protect::reprotect(base + page * page_size, page_size, PagePermission::ReadWrite).is_ok()
    }));
    let handle = axfault::start_tracking(base, map.len, resolver).unwrap();

    // Reads never fault on a read-only page.
    assert_eq!(read_byte(map.page(0)), 0);
    write_byte(map.page(1), 1);
    write_byte(map.page(3), 1);

    assert_eq!(DIRTY.load(Ordering::Relaxed), 0b1010);
    axfault::stop_tracking(handle).unwrap();
}

// =============================================================================
// Propagated Faults (child process)
// =============================================================================

const CRASH_CASE_ENV: &str = "AXFAULT_CRASH_CASE";

fn run_crash_case(case: &str) -> ExitStatus {
    let exe = std::env::current_exe().unwrap();
    Command::new(exe)
        .args(["--exact", "crash_case_child", "--nocapture", "--test-threads=1"])
        .env(CRASH_CASE_ENV, case)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap()
}

fn died_of_fault(status: ExitStatus) -> bool {
    matches!(status.signal(), Some(libc::SIGSEGV) | Some(libc::SIGBUS))
}

/// Entry point for the child process; does nothing in a normal test run.
#[test]
fn crash_case_child() {
    let Ok(case) = std::env::var(CRASH_CASE_ENV) else {
        return;
    };

    let map = Mapping::protected(1);
    match case.as_str() {
        "declined" => {
            axfault::start_tracking(map.base, map.len, &Decline).unwrap();
            write_byte(map.base, 1);
        }
        "unmatched" => {
            let other = Mapping::protected(1);
            let handle = axfault::start_tracking(other.base, other.len, &Decline).unwrap();
            axfault::stop_tracking(handle).unwrap();
            write_byte(map.base, 1);
        }
        "untracked" => {
            let handle = axfault::start_tracking(map.base, map.len, reprotecting(map.base)).unwrap();
            axfault::stop_tracking(handle).unwrap();
            write_byte(map.base, 1);
        }
        "raised" => {
            let resolver: &'static _ = Box::leak(Box::new(CountingResolver::new(
                |_offset: usize, _access: AccessKind| true,
            )));
            axfault::start_tracking(0, usize::MAX, resolver).unwrap();
            unsafe { libc::raise(libc::SIGSEGV) };

            // A sent signal has no fault address and must never be resolved.
            let dispatched = resolver.hits() != 0 || axfault::stats().faults != 0;
            std::process::exit(if dispatched { 3 } else { 0 });
        }
        _ => return,
    }

    // Reaching this line means the fault was swallowed.
    std::process::exit(0);
}

#[test]
fn test_declined_fault_terminates_process() {
    let status = run_crash_case("declined");
    assert!(died_of_fault(status), "unexpected child status: {status:?}");
}

#[test]
fn test_unmatched_fault_terminates_process() {
    let status = run_crash_case("unmatched");
    assert!(died_of_fault(status), "unexpected child status: {status:?}");
}

#[test]
fn test_fault_after_stop_tracking_terminates_process() {
    let status = run_crash_case("untracked");
    assert!(died_of_fault(status), "unexpected child status: {status:?}");
}

#[test]
fn test_sent_sigsegv_is_not_dispatched() {
    let status = run_crash_case("raised");
    assert_eq!(status.code(), Some(0), "unexpected child status: {status:?}");
}
