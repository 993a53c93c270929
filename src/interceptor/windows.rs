//! Windows vectored exception backend.
//!
//! Registered first in the vectored handler chain. Only
//! `EXCEPTION_ACCESS_VIOLATION` is examined; its record carries the access
//! kind in `ExceptionInformation[0]` (0 read, 1 write, 8 execute) and the
//! faulting address in `ExceptionInformation[1]`.

use core::ffi::c_void;

use windows_sys::Win32::Foundation::{EXCEPTION_ACCESS_VIOLATION, GetLastError};
use windows_sys::Win32::System::Diagnostics::Debug::{
    AddVectoredExceptionHandler, EXCEPTION_POINTERS, RemoveVectoredExceptionHandler,
};

use super::{FaultDisposition, FaultInfo, FaultInterceptor};
use crate::resolver::AccessKind;

const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

/// `ExceptionInformation[0]` value for a write access.
const ACCESS_WRITE: usize = 1;

/// Interceptor built on `AddVectoredExceptionHandler`.
///
/// The install token is the handler handle.
#[derive(Debug)]
pub struct VectoredInterceptor {
    _private: (),
}

impl VectoredInterceptor {
    pub(crate) const fn new() -> Self {
        Self { _private: () }
    }
}

impl FaultInterceptor for VectoredInterceptor {
    fn install(&self) -> Result<usize, i32> {
        let handle = unsafe { AddVectoredExceptionHandler(1, Some(on_exception)) };
        if handle.is_null() {
            let code = unsafe { GetLastError() } as i32;
            log::warn!("vectored interceptor: AddVectoredExceptionHandler failed ({})", code);
            return Err(code);
        }
        Ok(handle as usize)
    }

    fn uninstall(&self, token: usize) {
        if token == 0 {
            return;
        }
        if unsafe { RemoveVectoredExceptionHandler(token as *const c_void) } == 0 {
            log::warn!("vectored interceptor: handler {:#x} was not registered", token);
        }
    }

    fn name(&self) -> &'static str {
        "windows-veh"
    }
}

unsafe extern "system" fn on_exception(pointers: *mut EXCEPTION_POINTERS) -> i32 {
    // SAFETY: the system passes a valid EXCEPTION_POINTERS with a valid record.
    let record = unsafe { &*(*pointers).ExceptionRecord };

    if record.ExceptionCode != EXCEPTION_ACCESS_VIOLATION || record.NumberParameters < 2 {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let access = AccessKind::from_write_flag(record.ExceptionInformation[0] == ACCESS_WRITE);
    let address = record.ExceptionInformation[1];

    match crate::tracker().handle_fault(FaultInfo::new(address, access)) {
        FaultDisposition::Resume => EXCEPTION_CONTINUE_EXECUTION,
        FaultDisposition::Decline => EXCEPTION_CONTINUE_SEARCH,
    }
}
