//! Page permission changes for resolvers.
//!
//! The usual way to resolve a tracking fault is to loosen the protection of
//! the faulting page and let the access retry. [`ReprotectResolver`] does
//! exactly that for one region; [`reprotect`] is exposed for callers that
//! re-arm tracking by tightening permissions again.

use crate::resolver::{AccessKind, FaultResolver};

/// Host page permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePermission {
    None,
    Read,
    ReadWrite,
    ReadExecute,
    ReadWriteExecute,
    Execute,
}

impl PagePermission {
    /// Whether an access of `kind` is legal under this permission.
    pub fn allows(self, kind: AccessKind) -> bool {
        match kind {
            AccessKind::Read => matches!(
                self,
                Self::Read | Self::ReadWrite | Self::ReadExecute | Self::ReadWriteExecute
            ),
            AccessKind::Write => matches!(self, Self::ReadWrite | Self::ReadWriteExecute),
        }
    }

    #[cfg(unix)]
    fn to_prot(self) -> libc::c_int {
        match self {
            Self::None => libc::PROT_NONE,
            Self::Read => libc::PROT_READ,
            Self::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Self::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
            Self::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            Self::Execute => libc::PROT_EXEC,
        }
    }

    #[cfg(windows)]
    fn to_protect_flags(self) -> windows_sys::Win32::System::Memory::PAGE_PROTECTION_FLAGS {
        use windows_sys::Win32::System::Memory::*;

        match self {
            Self::None => PAGE_NOACCESS,
            Self::Read => PAGE_READONLY,
            Self::ReadWrite => PAGE_READWRITE,
            Self::ReadExecute => PAGE_EXECUTE_READ,
            Self::ReadWriteExecute => PAGE_EXECUTE_READWRITE,
            Self::Execute => PAGE_EXECUTE,
        }
    }
}

/// Host page size in bytes.
#[cfg(unix)]
pub fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

#[cfg(windows)]
pub fn page_size() -> usize {
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    let mut info: SYSTEM_INFO = unsafe { core::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    info.dwPageSize as usize
}

/// Change the protection of `[addr, addr + size)`.
///
/// `addr` must be page aligned. Returns the OS error code on failure.
#[cfg(unix)]
pub fn reprotect(addr: usize, size: usize, permission: PagePermission) -> Result<(), i32> {
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, size, permission.to_prot()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(crate::interceptor::unix::last_errno())
    }
}

#[cfg(windows)]
pub fn reprotect(addr: usize, size: usize, permission: PagePermission) -> Result<(), i32> {
    use windows_sys::Win32::Foundation::GetLastError;
    use windows_sys::Win32::System::Memory::VirtualProtect;

    let mut old = 0;
    let ok = unsafe {
        VirtualProtect(
            addr as *const core::ffi::c_void,
            size,
            permission.to_protect_flags(),
            &mut old,
        )
    };
    if ok != 0 {
        Ok(())
    } else {
        Err(unsafe { GetLastError() } as i32)
    }
}

/// Resolver that grants `permission` to the faulting page.
///
/// Declines faults whose access `permission` would still forbid, so a
/// read-only grant never turns a write fault into an endless retry loop.
#[derive(Debug, Clone, Copy)]
pub struct ReprotectResolver {
    base: usize,
    page_size: usize,
    permission: PagePermission,
}

impl ReprotectResolver {
    /// Resolver for a region starting at `base`.
    pub fn new(base: usize, permission: PagePermission) -> Self {
        Self {
            base,
            page_size: page_size(),
            permission,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn permission(&self) -> PagePermission {
        self.permission
    }
}

impl FaultResolver for ReprotectResolver {
    fn resolve(&self, offset: usize, access: AccessKind) -> bool {
        if !self.permission.allows(access) {
            return false;
        }

        let page = (self.base + offset) & !(self.page_size - 1);
        reprotect(page, self.page_size, self.permission).is_ok()
    }
}
