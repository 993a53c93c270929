//! In-process interceptor backend.
//!
//! Installs nothing in the operating system. Faults are fed to the tracker
//! directly with [`FaultTracker::handle_fault`](crate::FaultTracker::handle_fault),
//! which lets dispatch be exercised deterministically with synthetic
//! addresses. Install failures can be injected to test the rollback path.

use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use super::FaultInterceptor;

/// Mock backend that counts installs and can be told to fail them.
#[derive(Debug)]
pub struct MockInterceptor {
    /// Non-zero: `install` fails with this code.
    fail_with: AtomicI32,
    installs: AtomicUsize,
    uninstalls: AtomicUsize,
    /// Token of the active hook, 0 when none.
    active: AtomicUsize,
}

impl MockInterceptor {
    pub const fn new() -> Self {
        Self {
            fail_with: AtomicI32::new(0),
            installs: AtomicUsize::new(0),
            uninstalls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
        }
    }

    /// Make subsequent installs fail with `code`, or succeed again with `None`.
    pub fn set_install_failure(&self, code: Option<i32>) {
        self.fail_with.store(code.unwrap_or(0), Ordering::Relaxed);
    }

    /// Successful installs so far.
    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::Relaxed)
    }

    pub fn uninstall_count(&self) -> usize {
        self.uninstalls.load(Ordering::Relaxed)
    }

    /// Whether a hook is currently installed.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed) != 0
    }
}

impl Default for MockInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultInterceptor for MockInterceptor {
    fn install(&self) -> Result<usize, i32> {
        let code = self.fail_with.load(Ordering::Relaxed);
        if code != 0 {
            return Err(code);
        }

        // Tokens start at 1 so that 0 can mean "no hook".
        let token = self.installs.fetch_add(1, Ordering::Relaxed) + 1;
        self.active.store(token, Ordering::Relaxed);
        Ok(token)
    }

    fn uninstall(&self, token: usize) {
        if self
            .active
            .compare_exchange(token, 0, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.uninstalls.fetch_add(1, Ordering::Relaxed);
        } else {
            log::warn!("mock interceptor: uninstall with stale token {}", token);
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_tokens_are_distinct() {
        let mock = MockInterceptor::new();
        let first = mock.install().unwrap();
        mock.uninstall(first);
        let second = mock.install().unwrap();

        assert_ne!(first, second);
        assert_eq!(mock.install_count(), 2);
        assert_eq!(mock.uninstall_count(), 1);
        assert!(mock.is_active());
    }

    #[test]
    fn test_injected_failure() {
        let mock = MockInterceptor::new();
        mock.set_install_failure(Some(13));
        assert_eq!(mock.install(), Err(13));
        assert!(!mock.is_active());

        mock.set_install_failure(None);
        assert!(mock.install().is_ok());
    }

    #[test]
    fn test_stale_uninstall_is_ignored() {
        let mock = MockInterceptor::new();
        let token = mock.install().unwrap();
        mock.uninstall(token + 1);
        assert!(mock.is_active());
        assert_eq!(mock.uninstall_count(), 0);
    }
}
