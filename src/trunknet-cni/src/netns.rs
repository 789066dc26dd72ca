//! Network namespace scoping
//!
//! Entering a namespace moves the calling thread; everything that must
//! observe the container's network stack runs inside a scoped closure
//! and the host namespace is restored on every exit path, error
//! included. Async work inside the scope has to live on a runtime
//! confined to the entered thread, so callers build a current-thread
//! runtime within the closure rather than reusing a host-side one.

use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};

use nix::sched::{setns, CloneFlags};

use crate::error::CniError;

/// Saves the host network namespace and restores it on drop
#[derive(Debug)]
pub struct NetnsGuard {
    host_ns: File,
}

impl NetnsGuard {
    /// Enter the namespace at `netns_path`, keeping a handle to the
    /// current one for restoration
    pub fn enter(netns_path: &str) -> Result<Self, CniError> {
        let host_ns = File::open("/proc/self/ns/net").map_err(|e| {
            CniError::namespace_error("failed to open current network namespace")
                .with_details(&e.to_string())
        })?;

        let target_ns = File::open(netns_path).map_err(|e| {
            CniError::namespace_error(&format!(
                "failed to open target network namespace {}",
                netns_path
            ))
            .with_details(&e.to_string())
        })?;

        setns(&target_ns, CloneFlags::CLONE_NEWNET).map_err(|e| {
            CniError::namespace_error(&format!(
                "failed to enter network namespace {}",
                netns_path
            ))
            .with_details(&e.to_string())
        })?;

        Ok(Self { host_ns })
    }

    /// Raw descriptor of the host namespace, for moving links back out
    /// while the thread is still inside the container namespace
    pub fn host_fd(&self) -> RawFd {
        self.host_ns.as_raw_fd()
    }

    /// Restore the host namespace, reporting failure instead of
    /// deferring to the best-effort drop
    pub fn restore(self) -> Result<(), CniError> {
        setns(&self.host_ns, CloneFlags::CLONE_NEWNET).map_err(|e| {
            CniError::namespace_error("failed to restore host network namespace")
                .with_details(&e.to_string())
        })?;
        // Drop would restore a second time
        std::mem::forget(self);
        Ok(())
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        // Best effort; the process exits right after a failed invocation
        let _ = setns(&self.host_ns, CloneFlags::CLONE_NEWNET);
    }
}

/// Run a closure inside the namespace at `netns_path`
///
/// The closure receives the guard so it can reach `host_fd` for
/// cross-namespace link moves. Restoration happens on every path; a
/// restoration failure takes precedence over the closure's own error
/// because a thread stuck in the wrong namespace is the worse outcome.
pub fn with_netns<T, F>(netns_path: &str, f: F) -> Result<T, CniError>
where
    F: FnOnce(&NetnsGuard) -> Result<T, CniError>,
{
    let guard = NetnsGuard::enter(netns_path)?;
    let result = f(&guard);
    guard.restore()?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CniErrorCode;

    #[test]
    fn test_current_netns_readable() {
        assert!(File::open("/proc/self/ns/net").is_ok());
    }

    #[test]
    fn test_enter_invalid_path() {
        let err = NetnsGuard::enter("/nonexistent/path/ns/net").unwrap_err();
        assert_eq!(err.code(), CniErrorCode::NamespaceResolutionFailed);
    }

    #[test]
    fn test_with_netns_propagates_enter_failure() {
        let result = with_netns("/nonexistent/path/ns/net", |_| Ok(()));
        assert!(result.is_err());
    }
}
