//! Per-thread network namespace switching.
//!
//! `setns(CLONE_NEWNET)` only affects the calling thread. A [`NetnsGuard`]
//! therefore never leaves the thread it was created on, and code using it
//! runs inside `spawn_blocking` so no other task is scheduled onto the
//! switched thread while the guard is alive.

use crate::error::{HostdevError, Result};
use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::marker::PhantomData;
use thiserror::Error;
use tracing::{debug, error};

/// The thread could not return to its original namespace.
///
/// Every later operation on the thread would run in the wrong namespace, so
/// this is never handed back to callers: the guard aborts the process.
#[derive(Error, Debug)]
#[error("failed to restore network namespace after visiting pid {pid}: {source}")]
pub struct NamespaceRestoreError {
    pub pid: u32,
    #[source]
    pub source: nix::Error,
}

/// While alive, the current thread is in the network namespace of `pid`.
/// Dropping it switches back.
pub struct NetnsGuard {
    original: File,
    pid: u32,
    // setns is per thread
    _not_send: PhantomData<*const ()>,
}

impl NetnsGuard {
    /// Move the current thread into the network namespace of `pid`.
    pub fn enter(pid: u32) -> Result<Self> {
        let failed = |reason: String| HostdevError::NamespaceEnterFailed { pid, reason };

        let original = File::open("/proc/thread-self/ns/net")
            .map_err(|e| failed(format!("cannot open current namespace: {}", e)))?;
        let target = File::open(format!("/proc/{}/ns/net", pid))
            .map_err(|e| failed(format!("cannot open target namespace: {}", e)))?;

        setns(&target, CloneFlags::CLONE_NEWNET).map_err(|e| failed(e.to_string()))?;
        debug!(pid, "Entered network namespace");

        Ok(Self { original, pid, _not_send: PhantomData })
    }

    fn restore(&self) -> std::result::Result<(), NamespaceRestoreError> {
        setns(&self.original, CloneFlags::CLONE_NEWNET)
            .map_err(|source| NamespaceRestoreError { pid: self.pid, source })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        match self.restore() {
            Ok(()) => debug!(pid = self.pid, "Restored original network namespace"),
            Err(e) => {
                error!("{}", e);
                std::process::abort();
            }
        }
    }
}

/// Run `f` on the current thread inside the network namespace of `pid`.
pub fn with_netns<T>(pid: u32, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let _guard = NetnsGuard::enter(pid)?;
    f()
}
