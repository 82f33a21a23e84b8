use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::debug;

/// Exclusive advisory lock on a workspace's `lock` file, released on drop.
///
/// Each acquisition opens its own descriptor, so threads of one process
/// exclude each other as well as other processes.
pub struct WorkspaceLock {
    _flock: Flock<File>,
}

impl WorkspaceLock {
    /// Block until the lock is held.
    pub fn acquire(path: &Path) -> Result<Self> {
        Self::lock(path, FlockArg::LockExclusive)?
            .ok_or_else(|| anyhow!("Lock {} was not granted", path.display()))
    }

    /// `None` when another holder has it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        Self::lock(path, FlockArg::LockExclusiveNonblock)
    }

    fn lock(path: &Path, arg: FlockArg) -> Result<Option<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;
        match Flock::lock(file, arg) {
            Ok(flock) => {
                debug!(path = %path.display(), "lock:acquired");
                Ok(Some(Self { _flock: flock }))
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err((_, errno)) => {
                Err(anyhow!(errno)).with_context(|| format!("Failed to lock {}", path.display()))
            }
        }
    }
}
