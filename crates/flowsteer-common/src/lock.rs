//! Per-interface exclusive lock.
//!
//! Every mutating operation on an interface holds an advisory `flock(2)`
//! on `<lock_dir>/<interface>.lock` for its whole duration. The lock is
//! released when [`InterfaceLock`] is dropped, so every exit path,
//! including `?` returns and panics, releases it.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::error::{NicError, NicResult};

/// A held per-interface lock.
pub struct InterfaceLock {
    path: PathBuf,
    _flock: Flock<File>,
}

impl InterfaceLock {
    /// Acquires the lock for `iface` without blocking.
    ///
    /// Fails with [`NicError::LockHeld`] if another process holds it.
    pub fn acquire(lock_dir: &Path, iface: &str) -> NicResult<Self> {
        if iface.is_empty() || iface.contains('/') || iface == "." || iface == ".." {
            return Err(NicError::Lock {
                path: lock_dir.to_path_buf(),
                message: format!("invalid interface name '{iface}'"),
            });
        }

        std::fs::create_dir_all(lock_dir).map_err(|e| NicError::io(lock_dir, e))?;
        let path = lock_dir.join(format!("{iface}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| NicError::io(&path, e))?;

        let flock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            if errno == Errno::EWOULDBLOCK {
                NicError::LockHeld { path: path.clone() }
            } else {
                NicError::Lock {
                    path: path.clone(),
                    message: errno.desc().to_string(),
                }
            }
        })?;

        debug!(lock = %path.display(), "Acquired interface lock");
        Ok(Self {
            path,
            _flock: flock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for InterfaceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceLock")
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for InterfaceLock {
    fn drop(&mut self) {
        debug!(lock = %self.path.display(), "Released interface lock");
    }
}
