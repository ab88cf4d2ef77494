//! Exclusive run lock
//!
//! Only one orchestrator may drive a given progress store at a time. The lock
//! is an advisory `flock(2)` on `<progress-file>.lock`, held for the lifetime
//! of [`RunLock`]. The kernel releases it when the holder exits, so a crashed
//! run never leaves a stale lock behind.
//!
//! The holder's PID is written into the file for diagnostics only; it is never
//! used to decide whether the lock is held.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::error::{MigrationError, Result};

/// Guard for the exclusive run lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct RunLock {
    lock: Flock<File>,
    path: PathBuf,
}

impl RunLock {
    /// Lock file path for a progress record.
    pub fn path_for(progress_path: &Path) -> PathBuf {
        let mut name = progress_path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        progress_path.with_file_name(name)
    }

    /// Try to take the lock without blocking.
    ///
    /// # Errors
    ///
    /// - `ConcurrentRunDetected` if another process (or another guard in this
    ///   process) holds it
    /// - `LockUnavailable` if the lock file cannot be opened or written
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        let unavailable = |reason: String| MigrationError::LockUnavailable {
            lock_path: lock_path.to_path_buf(),
            reason,
        };

        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| unavailable(e.to_string()))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| unavailable(e.to_string()))?;

        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((mut file, Errno::EWOULDBLOCK)) => {
                return Err(MigrationError::ConcurrentRunDetected {
                    lock_path: lock_path.to_path_buf(),
                    holder: read_holder(&mut file),
                });
            }
            Err((_, errno)) => return Err(unavailable(errno.to_string())),
        };

        let record_holder = || -> std::io::Result<()> {
            let mut writer: &File = &lock;
            writer.set_len(0)?;
            writeln!(writer, "{}", std::process::id())?;
            writer.sync_all()
        };
        record_holder().map_err(|e| unavailable(e.to_string()))?;

        debug!(path = %lock_path.display(), pid = std::process::id(), "Run lock acquired");
        Ok(Self {
            lock,
            path: lock_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Clear the diagnostic PID; the flock itself is released with the fd
        let _ = self.lock.set_len(0);
        debug!(path = %self.path.display(), "Run lock released");
    }
}

fn read_holder(file: &mut File) -> Option<u32> {
    let mut content = String::new();
    file.read_to_string(&mut content).ok()?;
    content.trim().parse().ok()
}
