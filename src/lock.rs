//! Advisory single-writer lock serialising every mutating entry point on
//! the host. Retries on busy/missing at a fixed 100ms interval, release is
//! guaranteed even on panic via `Drop`.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};

use crate::errors::{Result, VniError};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const MAX_ATTEMPTS: u32 = 1000;

enum TryLockState {
    Acquired(File),
    Busy,
    Missing,
    Other(std::io::Error),
}

fn try_lock(path: &Path) -> TryLockState {
    let file = match OpenOptions::new().create(true).write(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return TryLockState::Missing,
        Err(e) => return TryLockState::Other(e),
    };
    use std::os::fd::AsRawFd;
    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => TryLockState::Acquired(file),
        Err(Errno::EWOULDBLOCK) => TryLockState::Busy,
        Err(e) => TryLockState::Other(std::io::Error::from(e)),
    }
}

/// RAII guard; releases the advisory lock when dropped, including on
/// unwind, so a panicking locked closure never wedges the host.
pub struct LockGuard {
    #[allow(dead_code)]
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        use std::os::fd::AsRawFd;
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}

pub fn acquire(path: &Path) -> Result<LockGuard> {
    for attempt in 0..MAX_ATTEMPTS {
        match try_lock(path) {
            TryLockState::Acquired(file) => return Ok(LockGuard { file }),
            TryLockState::Busy | TryLockState::Missing => {
                sleep(RETRY_INTERVAL);
                let _ = attempt;
            }
            TryLockState::Other(e) => {
                return Err(VniError::KernelOpFailure {
                    op: "flock",
                    detail: e.to_string(),
                })
            }
        }
    }
    Err(VniError::LockTimeout {
        attempts: MAX_ATTEMPTS,
    })
}

/// Runs `f` while holding the host-wide lock at the given path, releasing
/// it unconditionally afterward (including on panic, via `LockGuard`'s
/// `Drop`).
pub fn run<T>(path: &PathBuf, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let _guard = acquire(path)?;
    f()
}
