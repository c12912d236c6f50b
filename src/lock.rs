// Host-wide advisory lock. Two concurrent invocations race on kernel state
// and the store, so every mutating command holds an exclusive flock on a
// well-known path for its whole duration.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{Result, VpcError};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Held for the lifetime of a mutating command; dropping releases the flock.
#[derive(Debug)]
pub struct StateLock {
    _lock: Flock<std::fs::File>,
}

impl StateLock {
    /// Acquire the exclusive lock, polling until `timeout` elapses. A zero
    /// timeout tries exactly once.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| VpcError::Lock(format!("cannot create {}: {}", parent.display(), e)))?;
        }

        let deadline = Instant::now() + timeout;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(|e| VpcError::Lock(format!("cannot open {}: {}", path.display(), e)))?;

        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => return Ok(Self { _lock: lock }),
                Err((returned, Errno::EWOULDBLOCK)) if Instant::now() < deadline => {
                    file = returned;
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err((_, Errno::EWOULDBLOCK)) => {
                    return Err(VpcError::Lock(format!(
                        "another vpcctl invocation holds {}",
                        path.display()
                    )));
                }
                Err((_, errno)) => {
                    return Err(VpcError::Lock(format!(
                        "flock on {} failed: {}",
                        path.display(),
                        errno
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquires_and_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".lock");

        let first = StateLock::acquire(&path, Duration::ZERO).unwrap();
        drop(first);
        StateLock::acquire(&path, Duration::ZERO).unwrap();
    }

    #[test]
    fn contended_lock_times_out_with_lock_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".lock");

        let _held = StateLock::acquire(&path, Duration::ZERO).unwrap();
        let err = StateLock::acquire(&path, Duration::ZERO).unwrap_err();
        assert!(matches!(err, VpcError::Lock(_)));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn creates_missing_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join(".lock");
        StateLock::acquire(&path, Duration::ZERO).unwrap();
        assert!(path.exists());
    }
}
