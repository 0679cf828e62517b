//! Advisory lock files for namespace-level mutual exclusion
//!
//! A lock is a file created with `create_new` (atomic on every platform we
//! care about) holding the owner's pid. Holders are expected to release
//! within milliseconds; a lock older than [`LOCK_TTL`] is presumed leaked by
//! a crashed process and is stolen.

use crate::retry::RetryConfig;
use crate::{MusterError, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Age after which a lock file is presumed leaked
const LOCK_TTL: Duration = Duration::from_secs(10);

/// RAII guard for a namespace lock; the file is removed on drop
#[derive(Debug)]
pub struct NamespaceLock {
    path: PathBuf,
}

impl NamespaceLock {
    /// Acquire the lock at `path`, retrying with backoff while held elsewhere
    pub fn acquire(path: PathBuf, retry: &RetryConfig) -> Result<Self> {
        let mut attempt = 0;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    debug!(lock = %path.display(), "Namespace lock acquired");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::steal_if_stale(&path) {
                        continue;
                    }
                    if attempt >= retry.max_retries {
                        return Err(MusterError::Timeout(format!(
                            "Could not acquire namespace lock {} after {} attempts",
                            path.display(),
                            attempt + 1
                        )));
                    }
                    std::thread::sleep(retry.backoff_duration(attempt));
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove a lock file whose holder has apparently crashed
    ///
    /// A holder still alive past [`LOCK_TTL`] forfeits mutual exclusion;
    /// holds are expected to last milliseconds, three orders of magnitude
    /// under the TTL.
    fn steal_if_stale(path: &PathBuf) -> bool {
        let Ok(meta) = fs::metadata(path) else {
            // Lock vanished between our create attempt and now
            return true;
        };
        let Ok(mtime) = meta.modified() else {
            return false;
        };
        let stale = mtime.elapsed().is_ok_and(|age| age > LOCK_TTL);
        if !stale {
            return false;
        }

        // Another process may have stolen and recreated the lock since the
        // staleness check; only remove the file if it is still the one that
        // was inspected. A racing recreate between this re-check and the
        // remove_file can still be deleted wrongly; that window is a few
        // syscalls wide and accepted.
        let unchanged = fs::metadata(path)
            .ok()
            .and_then(|m| m.modified().ok())
            .is_some_and(|m| m == mtime);
        if unchanged && fs::remove_file(path).is_ok() {
            warn!(lock = %path.display(), "Stole stale namespace lock");
            return true;
        }
        false
    }
}

impl Drop for NamespaceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "Failed to release namespace lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".lock");

        {
            let _lock = NamespaceLock::acquire(path.clone(), &RetryConfig::quick()).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_second_acquire_blocks_then_times_out() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".lock");

        let _held = NamespaceLock::acquire(path.clone(), &RetryConfig::quick()).unwrap();

        let fast = RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
            jitter: false,
        };
        let second = NamespaceLock::acquire(path.clone(), &fast);
        assert!(matches!(second, Err(MusterError::Timeout(_))));
    }

    #[test]
    fn test_fresh_lock_is_not_stolen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".lock");
        fs::write(&path, b"123").unwrap();

        assert!(!NamespaceLock::steal_if_stale(&path));
        assert!(path.exists());
    }

    #[test]
    fn test_stale_lock_is_stolen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".lock");

        // Fake a leaked lock from a crashed holder
        fs::write(&path, b"99999").unwrap();
        let old = filetime_past(&path);
        assert!(old);

        let lock = NamespaceLock::acquire(path.clone(), &RetryConfig::quick());
        assert!(lock.is_ok());
    }

    /// Backdate a file's mtime beyond the lock TTL
    fn filetime_past(path: &std::path::Path) -> bool {
        std::process::Command::new("touch")
            .arg("-d")
            .arg("2000-01-01T00:00:00")
            .arg(path)
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}
