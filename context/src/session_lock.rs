//! Single-writer session locking.
//!
//! Two processes appending to the same session file would interleave
//! snapshots and corrupt each other's view, so a session is opened under an
//! exclusive lock file. The lock records the holder's pid so a crashed
//! holder can be detected and its stale lock reclaimed.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Lock files older than this are stale regardless of holder liveness.
const MAX_LOCK_AGE: Duration = Duration::from_secs(24 * 60 * 60);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("session is locked by pid {holder_pid} (lock file {path})")]
    Held { path: PathBuf, holder_pid: u32 },
    #[error("failed to access lock file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Exclusive lock on a session, released on drop.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
}

impl SessionLock {
    /// Acquire the lock at `path`, polling until `timeout` elapses.
    ///
    /// A lock whose holder is no longer running, or which is older than 24
    /// hours, is treated as stale and reclaimed.
    pub fn acquire(path: impl Into<PathBuf>, timeout: Duration) -> Result<Self, LockError> {
        let path = path.into();
        let deadline = Instant::now() + timeout;

        loop {
            match Self::try_create(&path) {
                Ok(lock) => return Ok(lock),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(holder_pid) = Self::reclaim_if_stale(&path)? {
                        if Instant::now() >= deadline {
                            return Err(LockError::Held { path, holder_pid });
                        }
                        std::thread::sleep(POLL_INTERVAL);
                    }
                    // Stale lock removed; retry immediately.
                }
                Err(source) => return Err(LockError::Io { path, source }),
            }
        }
    }

    fn try_create(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        file.write_all(
            serde_json::to_string(&info)
                .unwrap_or_default()
                .as_bytes(),
        )?;
        debug!(path = %path.display(), "acquired session lock");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Remove the lock if its holder is gone. Returns the live holder's pid
    /// when the lock is still valid, `None` when it was reclaimed.
    fn reclaim_if_stale(path: &Path) -> Result<Option<u32>, LockError> {
        let info = std::fs::read_to_string(path)
            .ok()
            .and_then(|contents| serde_json::from_str::<LockInfo>(&contents).ok());

        let stale = match &info {
            // Unreadable or garbled lock files are reclaimed too.
            None => true,
            Some(info) => {
                let age = Utc::now().signed_duration_since(info.acquired_at);
                age.to_std().is_ok_and(|age| age > MAX_LOCK_AGE) || !process_alive(info.pid)
            }
        };

        if stale {
            warn!(path = %path.display(), "reclaiming stale session lock");
            // A racing reclaim may have removed it first; the retry handles it.
            let _ = std::fs::remove_file(path);
            return Ok(None);
        }

        Ok(info.map(|info| info.pid))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "failed to release session lock: {e}");
        }
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 tests existence without delivering anything. EPERM still
    // means the process exists.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No cheap liveness check; fall back to the age check alone.
    true
}
