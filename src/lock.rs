//! Cross-process write exclusion for record files.
//!
//! Ownership of `<file>.lock` is taken by creating the sentinel with
//! `O_CREAT|O_EXCL`; an advisory whole-file lock is layered on the same
//! handle. The sentinel body records the owning PID and a lease timestamp
//! so a waiter can reclaim a lock whose owner died: the lease must be past
//! its TTL and the PID must be gone. Release happens in `Drop`, so the
//! sentinel comes off on every exit path, panics included.

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::Clock;

#[derive(Debug, Serialize, Deserialize)]
struct Lease {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lease age past which a lock with a dead owner may be stolen.
    pub ttl: Duration,
    /// Longest to wait for the lock before `LockTimeout`.
    pub timeout: Duration,
    /// Delay between acquisition attempts.
    pub poll: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        LockOptions {
            ttl: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            poll: Duration::from_millis(25),
        }
    }
}

/// Scoped exclusive lock on one record file.
#[derive(Debug)]
pub struct FileLock {
    target: PathBuf,
    sentinel: PathBuf,
    handle: Option<fs::File>,
    /// PID of a dead owner whose stale lock was reclaimed on the way in.
    pub stolen_from: Option<u32>,
}

pub fn sentinel_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

impl FileLock {
    pub fn acquire(target: &Path, options: &LockOptions, clock: &dyn Clock) -> Result<FileLock> {
        let sentinel = sentinel_path(target);
        let started = Instant::now();
        let mut stolen_from = None;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&sentinel)
            {
                Ok(file) => {
                    file.try_lock_exclusive()
                        .map_err(|e| Error::io(sentinel.clone(), e))?;
                    let lease = Lease {
                        pid: std::process::id(),
                        acquired_at: clock.now(),
                    };
                    serde_json::to_writer(&file, &lease)
                        .map_err(|e| Error::io(sentinel.clone(), e.into()))?;
                    file.sync_all()
                        .map_err(|e| Error::io(sentinel.clone(), e))?;
                    debug!(message = "Acquired file lock.", target = ?target);
                    return Ok(FileLock {
                        target: target.to_path_buf(),
                        sentinel,
                        handle: Some(file),
                        stolen_from,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(pid) = reclaim_stale(&sentinel, options.ttl, clock)? {
                        warn!(
                            message = "Reclaimed stale lock from dead process.",
                            sentinel = ?sentinel,
                            owner_pid = pid
                        );
                        stolen_from = Some(pid);
                        continue;
                    }
                }
                Err(e) => return Err(Error::io(sentinel, e)),
            }

            if started.elapsed() >= options.timeout {
                return Err(Error::LockTimeout {
                    file: target.to_path_buf(),
                    waited: started.elapsed(),
                });
            }
            thread::sleep(options.poll.min(options.timeout));
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(error) = fs2::FileExt::unlock(&handle) {
                warn!(message = "Failed to release advisory lock.", %error);
            }
        }
        if let Err(error) = fs::remove_file(&self.sentinel) {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(message = "Failed to remove lock sentinel.", sentinel = ?self.sentinel, %error);
            }
        }
    }
}

/// Remove the sentinel and report the dead owner's PID when the lease is
/// both expired and owned by a process that no longer exists. Also used at
/// store open to clear sentinels left by crashed writers.
pub fn reclaim_stale(sentinel: &Path, ttl: Duration, clock: &dyn Clock) -> Result<Option<u32>> {
    let mut body = String::new();
    match fs::File::open(sentinel) {
        Ok(mut file) => {
            if file.read_to_string(&mut body).is_err() {
                return Ok(None);
            }
        }
        // Raced with the owner's release; the next create attempt decides.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(sentinel.to_path_buf(), e)),
    }

    let Ok(lease) = serde_json::from_str::<Lease>(&body) else {
        // An empty or half-written sentinel: fall back to its mtime.
        let stale = fs::metadata(sentinel)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| mtime.elapsed().ok())
            .map(|age| age > ttl)
            .unwrap_or(false);
        if stale {
            fs::remove_file(sentinel).ok();
            return Ok(Some(0));
        }
        return Ok(None);
    };

    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30));
    let expired = clock.now() - lease.acquired_at > ttl;
    if expired && !pid_alive(lease.pid) {
        fs::remove_file(sentinel).ok();
        return Ok(Some(lease.pid));
    }
    Ok(None)
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // Signal 0 probes existence without delivering anything. EPERM still
    // means the process exists.
    let rc = unsafe { libc::kill(pid as i32, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use chrono::Utc;
    use tempfile::tempdir;

    use super::*;
    use crate::SystemClock;

    fn quick_options() -> LockOptions {
        LockOptions {
            ttl: Duration::from_secs(30),
            timeout: Duration::from_millis(200),
            poll: Duration::from_millis(10),
        }
    }

    #[test]
    fn acquire_creates_and_drop_removes_sentinel() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("conversations.aicf");
        let sentinel = sentinel_path(&target);
        {
            let lock = FileLock::acquire(&target, &quick_options(), &SystemClock).unwrap();
            assert!(sentinel.exists());
            assert!(lock.stolen_from.is_none());
        }
        assert!(!sentinel.exists());
    }

    #[test]
    fn second_acquire_times_out_while_held() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("conversations.aicf");
        let _held = FileLock::acquire(&target, &quick_options(), &SystemClock).unwrap();
        let err = FileLock::acquire(&target, &quick_options(), &SystemClock).unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
    }

    #[test]
    fn stale_lock_with_dead_owner_is_stolen() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("conversations.aicf");
        let sentinel = sentinel_path(&target);

        // A lease from a PID that cannot exist, well past its TTL.
        let lease = Lease {
            pid: 4_000_000_000,
            acquired_at: Utc::now() - chrono::Duration::seconds(120),
        };
        std::fs::write(&sentinel, serde_json::to_string(&lease).unwrap()).unwrap();

        let lock = FileLock::acquire(&target, &quick_options(), &SystemClock).unwrap();
        assert_eq!(lock.stolen_from, Some(4_000_000_000));
    }

    #[test]
    fn fresh_lease_from_live_owner_is_not_stolen() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("conversations.aicf");
        let sentinel = sentinel_path(&target);

        let lease = Lease {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        std::fs::write(&sentinel, serde_json::to_string(&lease).unwrap()).unwrap();

        let err = FileLock::acquire(&target, &quick_options(), &SystemClock).unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
    }

    #[test]
    fn expired_lease_from_live_owner_is_not_stolen() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("conversations.aicf");
        let sentinel = sentinel_path(&target);

        // Our own (definitely live) PID with an ancient lease.
        let lease = Lease {
            pid: std::process::id(),
            acquired_at: Utc::now() - chrono::Duration::seconds(3600),
        };
        std::fs::write(&sentinel, serde_json::to_string(&lease).unwrap()).unwrap();

        let err = FileLock::acquire(&target, &quick_options(), &SystemClock).unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
    }
}
