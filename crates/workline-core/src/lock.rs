use crate::error::{Result, WorklineError};
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::warn;

// ---------------------------------------------------------------------------
// LockInfo
// ---------------------------------------------------------------------------

/// Contents of the on-disk lock marker. Identifies the holder so a stale
/// marker left by a crashed process can be reclaimed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            host: current_host(),
            acquired_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(root: &Path) -> Self {
        Self {
            path: paths::lock_path(root),
            poll_interval: Duration::from_millis(50),
        }
    }

    #[cfg(test)]
    pub fn with_poll_interval(root: &Path, poll_interval: Duration) -> Self {
        Self {
            path: paths::lock_path(root),
            poll_interval,
        }
    }

    /// Acquire the store lock, polling until `timeout` elapses.
    ///
    /// A marker whose recorded process is no longer alive is reclaimed
    /// immediately (logged, not raised). Failure leaves no side effects.
    pub fn acquire(&self, timeout: Duration) -> Result<LockGuard> {
        let started = Instant::now();
        loop {
            match self.try_acquire()? {
                Some(guard) => return Ok(guard),
                None => {
                    if started.elapsed() >= timeout {
                        return Err(WorklineError::LockTimeout {
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    if self.reclaim_if_stale()? {
                        continue;
                    }
                    std::thread::sleep(self.poll_interval.min(
                        timeout.saturating_sub(started.elapsed()).max(Duration::from_millis(1)),
                    ));
                }
            }
        }
    }

    /// Release the lock. Deletes the marker only if it still identifies
    /// `guard`'s holder; a mismatch means another process reclaimed the lock
    /// after staleness recovery raced, and is logged rather than raised.
    pub fn release(&self, mut guard: LockGuard) {
        guard.release();
    }

    fn try_acquire(&self) -> Result<Option<LockGuard>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let info = LockInfo::current();
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => {
                use std::io::Write as _;
                let mut file = file;
                file.write_all(serde_json::to_string(&info)?.as_bytes())?;
                file.flush()?;
                Ok(Some(LockGuard {
                    path: self.path.clone(),
                    info,
                    released: false,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns true if a stale marker was removed and acquisition should be
    /// retried immediately.
    fn reclaim_if_stale(&self) -> Result<bool> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            // Removed between our create attempt and this read.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        let holder: LockInfo = match serde_json::from_str(&content) {
            Ok(info) => info,
            Err(_) => {
                // Unreadable marker, likely a torn write from a crashed
                // holder. Reclaim it.
                warn!(path = %self.path.display(), "lock marker unreadable, reclaiming");
                remove_if_exists(&self.path)?;
                return Ok(true);
            }
        };
        // Liveness can only be probed for processes on this host.
        if holder.host == current_host() && !is_process_alive(holder.pid) {
            warn!(
                pid = holder.pid,
                host = %holder.host,
                "stale lock from dead process, reclaiming"
            );
            remove_if_exists(&self.path)?;
            return Ok(true);
        }
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// LockGuard
// ---------------------------------------------------------------------------

/// Held lock. Releases on drop; the marker is only deleted if it still
/// identifies this guard's holder.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    info: LockInfo,
    released: bool,
}

impl LockGuard {
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<LockInfo>(&content) {
                Ok(current) if current == self.info => {
                    if let Err(e) = remove_if_exists(&self.path) {
                        warn!(error = %e, "failed to remove lock marker on release");
                    }
                }
                _ => {
                    warn!(
                        path = %self.path.display(),
                        "lock marker no longer identifies this holder, leaving it"
                    );
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "failed to re-read lock marker on release"),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// Liveness / identity probes
// ---------------------------------------------------------------------------

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn current_host() -> String {
    if let Ok(host) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let host = host.trim();
        if !host.is_empty() {
            return host.to_string();
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// `/proc/{pid}/stat` rather than `/proc/{pid}` so reparented zombies do not
/// count as alive.
#[cfg(target_os = "linux")]
fn is_process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}/stat")).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(true)
}

// Without a liveness probe stale markers are never reclaimed automatically;
// the holder check in release() still prevents cross-holder deletes.
#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
