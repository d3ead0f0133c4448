use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// DaemonLockfile
// ---------------------------------------------------------------------------

/// Single-instance guard written to `<data_dir>/quorum.lock`.
///
/// A lockfile whose pid no longer exists is treated as stale and silently
/// replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonLockfile {
    pub pid: u32,
    pub host: String,
    pub port: u16,
    pub started_at: String,
    pub version: String,
}

impl DaemonLockfile {
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join("quorum.lock")
    }

    /// Read the lockfile if present and its process is still alive.
    pub fn read_valid(data_dir: &Path) -> Option<Self> {
        let path = Self::path(data_dir);
        let text = std::fs::read_to_string(&path).ok()?;
        let lock: DaemonLockfile = match serde_json::from_str(&text) {
            Ok(lock) => lock,
            Err(e) => {
                warn!(error = %e, "unreadable lockfile, treating as stale");
                return None;
            }
        };
        if !pid_alive(lock.pid) {
            return None;
        }
        Some(lock)
    }

    /// Write the lockfile, refusing when a live daemon already owns it.
    pub fn acquire(&self, data_dir: &Path) -> Result<(), String> {
        if let Some(existing) = Self::read_valid(data_dir) {
            if existing.pid != self.pid {
                return Err(format!(
                    "quorum daemon already running (pid={}, http://{}:{})",
                    existing.pid, existing.host, existing.port
                ));
            }
        }
        std::fs::create_dir_all(data_dir).map_err(|e| e.to_string())?;
        let json = serde_json::to_string_pretty(self).map_err(|e| e.to_string())?;
        std::fs::write(Self::path(data_dir), json).map_err(|e| e.to_string())
    }

    pub fn remove(data_dir: &Path) {
        let _ = std::fs::remove_file(Self::path(data_dir));
    }

    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Signal-0 liveness probe.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// Ask an existing daemon to terminate (used by `--replace`).
#[cfg(unix)]
pub fn terminate(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
