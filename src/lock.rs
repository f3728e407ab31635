//! Single-owner workspace lock.
//!
//! `server.lock.json` in the cache directory names the owning process. A
//! second process observing a live lock exits gracefully. Stale locks (dead
//! pid, unparseable record) are swept on acquisition, as are leftover pid
//! markers in the home-directory registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::store::{self, StoreTelemetry};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockFile {
    pub pid: u32,
    pub workspace: String,
    pub acquired_at: DateTime<Utc>,
}

pub struct WorkspaceLock {
    lock_path: PathBuf,
    pid_marker: Option<PathBuf>,
    pid: u32,
}

impl WorkspaceLock {
    /// Acquire the lock for `workspace` under `cache_dir`. Fails with
    /// `WorkspaceLocked` while another live process owns it; stale records
    /// are swept and replaced.
    pub fn acquire(cache_dir: &Path, workspace: &Path) -> EngineResult<Self> {
        std::fs::create_dir_all(cache_dir)?;
        let lock_path = cache_dir.join("server.lock.json");
        let pid = std::process::id();

        if let Ok(raw) = std::fs::read_to_string(&lock_path) {
            match serde_json::from_str::<LockFile>(&raw) {
                Ok(existing) if existing.pid != pid && pid_alive(existing.pid) => {
                    return Err(EngineError::WorkspaceLocked {
                        pid: existing.pid,
                        workspace: existing.workspace,
                    });
                }
                Ok(existing) => {
                    info!(
                        stale_pid = existing.pid,
                        "Sweeping stale workspace lock from dead process"
                    );
                    let _ = std::fs::remove_file(&lock_path);
                }
                Err(_) => {
                    warn!("Sweeping unparseable workspace lock");
                    let _ = std::fs::remove_file(&lock_path);
                }
            }
        }

        let record = LockFile {
            pid,
            workspace: workspace.display().to_string(),
            acquired_at: Utc::now(),
        };
        let mut scratch = StoreTelemetry::default();
        store::atomic_replace_json(&lock_path, &record, &mut scratch)?;

        let pid_marker = write_pid_marker(pid, workspace);
        info!(pid, workspace = %record.workspace, "Workspace lock acquired");
        Ok(Self {
            lock_path,
            pid_marker,
            pid,
        })
    }

    pub fn release(&mut self) {
        if let Ok(raw) = std::fs::read_to_string(&self.lock_path) {
            if let Ok(existing) = serde_json::from_str::<LockFile>(&raw) {
                if existing.pid == self.pid {
                    let _ = std::fs::remove_file(&self.lock_path);
                }
            }
        }
        if let Some(marker) = self.pid_marker.take() {
            let _ = std::fs::remove_file(marker);
        }
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Per-process marker under the home-directory registry; swept on start.
fn write_pid_marker(pid: u32, workspace: &Path) -> Option<PathBuf> {
    let registry = dirs::home_dir()?.join(".heuristic-mcp").join("pids");
    std::fs::create_dir_all(&registry).ok()?;
    sweep_stale_pid_markers(&registry);

    let marker = registry.join(format!("{pid}.json"));
    let record = LockFile {
        pid,
        workspace: workspace.display().to_string(),
        acquired_at: Utc::now(),
    };
    let json = serde_json::to_string_pretty(&record).ok()?;
    std::fs::write(&marker, json).ok()?;
    Some(marker)
}

fn sweep_stale_pid_markers(registry: &Path) {
    let Ok(entries) = std::fs::read_dir(registry) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(pid) = name.strip_suffix(".json").and_then(|s| s.parse::<u32>().ok()) else {
            let _ = std::fs::remove_file(entry.path());
            continue;
        };
        if !pid_alive(pid) {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // kill(pid, 0) probes existence; EPERM still means the process exists.
    let result = unsafe { libc::kill(pid as i32, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(pid: u32) -> bool {
    pid == std::process::id()
}
