//! PID marker files
//!
//! One small JSON file per spawned service at a well-known path, so a later
//! `stagehand stop` (a separate process invocation) can terminate what an
//! earlier `stagehand up` started. Markers record the process start time and
//! are validated against it before any signal is sent; a recycled PID is
//! never signalled.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::errors::Result;
use crate::os::{OsBackend, validate_running_process};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidMarker {
    pub service: String,
    pub pid: u32,
    /// Unix start time of the process, for PID-reuse validation.
    pub started_at: Option<i64>,
}

fn marker_path(pids_dir: &Path, service: &str) -> PathBuf {
    pids_dir.join(format!("{}.pid", service))
}

pub fn write_marker(pids_dir: &Path, marker: &PidMarker) -> Result<()> {
    std::fs::create_dir_all(pids_dir)?;
    let json = serde_json::to_string(marker)
        .map_err(|e| crate::errors::LauncherError::Internal(e.to_string()))?;
    std::fs::write(marker_path(pids_dir, &marker.service), json)?;
    Ok(())
}

pub fn remove_marker(pids_dir: &Path, service: &str) {
    let path = marker_path(pids_dir, service);
    if let Err(e) = std::fs::remove_file(&path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Could not remove PID marker {}: {}", path.display(), e);
    }
}

/// Read all persisted markers; unreadable files are skipped with a warning.
pub fn read_markers(pids_dir: &Path) -> Vec<PidMarker> {
    let Ok(entries) = std::fs::read_dir(pids_dir) else {
        return Vec::new();
    };
    let mut markers = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e == "pid") != Some(true) {
            continue;
        }
        match std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|s| serde_json::from_str::<PidMarker>(&s).map_err(|e| e.to_string()))
        {
            Ok(marker) => markers.push(marker),
            Err(e) => warn!("Skipping unreadable PID marker {}: {}", path.display(), e),
        }
    }
    markers.sort_by(|a, b| a.service.cmp(&b.service));
    markers
}

/// Gracefully terminate every validly-running marked service. Returns the
/// number of processes signalled; zero when there is nothing to stop. Stale
/// and recycled markers are cleaned up without any signal being sent.
pub fn stop_all(pids_dir: &Path, os: &dyn OsBackend) -> Result<usize> {
    let markers = read_markers(pids_dir);
    let mut stopped = 0;

    for marker in markers {
        if validate_running_process(os, marker.pid, marker.started_at) {
            debug!("Stopping {} (pid {})", marker.service, marker.pid);
            match os.terminate(marker.pid) {
                Ok(()) => stopped += 1,
                Err(e) => warn!("Could not stop {} (pid {}): {}", marker.service, marker.pid, e),
            }
        } else {
            debug!(
                "Marker for {} (pid {}) is stale, removing without signalling",
                marker.service, marker.pid
            );
        }
        remove_marker(pids_dir, &marker.service);
    }

    Ok(stopped)
}
