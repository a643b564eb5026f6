//! Run recording: one timestamped directory per invocation
//!
//! The recorder is created eagerly at orchestrator start so even
//! preflight-only failures leave a diagnosable artifact. Events are
//! append-only JSON Lines; the terminal summary is written exactly once and
//! `latest.txt` points a later `diagnose` at the most recent run.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::errors::Result;

/// Name of the pointer file at the runs root.
pub const LATEST_POINTER: &str = "latest.txt";

/// Lines kept when tailing a capture file for diagnostics.
pub const STDERR_TAIL_LINES: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// One structured event in `events.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub ts: DateTime<Utc>,
    pub level: EventLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Failed,
}

/// Per-service slice of the terminal summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub port: u16,
    pub pid: Option<u32>,
    pub reused: bool,
}

/// Terminal state of a run, written once to `run_summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub services: BTreeMap<String, ServiceSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Which capture stream a path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStream {
    Stdout,
    Stderr,
}

impl CaptureStream {
    fn suffix(&self) -> &'static str {
        match self {
            CaptureStream::Stdout => "stdout",
            CaptureStream::Stderr => "stderr",
        }
    }
}

struct RecorderInner {
    events: File,
    finished: bool,
}

/// Append-only recorder for one run. All writes funnel through a single
/// mutex so concurrent per-service tasks keep the event log ordered.
pub struct RunRecorder {
    runs_root: PathBuf,
    run_dir: PathBuf,
    inner: Mutex<RecorderInner>,
}

impl RunRecorder {
    /// Create the timestamped run directory and its empty event log.
    pub fn begin(runs_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(runs_root)?;

        let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let mut name = format!("run-{}", stamp);
        let mut counter = 1;
        while runs_root.join(&name).exists() {
            counter += 1;
            name = format!("run-{}-{}", stamp, counter);
        }

        let run_dir = runs_root.join(&name);
        std::fs::create_dir_all(&run_dir)?;
        let events = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join("events.jsonl"))?;

        Ok(Self {
            runs_root: runs_root.to_path_buf(),
            run_dir,
            inner: Mutex::new(RecorderInner {
                events,
                finished: false,
            }),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append one event and mirror it to tracing.
    pub fn record(&self, level: EventLevel, service: Option<&str>, message: &str, fix: Option<&str>) {
        let event = RunEvent {
            ts: Utc::now(),
            level,
            service: service.map(str::to_string),
            message: message.to_string(),
            fix: fix.map(str::to_string),
        };

        match level {
            EventLevel::Info => info!(service = service.unwrap_or("-"), "{}", message),
            EventLevel::Warn => warn!(service = service.unwrap_or("-"), "{}", message),
            EventLevel::Error => error!(service = service.unwrap_or("-"), "{}", message),
        }

        let mut inner = self.inner.lock();
        if let Ok(line) = serde_json::to_string(&event) {
            // A full disk should not take the run down with it
            let _ = writeln!(inner.events, "{}", line);
            let _ = inner.events.flush();
        }
    }

    pub fn info(&self, service: Option<&str>, message: &str) {
        self.record(EventLevel::Info, service, message, None);
    }

    pub fn warn(&self, service: Option<&str>, message: &str) {
        self.record(EventLevel::Warn, service, message, None);
    }

    pub fn error(&self, service: Option<&str>, message: &str) {
        self.record(EventLevel::Error, service, message, None);
    }

    /// Path of a per-service output capture file inside the run directory.
    pub fn capture_path(&self, service: &str, stream: CaptureStream) -> PathBuf {
        self.run_dir
            .join(format!("{}.{}.log", service, stream.suffix()))
    }

    /// Snapshot of the resolved port/PID/reuse map (`ports.json`).
    pub fn write_ports(&self, ports: &BTreeMap<String, ServiceSummary>) -> Result<()> {
        let json = serde_json::to_string_pretty(ports)
            .map_err(|e| crate::errors::LauncherError::Internal(e.to_string()))?;
        std::fs::write(self.run_dir.join("ports.json"), json)?;
        Ok(())
    }

    /// Write the doctor findings artifact (`doctor.log`).
    pub fn write_doctor_log(&self, rendered: &str) -> Result<()> {
        std::fs::write(self.run_dir.join("doctor.log"), rendered)?;
        Ok(())
    }

    /// Write the root-cause artifact (`error_root_cause.json`).
    pub fn write_root_cause(&self, report: &crate::classify::RootCauseReport) -> Result<()> {
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| crate::errors::LauncherError::Internal(e.to_string()))?;
        std::fs::write(self.run_dir.join("error_root_cause.json"), json)?;
        Ok(())
    }

    /// Write the terminal summary and update the latest-run pointer.
    /// A second call is a no-op; the summary is never rewritten.
    pub fn finish(&self, summary: &RunSummary) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.finished {
                warn!("Run summary already written, ignoring second finish");
                return Ok(());
            }
            inner.finished = true;
        }

        let json = serde_json::to_string_pretty(summary)
            .map_err(|e| crate::errors::LauncherError::Internal(e.to_string()))?;
        std::fs::write(self.run_dir.join("run_summary.json"), json)?;

        let dir_name = self
            .run_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        std::fs::write(self.runs_root.join(LATEST_POINTER), dir_name)?;
        Ok(())
    }
}

/// Resolve the most recent run directory via the pointer file, if any.
pub fn latest_run_dir(runs_root: &Path) -> Option<PathBuf> {
    let name = std::fs::read_to_string(runs_root.join(LATEST_POINTER)).ok()?;
    let dir = runs_root.join(name.trim());
    dir.is_dir().then_some(dir)
}

/// Last `n` lines of a capture file; empty if the file is missing.
pub fn read_tail(path: &Path, n: usize) -> Vec<String> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|s| s.to_string()).collect()
}
