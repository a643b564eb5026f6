//! Process supervision
//!
//! Spawns managed service processes with the resolved port injected, captures
//! stdout/stderr line-by-line into per-service files under the run directory,
//! and reports process exit through a channel so the orchestrator can
//! short-circuit a health wait the moment a child dies.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServiceSpec;
use crate::errors::{LauncherError, Result};
use crate::recorder::{CaptureStream, RunRecorder};

/// Sent when a spawned service's process exits, voluntarily or not.
#[derive(Debug)]
pub struct ProcessExitEvent {
    pub service: String,
    pub exit_code: Option<i32>,
}

/// A service process this invocation spawned and owns.
pub struct SpawnedService {
    pub service: String,
    pub pid: u32,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
    waiter: JoinHandle<()>,
}

impl SpawnedService {
    /// Drop the monitoring tasks without touching the process itself.
    pub fn detach(self) {
        self.waiter.abort();
        self.stdout_task.abort();
        self.stderr_task.abort();
    }

    /// Wait for the capture tasks to reach EOF so the capture files are
    /// complete. Only sensible once the process has exited.
    pub async fn drain(self) {
        self.waiter.abort();
        let _ = self.stdout_task.await;
        let _ = self.stderr_task.await;
    }
}

/// Spawn a capture task that appends each line of `stream` to `path`.
fn spawn_capture_task(
    stream: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    path: std::path::PathBuf,
    service: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(stream) = stream else { return };
        let mut file = match File::create(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("Cannot open capture file {} for {}: {}", path.display(), service, e);
                return;
            }
        };
        let reader = BufReader::new(stream);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if writeln!(file, "{}", line).is_err() {
                break;
            }
        }
        let _ = file.flush();
    })
}

/// Spawn a managed service on the resolved port.
///
/// The port replaces `{port}` in every argument and is also exported as
/// `PORT`. The PID is recorded immediately; exit is observed by a waiter task
/// that sends a [`ProcessExitEvent`] on `exit_tx`.
pub async fn spawn_service(
    service: &str,
    spec: &ServiceSpec,
    port: u16,
    config_dir: &Path,
    recorder: &RunRecorder,
    exit_tx: mpsc::Sender<ProcessExitEvent>,
) -> Result<SpawnedService> {
    let command = spec.command_for(port);
    let working_dir = spec.resolved_working_dir(config_dir);

    if !working_dir.exists() {
        return Err(LauncherError::Config(format!(
            "Working directory '{}' for service {} does not exist",
            working_dir.display(),
            service
        )));
    }

    info!(
        "Starting service {}: {} {:?}",
        service,
        &command[0],
        &command[1..]
    );

    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..])
        .current_dir(&working_dir)
        .env("PORT", port.to_string())
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Own process group so the terminal's interrupt stays with the launcher;
    // stop signals the leader pid and lets it wind down its own children
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| LauncherError::ProcessSpawn {
        service: service.to_string(),
        source: e,
    })?;

    let pid = child.id().ok_or_else(|| {
        LauncherError::Internal(format!("spawned {} but no PID is available", service))
    })?;
    debug!("Service {} spawned with PID {}", service, pid);

    let stdout_task = spawn_capture_task(
        child.stdout.take(),
        recorder.capture_path(service, CaptureStream::Stdout),
        service.to_string(),
    );
    let stderr_task = spawn_capture_task(
        child.stderr.take(),
        recorder.capture_path(service, CaptureStream::Stderr),
        service.to_string(),
    );

    let service_name = service.to_string();
    let waiter = tokio::spawn(async move {
        let exit_code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("Failed to wait on {}: {}", service_name, e);
                None
            }
        };
        debug!("Service {} exited with {:?}", service_name, exit_code);
        let _ = exit_tx
            .send(ProcessExitEvent {
                service: service_name,
                exit_code,
            })
            .await;
    });

    Ok(SpawnedService {
        service: service.to_string(),
        pid,
        stdout_task,
        stderr_task,
        waiter,
    })
}
