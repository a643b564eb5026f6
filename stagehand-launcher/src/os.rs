//! OS abstraction boundary
//!
//! Everything platform-specific the launcher needs funnels through
//! [`OsBackend`]: running short commands, checking port occupancy, resolving
//! the PID listening on a port, terminating a process, and opening a browser.
//! Keeping the surface small means one backend per OS instead of one script
//! dialect per OS, and lets tests substitute a scripted fake.

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::path::Path;
use std::process::{Command, Output};
use tracing::{debug, trace, warn};

use crate::errors::{LauncherError, Result};

pub trait OsBackend: Send + Sync {
    /// Run a short-lived command and capture its output.
    fn capture_output(&self, command: &[String], working_dir: Option<&Path>)
    -> std::io::Result<Output>;

    /// Whether something is already listening on the port (loopback).
    fn port_in_use(&self, port: u16) -> bool;

    /// Best-effort PID of the process listening on the port.
    fn pid_for_port(&self, port: u16) -> Option<u32>;

    /// Whether a process with this PID currently exists.
    fn process_alive(&self, pid: u32) -> bool;

    /// Unix start time of the process, for PID-reuse validation.
    fn process_start_time(&self, pid: u32) -> Option<i64>;

    /// Send a graceful termination signal.
    fn terminate(&self, pid: u32) -> Result<()>;

    /// Open a URL in the default browser.
    fn open_browser(&self, url: &str) -> Result<()>;
}

/// The real host backend.
pub struct HostOs;

impl OsBackend for HostOs {
    fn capture_output(
        &self,
        command: &[String],
        working_dir: Option<&Path>,
    ) -> std::io::Result<Output> {
        if command.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command",
            ));
        }
        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..]);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        cmd.output()
    }

    fn port_in_use(&self, port: u16) -> bool {
        // A failed loopback bind means some process (ours or foreign) holds
        // the port, including wildcard binds.
        TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_err()
    }

    #[cfg(unix)]
    fn pid_for_port(&self, port: u16) -> Option<u32> {
        let output = Command::new("lsof")
            .args(["-nP", &format!("-iTCP:{}", port), "-sTCP:LISTEN", "-t"])
            .output()
            .ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let pid = stdout.lines().next()?.trim().parse().ok();
        trace!("lsof resolved port {} to pid {:?}", port, pid);
        pid
    }

    #[cfg(windows)]
    fn pid_for_port(&self, port: u16) -> Option<u32> {
        let output = Command::new("netstat").args(["-ano", "-p", "TCP"]).output().ok()?;
        let needle = format!(":{}", port);
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if line.contains("LISTENING") && line.contains(&needle) {
                return line.split_whitespace().last()?.parse().ok();
            }
        }
        None
    }

    #[cfg(unix)]
    fn process_alive(&self, pid: u32) -> bool {
        // Signal 0 checks existence without sending anything
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }

    #[cfg(windows)]
    fn process_alive(&self, pid: u32) -> bool {
        self.process_start_time(pid).is_some()
    }

    fn process_start_time(&self, pid: u32) -> Option<i64> {
        use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

        let mut sys = System::new();
        let sysinfo_pid = Pid::from_u32(pid);
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sysinfo_pid]),
            false,
            ProcessRefreshKind::nothing(),
        );
        let process = sys.process(sysinfo_pid)?;
        Some(process.start_time() as i64)
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        debug!("Sending SIGTERM to pid {}", pid);
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| {
            LauncherError::ProcessKill {
                pid,
                source: std::io::Error::from_raw_os_error(e as i32),
            }
        })
    }

    #[cfg(windows)]
    fn terminate(&self, pid: u32) -> Result<()> {
        debug!("Terminating pid {} via taskkill", pid);
        let status = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T"])
            .status()
            .map_err(|e| LauncherError::ProcessKill { pid, source: e })?;
        if status.success() {
            Ok(())
        } else {
            Err(LauncherError::ProcessKill {
                pid,
                source: std::io::Error::other(format!("taskkill exited with {:?}", status.code())),
            })
        }
    }

    fn open_browser(&self, url: &str) -> Result<()> {
        #[cfg(target_os = "macos")]
        let command = ("open", vec![url.to_string()]);
        #[cfg(all(unix, not(target_os = "macos")))]
        let command = ("xdg-open", vec![url.to_string()]);
        #[cfg(windows)]
        let command = ("cmd", vec!["/C".to_string(), "start".to_string(), url.to_string()]);

        let result = Command::new(command.0).args(&command.1).spawn();
        if let Err(e) = result {
            warn!("Could not open browser for {}: {}", url, e);
        }
        Ok(())
    }
}

/// Validate that a recorded PID still refers to the process we remembered.
///
/// Checks existence first, then compares the recorded start time against the
/// live one with a 1-second tolerance to reject PID reuse.
pub fn validate_running_process(
    os: &dyn OsBackend,
    pid: u32,
    expected_start_time: Option<i64>,
) -> bool {
    if !os.process_alive(pid) {
        trace!("Process {} does not exist", pid);
        return false;
    }

    if let Some(expected_ts) = expected_start_time {
        let Some(actual) = os.process_start_time(pid) else {
            trace!("Cannot query start time for PID {}, rejecting", pid);
            return false;
        };
        let diff = (expected_ts - actual).abs();
        if diff > 1 {
            trace!(
                "Process {} start time mismatch: expected {}, got {} - likely PID reuse",
                pid, expected_ts, actual
            );
            return false;
        }
    }

    true
}
