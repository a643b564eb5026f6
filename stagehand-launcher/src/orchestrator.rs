//! Orchestration of a full bootstrap-and-supervise run
//!
//! Explicit lifecycle: `Booting -> Ready -> ShuttingDown -> Stopped`. The
//! interrupt handler only observes a signal; all cleanup goes through the
//! single `shutdown` routine. Service handles live in a map owned by this
//! instance, so multiple orchestrators can coexist in tests.
//!
//! Ordering: preflight strictly precedes provisioning and spawning; within a
//! service, provisioning precedes port negotiation and spawn. Across
//! services no ordering is guaranteed, but success requires every service
//! healthy.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::debug;

use crate::classify::{ClassifyContext, RootCauseReport, classify};
use crate::config::LauncherConfig;
use crate::doctor;
use crate::errors::{LauncherError, Result};
use crate::health;
use crate::markers::{self, PidMarker};
use crate::os::OsBackend;
use crate::ports;
use crate::process::{self, ProcessExitEvent, SpawnedService};
use crate::provision;
use crate::recorder::{
    CaptureStream, RunRecorder, RunStatus, RunSummary, STDERR_TAIL_LINES, ServiceSummary,
    read_tail,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Booting,
    Ready,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Pending,
    Healthy,
    Failed,
}

/// Runtime state for one running or reused service.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    pub service: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub reused: bool,
    /// Negotiation fell through every candidate; the bind may fail.
    pub exhausted: bool,
    pub health: HealthState,
    pub started_at: DateTime<Utc>,
}

pub struct Orchestrator {
    config: LauncherConfig,
    config_dir: PathBuf,
    os: Arc<dyn OsBackend>,
    client: reqwest::Client,
    recorder: Arc<RunRecorder>,
    handles: HashMap<String, ServiceHandle>,
    spawned: HashMap<String, SpawnedService>,
    exit_tx: mpsc::Sender<ProcessExitEvent>,
    exit_rx: mpsc::Receiver<ProcessExitEvent>,
    state: LaunchState,
    pids_dir: PathBuf,
}

impl Orchestrator {
    /// Create the run record eagerly, before any service work, so even a
    /// preflight-only failure leaves a diagnosable artifact.
    pub fn new(
        config: LauncherConfig,
        config_dir: &Path,
        os: Arc<dyn OsBackend>,
    ) -> Result<Self> {
        let recorder = Arc::new(RunRecorder::begin(&config.runs_root(config_dir))?);
        let pids_dir = config.pids_dir(config_dir);
        let (exit_tx, exit_rx) = mpsc::channel(16);

        Ok(Self {
            config,
            config_dir: config_dir.to_path_buf(),
            os,
            client: health::probe_client(),
            recorder,
            handles: HashMap::new(),
            spawned: HashMap::new(),
            exit_tx,
            exit_rx,
            state: LaunchState::Booting,
            pids_dir,
        })
    }

    pub fn state(&self) -> LaunchState {
        self.state
    }

    pub fn recorder(&self) -> &RunRecorder {
        &self.recorder
    }

    pub fn run_dir(&self) -> &Path {
        self.recorder.run_dir()
    }

    /// Handles in service-name order.
    pub fn handles(&self) -> Vec<&ServiceHandle> {
        let mut handles: Vec<&ServiceHandle> = self.handles.values().collect();
        handles.sort_by(|a, b| a.service.cmp(&b.service));
        handles
    }

    /// Preflight, provision, negotiate, spawn, and wait for every service to
    /// report healthy. On success the run summary is written and the caller
    /// may print endpoints before calling [`supervise`](Self::supervise).
    pub async fn bootstrap(&mut self) -> Result<()> {
        self.preflight()?;
        provision::ensure_toolchains(&self.config.toolchains, self.os.as_ref(), &self.recorder)
            .await?;
        self.provision_all().await?;
        self.negotiate_ports().await?;
        self.spawn_services().await?;
        self.await_all_healthy().await?;

        self.state = LaunchState::Ready;
        self.recorder.info(None, "all services ready");
        self.recorder.finish(&self.summary(RunStatus::Success, None))?;
        Ok(())
    }

    fn preflight(&self) -> Result<()> {
        self.recorder.info(None, "running preflight checks");
        let report = doctor::run_checks(&self.config, &self.config_dir, self.os.as_ref());
        self.recorder.write_doctor_log(&report.render())?;

        for finding in &report.findings {
            debug!(
                "[{}] {}: {}",
                finding.status.as_str(),
                finding.name,
                finding.details
            );
        }

        if let Some(failure) = report.first_failure() {
            self.recorder.record(
                crate::recorder::EventLevel::Error,
                None,
                &format!("preflight blocked: {} - {}", failure.name, failure.details),
                failure.fix.as_deref(),
            );
            if let Some(tool) = failure.name.strip_prefix("toolchain:") {
                return Err(LauncherError::EnvMissing {
                    tool: tool.to_string(),
                    detail: failure.details.clone(),
                });
            }
            return Err(LauncherError::Config(format!(
                "preflight failed: {} - {}",
                failure.name, failure.details
            )));
        }
        self.recorder.info(None, "preflight checks passed");
        Ok(())
    }

    /// Provision every service's environment concurrently. A failure in one
    /// service does not cancel the others; the first failure in service-name
    /// order is reported.
    async fn provision_all(&self) -> Result<()> {
        let mut set = JoinSet::new();
        for (service, spec) in &self.config.services {
            let service = service.clone();
            let spec = spec.clone();
            let config_dir = self.config_dir.clone();
            let recorder = Arc::clone(&self.recorder);
            set.spawn(async move {
                let result = provision::ensure_ready(&service, &spec, &config_dir, &recorder).await;
                (service, result)
            });
        }

        let mut failures: Vec<(String, LauncherError)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((service, Err(e))) => failures.push((service, e)),
                Err(e) => {
                    return Err(LauncherError::Internal(format!(
                        "provisioning task panicked: {}",
                        e
                    )));
                }
            }
        }

        failures.sort_by(|a, b| a.0.cmp(&b.0));
        match failures.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolve a port for each service in name order, never assigning the
    /// same port to two services in one run.
    async fn negotiate_ports(&mut self) -> Result<()> {
        let mut taken: HashSet<u16> = HashSet::new();
        for (service, spec) in &self.config.services {
            let resolved = ports::resolve_port(
                self.os.as_ref(),
                &self.client,
                service,
                spec,
                &taken,
                &self.recorder,
            )
            .await?;
            taken.insert(resolved.port);
            self.handles.insert(
                service.clone(),
                ServiceHandle {
                    service: service.clone(),
                    port: resolved.port,
                    pid: resolved.pid,
                    reused: resolved.reused,
                    exhausted: resolved.exhausted,
                    health: if resolved.reused {
                        // Reuse required a passed probe
                        HealthState::Healthy
                    } else {
                        HealthState::Pending
                    },
                    started_at: Utc::now(),
                },
            );
        }
        Ok(())
    }

    /// Spawn every non-reused service and persist its PID marker.
    async fn spawn_services(&mut self) -> Result<()> {
        let service_names: Vec<String> = self.config.services.keys().cloned().collect();
        for service in service_names {
            let handle = &self.handles[&service];
            if handle.reused {
                continue;
            }
            let port = handle.port;
            let spec = self.config.services[&service].clone();
            let spawned = process::spawn_service(
                &service,
                &spec,
                port,
                &self.config_dir,
                &self.recorder,
                self.exit_tx.clone(),
            )
            .await?;

            markers::write_marker(
                &self.pids_dir,
                &PidMarker {
                    service: service.clone(),
                    pid: spawned.pid,
                    started_at: self.os.process_start_time(spawned.pid),
                },
            )?;

            if let Some(handle) = self.handles.get_mut(&service) {
                handle.pid = Some(spawned.pid);
            }
            self.spawned.insert(service.clone(), spawned);
        }

        self.recorder.write_ports(&self.port_snapshot())?;
        Ok(())
    }

    /// Joint health gate: every spawned service must report healthy. A child
    /// that exits first short-circuits its health wait immediately instead of
    /// letting the timeout expire on a dead process.
    async fn await_all_healthy(&mut self) -> Result<()> {
        let mut pending: HashSet<String> = self.spawned.keys().cloned().collect();
        let mut set = JoinSet::new();

        for service in &pending {
            let handle = &self.handles[service];
            let spec = &self.config.services[service];
            let url = spec.health_url_for(handle.port);
            let timeout = spec.health_timeout;
            let client = self.client.clone();
            let recorder = Arc::clone(&self.recorder);
            let name = service.clone();
            set.spawn(async move {
                let healthy = health::wait_healthy(&client, &url, timeout, |attempt| {
                    recorder.info(
                        Some(&name),
                        &format!("still waiting for {} (attempt {})", url, attempt),
                    );
                })
                .await;
                (healthy, url)
            });
        }

        // Tag join results back to services through the url -> service map
        let url_to_service: HashMap<String, String> = pending
            .iter()
            .map(|s| {
                let handle = &self.handles[s];
                (self.config.services[s].health_url_for(handle.port), s.clone())
            })
            .collect();

        enum GateEvent {
            Health(bool, String),
            Exit(ProcessExitEvent),
        }

        while !pending.is_empty() {
            let exit_rx = &mut self.exit_rx;
            let event = tokio::select! {
                Some(joined) = set.join_next() => {
                    let (healthy, url) = joined.map_err(|e| {
                        LauncherError::Internal(format!("health wait task panicked: {}", e))
                    })?;
                    GateEvent::Health(healthy, url)
                }
                Some(exit) = exit_rx.recv() => GateEvent::Exit(exit),
            };

            match event {
                GateEvent::Health(healthy, url) => {
                    let Some(service) = url_to_service.get(&url).cloned() else {
                        continue;
                    };
                    if !pending.remove(&service) {
                        continue;
                    }
                    if healthy {
                        self.mark_health(&service, HealthState::Healthy);
                        self.recorder.info(Some(&service), "service is healthy");
                    } else {
                        // Still running but never ready: leave it up for
                        // inspection, fail the run
                        self.mark_health(&service, HealthState::Failed);
                        let timeout = self.config.services[&service].health_timeout;
                        return Err(LauncherError::HealthcheckTimeout {
                            service: service.clone(),
                            url,
                            timeout_secs: timeout.as_secs(),
                        });
                    }
                }
                GateEvent::Exit(exit) => {
                    if !pending.contains(&exit.service) {
                        continue;
                    }
                    self.mark_health(&exit.service, HealthState::Failed);
                    // Let the capture tasks reach EOF so the stderr tail is
                    // complete before we read it
                    if let Some(spawned) = self.spawned.remove(&exit.service) {
                        spawned.drain().await;
                    }
                    return Err(self.early_exit_error(&exit));
                }
            }
        }
        Ok(())
    }

    /// Build the fatal error for a service that died before reporting
    /// healthy. An exhausted negotiation or bind-failure output makes this a
    /// concrete PORT_BIND_FAILED instead of a generic early exit.
    fn early_exit_error(&self, exit: &ProcessExitEvent) -> LauncherError {
        let tail = read_tail(
            &self.recorder.capture_path(&exit.service, CaptureStream::Stderr),
            STDERR_TAIL_LINES,
        );
        let handle = &self.handles[&exit.service];
        let bind_failure = handle.exhausted
            || tail.iter().any(|l| {
                l.contains("EADDRINUSE")
                    || l.contains("Address already in use")
                    || l.contains("address already in use")
            });

        if bind_failure {
            LauncherError::PortBindFailed {
                service: exit.service.clone(),
                port: handle.port,
                stderr_tail: tail,
            }
        } else {
            LauncherError::ProcessExitedEarly {
                service: exit.service.clone(),
                exit_code: exit.exit_code,
                stderr_tail: tail,
            }
        }
    }

    fn mark_health(&mut self, service: &str, health: HealthState) {
        if let Some(handle) = self.handles.get_mut(service) {
            handle.health = health;
        }
    }

    /// Block until an interrupt or a service exit, then shut down.
    pub async fn supervise(&mut self) -> Result<()> {
        enum Wake {
            Interrupt(std::io::Result<()>),
            Exit(Option<ProcessExitEvent>),
        }

        let wake = {
            let exit_rx = &mut self.exit_rx;
            tokio::select! {
                result = tokio::signal::ctrl_c() => Wake::Interrupt(result),
                exit = exit_rx.recv() => Wake::Exit(exit),
            }
        };

        match wake {
            Wake::Interrupt(Err(e)) => Err(LauncherError::Internal(format!(
                "cannot listen for interrupts: {}",
                e
            ))),
            Wake::Interrupt(Ok(())) => {
                self.recorder.info(None, "interrupt received, shutting down");
                self.shutdown();
                Ok(())
            }
            Wake::Exit(Some(exit)) => {
                self.recorder.error(
                    Some(&exit.service),
                    &format!(
                        "service exited unexpectedly with {:?}, shutting down the stack",
                        exit.exit_code
                    ),
                );
                self.shutdown();
                Err(LauncherError::Internal(format!(
                    "service {} exited unexpectedly",
                    exit.service
                )))
            }
            Wake::Exit(None) => {
                // Channel cannot close while we hold a sender
                self.shutdown();
                Ok(())
            }
        }
    }

    /// The single cleanup routine. Idempotent and safe even when some
    /// services never fully started: only handles with a resolved PID are
    /// signalled, so a reused service whose PID lookup failed is left alone.
    pub fn shutdown(&mut self) {
        if matches!(self.state, LaunchState::ShuttingDown | LaunchState::Stopped) {
            return;
        }
        self.state = LaunchState::ShuttingDown;

        for handle in self.handles() {
            let Some(pid) = handle.pid else {
                debug!("No PID for {}, leaving it untouched", handle.service);
                continue;
            };
            if let Err(e) = self.os.terminate(pid) {
                self.recorder.warn(
                    Some(&handle.service),
                    &format!("could not stop pid {}: {}", pid, e),
                );
            } else {
                self.recorder
                    .info(Some(&handle.service), &format!("stopped pid {}", pid));
            }
        }

        for (service, spawned) in self.spawned.drain() {
            markers::remove_marker(&self.pids_dir, &service);
            spawned.detach();
        }

        self.state = LaunchState::Stopped;
        self.recorder.info(None, "shutdown complete");
    }

    /// Classify a fatal error, persist the root-cause artifact, and finish
    /// the run record as FAILED.
    pub fn handle_failure(&mut self, err: &LauncherError) -> RootCauseReport {
        let mut tails = BTreeMap::new();
        for service in self.config.services.keys() {
            let tail = read_tail(
                &self.recorder.capture_path(service, CaptureStream::Stderr),
                STDERR_TAIL_LINES,
            );
            if !tail.is_empty() {
                tails.insert(service.clone(), tail);
            }
        }

        let ctx = ClassifyContext {
            config: &self.config,
            config_dir: &self.config_dir,
            run_dir: self.recorder.run_dir(),
            stderr_tails: tails,
        };
        let report = classify(err, &ctx);

        self.recorder.record(
            crate::recorder::EventLevel::Error,
            None,
            &format!("{}: {}", report.category.as_str(), report.message),
            report.suggested_fix_steps.first().map(|s| s.as_str()),
        );
        if let Err(e) = self.recorder.write_root_cause(&report) {
            tracing::warn!("Could not write root cause artifact: {}", e);
        }
        if let Err(e) = self
            .recorder
            .finish(&self.summary(RunStatus::Failed, Some(report.message.clone())))
        {
            tracing::warn!("Could not finish run summary: {}", e);
        }
        report
    }

    /// Open a browser tab for every service configured to want one.
    pub fn open_browsers(&self) {
        for handle in self.handles() {
            let spec = &self.config.services[&handle.service];
            if spec.open_browser {
                let url = format!("http://127.0.0.1:{}/", handle.port);
                let _ = self.os.open_browser(&url);
            }
        }
    }

    fn port_snapshot(&self) -> BTreeMap<String, ServiceSummary> {
        self.handles
            .values()
            .map(|h| {
                (
                    h.service.clone(),
                    ServiceSummary {
                        port: h.port,
                        pid: h.pid,
                        reused: h.reused,
                    },
                )
            })
            .collect()
    }

    fn summary(&self, status: RunStatus, error: Option<String>) -> RunSummary {
        RunSummary {
            status,
            services: self.port_snapshot(),
            error,
            finished_at: Utc::now(),
        }
    }
}
