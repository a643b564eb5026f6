//! Port negotiation
//!
//! For each service, pick a usable port from its ordered candidates. A free
//! port is taken immediately with no probing. An occupied port is reused only
//! if the occupant passes a bounded health probe on that service's readiness
//! URL; anything else is treated as a foreign occupant and skipped. Reuse
//! keeps repeated invocations from killing a developer's already-running
//! service, while the probe requirement keeps stale occupants out.

use std::collections::HashSet;
use tracing::debug;

use crate::config::ServiceSpec;
use crate::errors::Result;
use crate::health::{self, PROBE_TIMEOUT};
use crate::os::OsBackend;
use crate::recorder::RunRecorder;

/// Outcome of negotiation for one service.
#[derive(Debug, Clone)]
pub struct ResolvedPort {
    pub port: u16,
    /// Occupying PID when reusing, if it could be resolved.
    pub pid: Option<u32>,
    pub reused: bool,
    /// All candidates were occupied by foreign processes; `port` is the
    /// first candidate and the spawn attempt may fail to bind it.
    pub exhausted: bool,
}

/// Resolve a port for `service`, skipping any port already assigned to
/// another service this run (`taken`).
pub async fn resolve_port(
    os: &dyn OsBackend,
    client: &reqwest::Client,
    service: &str,
    spec: &ServiceSpec,
    taken: &HashSet<u16>,
    recorder: &RunRecorder,
) -> Result<ResolvedPort> {
    for &port in &spec.ports {
        if taken.contains(&port) {
            debug!("Port {} already assigned to another service, skipping", port);
            continue;
        }

        if !os.port_in_use(port) {
            recorder.info(Some(service), &format!("port {} is free, selecting it", port));
            return Ok(ResolvedPort {
                port,
                pid: None,
                reused: false,
                exhausted: false,
            });
        }

        // Best-effort PID resolve; failure only limits later stop() capability
        let pid = os.pid_for_port(port);
        let url = spec.health_url_for(port);
        if health::probe_once(client, &url, PROBE_TIMEOUT).await {
            recorder.info(
                Some(service),
                &format!(
                    "port {} already serves a healthy instance (pid {}), reusing it",
                    port,
                    pid.map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string())
                ),
            );
            return Ok(ResolvedPort {
                port,
                pid,
                reused: true,
                exhausted: false,
            });
        }

        recorder.warn(
            Some(service),
            &format!(
                "port {} is occupied by a foreign process, trying next candidate",
                port
            ),
        );
    }

    // Exhausted: hand back the first candidate not already assigned this run
    // and let the spawn surface a concrete bind failure instead of guessing
    // here. Ports in `taken` stay off limits even as a fallback.
    let fallback = spec
        .ports
        .iter()
        .find(|p| !taken.contains(p))
        .copied()
        .unwrap_or(spec.ports[0]);
    recorder.warn(
        Some(service),
        &format!(
            "all candidate ports are occupied; will attempt to bind {} anyway",
            fallback
        ),
    );
    Ok(ResolvedPort {
        port: fallback,
        pid: None,
        reused: false,
        exhausted: true,
    })
}
