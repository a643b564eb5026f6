//! Preflight checks ("doctor")
//!
//! Read-only validation of the environment before any provisioning or
//! spawning: toolchain versions, source-control state, per-service
//! environment existence, known-bad dependency pins, port availability, and
//! expected config files. Checks run in that fixed canonical order so output
//! stays deterministic. A finding that downstream provisioning can remedy is
//! WARN; a finding with no remediation path is FAIL and blocks the run.

use std::fmt::Write as _;
use std::path::Path;

use crate::config::{LauncherConfig, ToolchainSpec};
use crate::os::OsBackend;

/// Known-bad dependency pins that break provisioning deep into a run when
/// they should fail at preflight. Exact-match against manifest lines.
const KNOWN_BAD_PINS: &[(&str, &str, &str)] = &[
    (
        "mediapipe==0.10.30",
        "this version was never published to PyPI and every install of it fails",
        "pin mediapipe==0.10.14 in the manifest",
    ),
    (
        "onnxruntime==1.16.0b1",
        "pre-release wheel was withdrawn; resolution fails on clean environments",
        "pin onnxruntime==1.16.3 in the manifest",
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Info,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Warn => "WARN",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Info => "INFO",
        }
    }
}

/// One independent check result.
#[derive(Debug, Clone)]
pub struct Finding {
    /// Stable name like `toolchain:python` or `ports:backend`.
    pub name: String,
    pub status: CheckStatus,
    pub details: String,
    pub fix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DoctorReport {
    pub findings: Vec<Finding>,
}

impl DoctorReport {
    /// Any FAIL finding blocks the run.
    pub fn blocking(&self) -> bool {
        self.findings
            .iter()
            .any(|f| f.status == CheckStatus::Fail)
    }

    pub fn first_failure(&self) -> Option<&Finding> {
        self.findings.iter().find(|f| f.status == CheckStatus::Fail)
    }

    /// Plain-text rendering for the `doctor.log` artifact.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for f in &self.findings {
            let _ = writeln!(out, "[{}] {}: {}", f.status.as_str(), f.name, f.details);
            if let Some(fix) = &f.fix {
                let _ = writeln!(out, "       fix: {}", fix);
            }
        }
        out
    }
}

/// Whether a toolchain's version command runs at all.
pub fn toolchain_present(os: &dyn OsBackend, tool: &ToolchainSpec) -> bool {
    os.capture_output(&tool.command, None)
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Extract the first dotted version number from command output.
pub fn extract_version(text: &str) -> Option<Vec<u32>> {
    for token in text.split_whitespace() {
        let cleaned: &str = token.trim_start_matches(|c: char| !c.is_ascii_digit());
        if cleaned.is_empty() {
            continue;
        }
        let parts: Vec<&str> = cleaned
            .split('.')
            .map(|p| p.trim_end_matches(|c: char| !c.is_ascii_digit()))
            .collect();
        if parts.len() >= 2 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())) {
            return Some(parts.iter().map(|p| p.parse().unwrap_or(0)).collect());
        }
    }
    None
}

/// Component-wise version comparison; missing components count as zero.
pub fn version_at_least(found: &[u32], min: &[u32]) -> bool {
    let len = found.len().max(min.len());
    for i in 0..len {
        let f = found.get(i).copied().unwrap_or(0);
        let m = min.get(i).copied().unwrap_or(0);
        if f != m {
            return f > m;
        }
    }
    true
}

/// Run all checks in canonical order. Read-only: files are read and ports
/// are probed with a plain TCP connect, nothing is written or installed.
pub fn run_checks(config: &LauncherConfig, config_dir: &Path, os: &dyn OsBackend) -> DoctorReport {
    let mut findings = Vec::new();

    check_toolchains(config, os, &mut findings);
    check_source_control(config_dir, os, &mut findings);
    check_service_envs(config, config_dir, &mut findings);
    check_dependency_pins(config, config_dir, &mut findings);
    check_ports(config, os, &mut findings);
    check_expected_files(config, config_dir, &mut findings);

    DoctorReport { findings }
}

fn check_toolchains(config: &LauncherConfig, os: &dyn OsBackend, findings: &mut Vec<Finding>) {
    for tool in &config.toolchains {
        let name = format!("toolchain:{}", tool.name);
        let output = os.capture_output(&tool.command, None);

        let Ok(output) = output else {
            // Missing runtime with an auto-install recipe is remediated by
            // provisioning, so it only warns
            let (status, details) = if tool.auto_install.is_some() {
                (
                    CheckStatus::Warn,
                    format!("{} not found; auto-install will be attempted", tool.command[0]),
                )
            } else {
                (
                    CheckStatus::Fail,
                    format!("{} is not runnable", tool.command[0]),
                )
            };
            findings.push(Finding {
                name,
                status,
                details,
                fix: tool.install_hint.clone(),
            });
            continue;
        };

        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let found = extract_version(&text);

        match (&tool.min_version, found) {
            (Some(min), Some(found_version)) => {
                let min_parts = extract_version(min).unwrap_or_default();
                if version_at_least(&found_version, &min_parts) {
                    findings.push(Finding {
                        name,
                        status: CheckStatus::Pass,
                        details: format!("{} ({})", tool.name, text.trim()),
                        fix: None,
                    });
                } else {
                    findings.push(Finding {
                        name,
                        status: CheckStatus::Fail,
                        details: format!(
                            "{} version {} is below the required {}",
                            tool.name,
                            found_version
                                .iter()
                                .map(|n| n.to_string())
                                .collect::<Vec<_>>()
                                .join("."),
                            min
                        ),
                        fix: tool.install_hint.clone(),
                    });
                }
            }
            _ => findings.push(Finding {
                name,
                status: CheckStatus::Pass,
                details: format!("{} ({})", tool.name, text.trim()),
                fix: None,
            }),
        }
    }
}

fn check_source_control(config_dir: &Path, os: &dyn OsBackend, findings: &mut Vec<Finding>) {
    let branch = os.capture_output(
        &to_args(&["git", "rev-parse", "--abbrev-ref", "HEAD"]),
        Some(config_dir),
    );
    let details = match branch {
        Ok(out) if out.status.success() => {
            let branch = String::from_utf8_lossy(&out.stdout).trim().to_string();
            let dirty = os
                .capture_output(&to_args(&["git", "status", "--porcelain"]), Some(config_dir))
                .map(|o| String::from_utf8_lossy(&o.stdout).lines().count())
                .unwrap_or(0);
            if dirty == 0 {
                format!("branch {}, working tree clean", branch)
            } else {
                format!("branch {}, {} uncommitted change(s)", branch, dirty)
            }
        }
        _ => "not a git repository".to_string(),
    };
    findings.push(Finding {
        name: "source-control".to_string(),
        status: CheckStatus::Info,
        details,
        fix: None,
    });
}

fn check_service_envs(config: &LauncherConfig, config_dir: &Path, findings: &mut Vec<Finding>) {
    for (service, spec) in &config.services {
        let Some(prov) = &spec.provision else {
            continue;
        };
        let working_dir = spec.resolved_working_dir(config_dir);
        let env_dir = prov.resolved_env_dir(&working_dir);
        let name = format!("env:{}", service);
        if env_dir.exists() {
            findings.push(Finding {
                name,
                status: CheckStatus::Pass,
                details: format!("{} exists", env_dir.display()),
                fix: None,
            });
        } else {
            // Provisioning creates it, so absence never blocks
            findings.push(Finding {
                name,
                status: CheckStatus::Warn,
                details: format!("{} missing; provisioning will create it", env_dir.display()),
                fix: None,
            });
        }
    }
}

fn check_dependency_pins(config: &LauncherConfig, config_dir: &Path, findings: &mut Vec<Finding>) {
    for (service, spec) in &config.services {
        let Some(manifest) = &spec.manifest else {
            continue;
        };
        let manifest_path = if manifest.is_absolute() {
            manifest.clone()
        } else {
            spec.resolved_working_dir(config_dir).join(manifest)
        };
        let name = format!("pins:{}", service);

        let Ok(contents) = std::fs::read_to_string(&manifest_path) else {
            findings.push(Finding {
                name,
                status: CheckStatus::Warn,
                details: format!("manifest {} not readable", manifest_path.display()),
                fix: None,
            });
            continue;
        };

        let mut hit = false;
        for line in contents.lines() {
            // Only the declaration itself counts, not a mention in a comment
            // or a longer version string sharing the pin as a prefix
            let declaration = line.split('#').next().unwrap_or("").trim();
            if declaration.is_empty() {
                continue;
            }
            for (pin, reason, fix) in known_bad_pins(config) {
                if declaration == pin {
                    hit = true;
                    findings.push(Finding {
                        name: name.clone(),
                        status: CheckStatus::Fail,
                        details: format!("known-bad pin {}: {}", pin, reason),
                        fix: Some(fix.clone()),
                    });
                }
            }
        }
        if !hit {
            findings.push(Finding {
                name,
                status: CheckStatus::Pass,
                details: format!("no known-bad pins in {}", manifest_path.display()),
                fix: None,
            });
        }
    }
}

fn known_bad_pins(config: &LauncherConfig) -> Vec<(String, String, String)> {
    let mut pins: Vec<(String, String, String)> = KNOWN_BAD_PINS
        .iter()
        .map(|(p, r, f)| (p.to_string(), r.to_string(), f.to_string()))
        .collect();
    pins.extend(
        config
            .known_bad_pins
            .iter()
            .map(|r| (r.dependency.clone(), r.reason.clone(), r.fix.clone())),
    );
    pins
}

fn check_ports(config: &LauncherConfig, os: &dyn OsBackend, findings: &mut Vec<Finding>) {
    for (service, spec) in &config.services {
        let name = format!("ports:{}", service);
        let free = spec.ports.iter().find(|&&p| !os.port_in_use(p));
        match free {
            Some(port) => findings.push(Finding {
                name,
                status: CheckStatus::Pass,
                details: format!("port {} available", port),
                fix: None,
            }),
            None => findings.push(Finding {
                // The negotiator may still reuse a healthy occupant
                name,
                status: CheckStatus::Warn,
                details: format!(
                    "all candidate ports {:?} are occupied; a healthy instance will be reused if found",
                    spec.ports
                ),
                fix: None,
            }),
        }
    }
}

fn check_expected_files(config: &LauncherConfig, config_dir: &Path, findings: &mut Vec<Finding>) {
    for expected in &config.expected_files {
        let path = if expected.path.is_absolute() {
            expected.path.clone()
        } else {
            config_dir.join(&expected.path)
        };
        let name = format!("file:{}", expected.path.display());
        if path.exists() {
            findings.push(Finding {
                name,
                status: CheckStatus::Pass,
                details: format!("{} present", path.display()),
                fix: None,
            });
        } else {
            findings.push(Finding {
                name,
                status: CheckStatus::Warn,
                details: format!("{} missing", path.display()),
                fix: expected.fix.clone(),
            });
        }
    }
}

fn to_args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
