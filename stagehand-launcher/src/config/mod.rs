//! Configuration module for the stagehand launcher
//!
//! This module provides:
//! - `LauncherConfig` - Root configuration structure
//! - `ServiceSpec` - Per-service static description (ports, command, health URL)
//! - `ProvisionSpec` - Optional environment-provisioning step for a service
//! - `ToolchainSpec` - Preflight toolchain requirements

mod duration;

pub use duration::{deserialize_duration, format_duration, parse_duration};

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{LauncherError, Result};

/// Placeholder substituted with the resolved port in commands and URL templates.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Root configuration, loaded from `stagehand.yaml`.
///
/// Services are kept in a `BTreeMap` so that every pass over them (preflight,
/// negotiation, reporting) walks the same order and output stays deterministic.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LauncherConfig {
    /// Managed services, keyed by identifier.
    pub services: BTreeMap<String, ServiceSpec>,

    /// Toolchains validated by the doctor before any service work.
    #[serde(default)]
    pub toolchains: Vec<ToolchainSpec>,

    /// Extra known-bad dependency pins, merged with the built-in table.
    #[serde(default)]
    pub known_bad_pins: Vec<PinRule>,

    /// Files the doctor should expect to exist (e.g. a `.env`).
    #[serde(default)]
    pub expected_files: Vec<ExpectedFile>,

    /// State directory override; defaults to `.stagehand` next to the config file.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

/// Static description of one managed service. Immutable during a run.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    /// Start command; `{port}` in any argument is replaced with the resolved port.
    pub command: Vec<String>,

    /// Working directory, relative to the config file's directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Candidate TCP ports in order of preference.
    pub ports: Vec<u16>,

    /// Readiness URL template, e.g. `http://127.0.0.1:{port}/api/health`.
    pub health_url: String,

    /// Overall readiness deadline after spawn.
    #[serde(default = "default_health_timeout", deserialize_with = "deserialize_duration")]
    pub health_timeout: Duration,

    /// Extra environment variables for the spawned process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Dependency manifest scanned for known-bad pins (e.g. `requirements.txt`).
    #[serde(default)]
    pub manifest: Option<PathBuf>,

    #[serde(default)]
    pub provision: Option<ProvisionSpec>,

    /// Open `http://127.0.0.1:{port}/` in a browser once the stack is ready.
    #[serde(default)]
    pub open_browser: bool,
}

/// How to bring a service's isolated runtime environment into a usable state.
///
/// All commands run in the service's working directory. `probe` is a cheap
/// "are core dependencies resolvable" check that short-circuits `install`;
/// `verify` is a post-install load check that catches import-time errors
/// before the long-lived process is spawned.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionSpec {
    /// Isolated environment directory, relative to the working directory.
    pub env_dir: PathBuf,

    /// Command that creates the environment (e.g. `python3 -m venv .venv`).
    pub create: Vec<String>,

    /// Cheap dependency probe; success skips `install`.
    #[serde(default)]
    pub probe: Option<Vec<String>>,

    /// Full dependency install (e.g. `pip install -r requirements.txt`).
    pub install: Vec<String>,

    /// Post-install load verification (e.g. import the app's entry module).
    #[serde(default)]
    pub verify: Option<Vec<String>>,

    /// Expected runtime version inside the environment; a mismatch forces
    /// recreation rather than silently running on the wrong version.
    #[serde(default)]
    pub runtime_version: Option<RuntimeVersion>,
}

/// Runtime version probe for a provisioned environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeVersion {
    /// Version command run inside the working directory, e.g. `.venv/bin/python --version`.
    pub command: Vec<String>,
    /// Substring the version output must contain, e.g. "3.11".
    pub expect: String,
}

/// A toolchain requirement checked by the doctor.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolchainSpec {
    pub name: String,
    /// Version command, e.g. `["python3", "--version"]`.
    pub command: Vec<String>,
    /// Minimum acceptable version, compared component-wise.
    #[serde(default)]
    pub min_version: Option<String>,
    /// Manual install instruction shown when the tool is missing.
    #[serde(default)]
    pub install_hint: Option<String>,
    /// Auto-install command attempted at most once when the tool is missing.
    #[serde(default)]
    pub auto_install: Option<Vec<String>>,
}

/// A known-bad dependency pin with its remediation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PinRule {
    pub dependency: String,
    pub reason: String,
    pub fix: String,
}

/// A file whose absence the doctor should flag.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpectedFile {
    pub path: PathBuf,
    #[serde(default)]
    pub fix: Option<String>,
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(60)
}

impl LauncherConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LauncherError::ConfigNotFound(path.to_path_buf())
            } else {
                LauncherError::Io(e)
            }
        })?;
        let config = Self::parse(&contents, path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config contents, reporting the failing field path on error.
    pub fn parse(contents: &str, path: &Path) -> Result<Self> {
        let de = serde_yaml::Deserializer::from_str(contents);
        serde_path_to_error::deserialize(de).map_err(|e| LauncherError::ConfigParse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Validate structural invariants with specific messages.
    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(LauncherError::Config("No services defined".to_string()));
        }
        for (name, spec) in &self.services {
            if spec.command.is_empty() {
                return Err(LauncherError::Config(format!(
                    "Service {} has empty command",
                    name
                )));
            }
            if spec.ports.is_empty() {
                return Err(LauncherError::Config(format!(
                    "Service {} has no candidate ports",
                    name
                )));
            }
            if spec.ports.contains(&0) {
                return Err(LauncherError::Config(format!(
                    "Service {} lists port 0, which is not a valid candidate",
                    name
                )));
            }
            if spec.ports.len() > 1 && !spec.health_url.contains(PORT_PLACEHOLDER) {
                return Err(LauncherError::Config(format!(
                    "Service {} has multiple candidate ports but its health_url has no {} placeholder",
                    name, PORT_PLACEHOLDER
                )));
            }
            if let Some(prov) = &spec.provision {
                if prov.create.is_empty() || prov.install.is_empty() {
                    return Err(LauncherError::Config(format!(
                        "Service {} provision block needs non-empty create and install commands",
                        name
                    )));
                }
            }
        }
        for tool in &self.toolchains {
            if tool.command.is_empty() {
                return Err(LauncherError::Config(format!(
                    "Toolchain {} has empty version command",
                    tool.name
                )));
            }
        }
        Ok(())
    }

    /// State directory for this project (runs, PID markers).
    pub fn state_dir(&self, config_dir: &Path) -> PathBuf {
        match &self.state_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => config_dir.join(dir),
            None => config_dir.join(".stagehand"),
        }
    }

    /// Root directory holding one subdirectory per run.
    pub fn runs_root(&self, config_dir: &Path) -> PathBuf {
        self.state_dir(config_dir).join("runs")
    }

    /// Directory holding per-service PID marker files.
    pub fn pids_dir(&self, config_dir: &Path) -> PathBuf {
        self.state_dir(config_dir).join("pids")
    }
}

impl ServiceSpec {
    pub fn resolved_working_dir(&self, config_dir: &Path) -> PathBuf {
        match &self.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => config_dir.join(dir),
            None => config_dir.to_path_buf(),
        }
    }

    /// Readiness URL for a concrete port.
    pub fn health_url_for(&self, port: u16) -> String {
        self.health_url
            .replace(PORT_PLACEHOLDER, &port.to_string())
    }

    /// Start command with the resolved port substituted into every argument.
    pub fn command_for(&self, port: u16) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port.to_string()))
            .collect()
    }
}

impl ProvisionSpec {
    pub fn resolved_env_dir(&self, working_dir: &Path) -> PathBuf {
        if self.env_dir.is_absolute() {
            self.env_dir.clone()
        } else {
            working_dir.join(&self.env_dir)
        }
    }
}

#[cfg(test)]
mod tests;
