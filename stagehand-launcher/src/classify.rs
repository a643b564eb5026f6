//! Failure classification
//!
//! The classifier is a pure mapping from the structured [`LauncherError`]
//! variants to a category plus concrete fix steps; it never guesses a cause
//! the captured evidence cannot support. Substring matching against stderr is
//! kept only as a refinement for opaque external-process output (a crashed
//! child whose stderr mentions an address already in use, for example).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::LauncherConfig;
use crate::errors::LauncherError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    EnvMissing,
    DependencyInstallFailed,
    ImportError,
    ProcessExitedEarly,
    HealthcheckTimeout,
    PortBindFailed,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::EnvMissing => "ENV_MISSING",
            FailureCategory::DependencyInstallFailed => "DEPENDENCY_INSTALL_FAILED",
            FailureCategory::ImportError => "IMPORT_ERROR",
            FailureCategory::ProcessExitedEarly => "PROCESS_EXITED_EARLY",
            FailureCategory::HealthcheckTimeout => "HEALTHCHECK_TIMEOUT",
            FailureCategory::PortBindFailed => "PORT_BIND_FAILED",
            FailureCategory::Unknown => "UNKNOWN",
        }
    }
}

/// Structured diagnosis of a fatal failure, written to `error_root_cause.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCauseReport {
    pub category: FailureCategory,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_local_stack_frame: Option<String>,
    pub suggested_fix_steps: Vec<String>,
    /// Last lines of each relevant service's stderr capture.
    #[serde(default)]
    pub stderr_tails: BTreeMap<String, Vec<String>>,
}

/// Everything the classifier may consult besides the error itself.
pub struct ClassifyContext<'a> {
    pub config: &'a LauncherConfig,
    pub config_dir: &'a Path,
    pub run_dir: &'a Path,
    pub stderr_tails: BTreeMap<String, Vec<String>>,
}

pub fn classify(err: &LauncherError, ctx: &ClassifyContext<'_>) -> RootCauseReport {
    let message = err.to_string();
    let (category, service, frame) = match err {
        LauncherError::EnvMissing { tool, .. } => {
            (FailureCategory::EnvMissing, Some(tool.clone()), None)
        }
        LauncherError::DependencyInstallFailed { service, .. } => (
            FailureCategory::DependencyInstallFailed,
            Some(service.clone()),
            None,
        ),
        LauncherError::ImportError { service, frame, .. } => (
            FailureCategory::ImportError,
            Some(service.clone()),
            frame.clone(),
        ),
        LauncherError::ProcessExitedEarly { service, .. } => (
            FailureCategory::ProcessExitedEarly,
            Some(service.clone()),
            None,
        ),
        LauncherError::HealthcheckTimeout { service, .. } => (
            FailureCategory::HealthcheckTimeout,
            Some(service.clone()),
            None,
        ),
        LauncherError::PortBindFailed { service, .. } => {
            (FailureCategory::PortBindFailed, Some(service.clone()), None)
        }
        LauncherError::ProcessSpawn { service, .. } => {
            (FailureCategory::Unknown, Some(service.clone()), None)
        }
        _ => (FailureCategory::Unknown, None, None),
    };

    // Opaque child output can still sharpen two structured kinds
    let category = refine_with_stderr(category, service.as_deref(), &ctx.stderr_tails);

    RootCauseReport {
        category,
        message,
        timestamp: Utc::now(),
        first_local_stack_frame: frame,
        suggested_fix_steps: fix_steps(category, err, service.as_deref(), ctx),
        stderr_tails: ctx.stderr_tails.clone(),
    }
}

/// Refine a category using captured stderr text. Only ever sharpens
/// `ProcessExitedEarly` (crash output naming its own cause) or `Unknown`;
/// structured categories are never overridden.
fn refine_with_stderr(
    category: FailureCategory,
    service: Option<&str>,
    tails: &BTreeMap<String, Vec<String>>,
) -> FailureCategory {
    if category != FailureCategory::ProcessExitedEarly && category != FailureCategory::Unknown {
        return category;
    }
    let Some(service) = service else {
        return category;
    };
    let Some(tail) = tails.get(service) else {
        return category;
    };
    let text = tail.join("\n");

    if text.contains("EADDRINUSE")
        || text.contains("Address already in use")
        || text.contains("address already in use")
    {
        return FailureCategory::PortBindFailed;
    }
    if category == FailureCategory::Unknown
        && (text.contains("ImportError")
            || text.contains("ModuleNotFoundError")
            || text.contains("Cannot find module"))
    {
        return FailureCategory::ImportError;
    }
    category
}

/// Concrete, category-specific remediation steps. Exact commands where the
/// config gives us enough to build them.
fn fix_steps(
    category: FailureCategory,
    err: &LauncherError,
    service: Option<&str>,
    ctx: &ClassifyContext<'_>,
) -> Vec<String> {
    let spec = service.and_then(|s| ctx.config.services.get(s));
    let run_dir = ctx.run_dir.display();

    match category {
        FailureCategory::EnvMissing => {
            let tool = match err {
                LauncherError::EnvMissing { tool, .. } => tool.as_str(),
                _ => service.unwrap_or("the missing tool"),
            };
            let hint = ctx
                .config
                .toolchains
                .iter()
                .find(|t| t.name == tool)
                .and_then(|t| t.install_hint.clone())
                .unwrap_or_else(|| format!("install {} with your package manager", tool));
            vec![
                hint,
                "re-run `stagehand doctor` to confirm the toolchain".to_string(),
            ]
        }
        FailureCategory::DependencyInstallFailed => {
            let mut steps = Vec::new();
            if let Some(spec) = spec
                && let Some(prov) = &spec.provision
            {
                let working_dir = spec.resolved_working_dir(ctx.config_dir);
                steps.push(format!(
                    "remove {} and re-run `stagehand up` to recreate the environment",
                    prov.resolved_env_dir(&working_dir).display()
                ));
                steps.push(format!(
                    "run `{}` manually in {} to see the full installer output",
                    prov.install.join(" "),
                    working_dir.display()
                ));
            }
            steps.push(format!("inspect the install output under {}", run_dir));
            steps
        }
        FailureCategory::ImportError => {
            let mut steps = Vec::new();
            if let LauncherError::ImportError {
                frame: Some(frame), ..
            } = err
            {
                steps.push(format!("fix the import failure at {}", frame));
            }
            if let Some(spec) = spec
                && let Some(prov) = &spec.provision
                && let Some(verify) = &prov.verify
            {
                steps.push(format!(
                    "re-run `{}` in {} until it exits cleanly",
                    verify.join(" "),
                    spec.resolved_working_dir(ctx.config_dir).display()
                ));
            }
            steps
        }
        FailureCategory::ProcessExitedEarly => {
            let mut steps = Vec::new();
            if let Some(service) = service {
                steps.push(format!("inspect {}/{}.stderr.log", run_dir, service));
            }
            if let Some(spec) = spec {
                steps.push(format!(
                    "run `{}` manually in {} to reproduce the crash",
                    spec.command.join(" "),
                    spec.resolved_working_dir(ctx.config_dir).display()
                ));
            }
            steps
        }
        FailureCategory::HealthcheckTimeout => {
            let mut steps = Vec::new();
            if let LauncherError::HealthcheckTimeout { url, .. } = err {
                steps.push(format!(
                    "the process was left running for inspection; try {} in a browser",
                    url
                ));
            }
            if let Some(service) = service {
                steps.push(format!(
                    "watch {}/{}.stdout.log for slow startup output",
                    run_dir, service
                ));
            }
            steps.push("increase health_timeout for the service if startup is legitimately slow".to_string());
            steps
        }
        FailureCategory::PortBindFailed => {
            let mut steps = Vec::new();
            if let LauncherError::PortBindFailed { port, .. } = err {
                steps.push(format!(
                    "free the port: `lsof -ti :{} | xargs kill` (or stop the occupying app)",
                    port
                ));
            }
            if let Some(service) = service {
                steps.push(format!(
                    "add another candidate port for {} in stagehand.yaml",
                    service
                ));
            }
            steps
        }
        FailureCategory::Unknown => {
            vec![format!("inspect the run artifacts under {}", run_dir)]
        }
    }
}

#[cfg(test)]
mod tests;
