//! Environment provisioning
//!
//! Idempotent, re-entrant preparation of each service's isolated runtime
//! environment: create it (or recreate it on a runtime version mismatch),
//! probe whether core dependencies are already resolvable before paying for a
//! full install, and run an optional load verification so import-time errors
//! fail the run here instead of deep inside a spawned process.

use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::config::{ServiceSpec, ToolchainSpec};
use crate::doctor::toolchain_present;
use crate::errors::{LauncherError, Result};
use crate::os::OsBackend;
use crate::recorder::RunRecorder;

/// Lines of command output kept in error details.
const OUTPUT_TAIL_LINES: usize = 10;

struct StepOutput {
    success: bool,
    text: String,
}

/// Run one provisioning step, capturing combined stdout and stderr.
/// A command that cannot even be spawned counts as a failed step.
async fn run_step(command: &[String], working_dir: &Path) -> StepOutput {
    debug!("Provision step: {:?} in {}", command, working_dir.display());
    let result = Command::new(&command[0])
        .args(&command[1..])
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .output()
        .await;

    match result {
        Ok(output) => {
            let mut text = String::from_utf8_lossy(&output.stdout).to_string();
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            StepOutput {
                success: output.status.success(),
                text,
            }
        }
        Err(e) => StepOutput {
            success: false,
            text: format!("failed to run {}: {}", command[0], e),
        },
    }
}

fn output_tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[start..].join("\n")
}

/// Ensure every required toolchain is runnable, attempting each configured
/// auto-install recipe at most once. The doctor has already downgraded
/// missing-but-installable tools to WARN; this is where the install happens.
pub async fn ensure_toolchains(
    toolchains: &[ToolchainSpec],
    os: &dyn OsBackend,
    recorder: &RunRecorder,
) -> Result<()> {
    for tool in toolchains {
        if toolchain_present(os, tool) {
            continue;
        }
        let Some(auto_install) = &tool.auto_install else {
            return Err(LauncherError::EnvMissing {
                tool: tool.name.clone(),
                detail: format!("`{}` is not runnable", tool.command[0]),
            });
        };

        recorder.warn(
            None,
            &format!("{} missing, attempting auto-install: {}", tool.name, auto_install.join(" ")),
        );
        let out = run_step(auto_install, Path::new(".")).await;
        if !out.success || !toolchain_present(os, tool) {
            return Err(LauncherError::EnvMissing {
                tool: tool.name.clone(),
                detail: format!("auto-install failed: {}", output_tail(&out.text)),
            });
        }
        recorder.info(None, &format!("{} installed", tool.name));
    }
    Ok(())
}

/// Bring a service's environment into the state its spawn command expects.
/// Safe to call every run; cheap when everything is already in place.
pub async fn ensure_ready(
    service: &str,
    spec: &ServiceSpec,
    config_dir: &Path,
    recorder: &RunRecorder,
) -> Result<()> {
    let Some(prov) = &spec.provision else {
        return Ok(());
    };
    let working_dir = spec.resolved_working_dir(config_dir);
    let env_dir = prov.resolved_env_dir(&working_dir);

    // (a) environment exists, on the expected runtime version
    let mut recreated = false;
    if env_dir.exists() {
        if let Some(rv) = &prov.runtime_version {
            let out = run_step(&rv.command, &working_dir).await;
            if !out.success || !out.text.contains(&rv.expect) {
                recorder.warn(
                    Some(service),
                    &format!(
                        "environment runtime is not {} as expected, recreating {}",
                        rv.expect,
                        env_dir.display()
                    ),
                );
                recreate_env(service, prov, &env_dir, &working_dir, recorder).await?;
                recreated = true;
            }
        }
    } else {
        recorder.info(
            Some(service),
            &format!("creating environment {}", env_dir.display()),
        );
        let out = run_step(&prov.create, &working_dir).await;
        if !out.success {
            return Err(LauncherError::EnvMissing {
                tool: prov.create[0].clone(),
                detail: output_tail(&out.text),
            });
        }
    }

    // (b) cheap resolvability probe before a full install
    let needs_install = match &prov.probe {
        Some(probe) => !run_step(probe, &working_dir).await.success,
        None => true,
    };

    if needs_install {
        recorder.info(Some(service), "installing dependencies");
        let out = run_step(&prov.install, &working_dir).await;
        if !out.success {
            if !recreated && is_version_mismatch(&out.text) {
                // One retry after forcing recreation; a second failure is fatal
                recorder.warn(
                    Some(service),
                    "install failed with a runtime version mismatch, recreating environment and retrying once",
                );
                recreate_env(service, prov, &env_dir, &working_dir, recorder).await?;
                let retry = run_step(&prov.install, &working_dir).await;
                if !retry.success {
                    return Err(LauncherError::DependencyInstallFailed {
                        service: service.to_string(),
                        detail: output_tail(&retry.text),
                    });
                }
            } else {
                return Err(LauncherError::DependencyInstallFailed {
                    service: service.to_string(),
                    detail: output_tail(&out.text),
                });
            }
        }
    } else {
        debug!("{} dependencies already resolvable, skipping install", service);
    }

    // (c) load verification catches import-time errors before spawn
    if let Some(verify) = &prov.verify {
        let out = run_step(verify, &working_dir).await;
        if !out.success {
            let frame = first_local_frame(&out.text, &env_dir);
            return Err(LauncherError::ImportError {
                service: service.to_string(),
                detail: output_tail(&out.text),
                frame,
            });
        }
        debug!("{} load verification passed", service);
    }

    Ok(())
}

async fn recreate_env(
    service: &str,
    prov: &crate::config::ProvisionSpec,
    env_dir: &Path,
    working_dir: &Path,
    _recorder: &RunRecorder,
) -> Result<()> {
    if env_dir.exists() {
        std::fs::remove_dir_all(env_dir)?;
    }
    let out = run_step(&prov.create, working_dir).await;
    if !out.success {
        return Err(LauncherError::DependencyInstallFailed {
            service: service.to_string(),
            detail: format!("environment recreation failed: {}", output_tail(&out.text)),
        });
    }
    Ok(())
}

/// Whether installer output indicates a runtime version mismatch (the one
/// failure shape worth an environment-recreate retry).
pub fn is_version_mismatch(text: &str) -> bool {
    const SIGNATURES: &[&str] = &[
        "Requires-Python",
        "requires a different python",
        "python_requires",
        "Unsupported engine",
        "EBADENGINE",
        "incompatible with the current python version",
    ];
    let lower = text.to_lowercase();
    SIGNATURES.iter().any(|s| lower.contains(&s.to_lowercase()))
}

/// First stack frame in `text` that belongs to application code, rendered as
/// `path:line`. Frames from the isolated environment, installed packages, and
/// the runtime itself are filtered out.
pub fn first_local_frame(text: &str, env_dir: &Path) -> Option<String> {
    let env_name = env_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let is_foreign = |path: &str| {
        path.contains("site-packages")
            || path.contains("node_modules")
            || path.starts_with("node:")
            || path.starts_with("/usr/")
            || path.starts_with("/lib/")
            || path.starts_with('<')
            || (!env_name.is_empty() && path.contains(&env_name))
    };

    for line in text.lines() {
        let trimmed = line.trim_start();

        // Python: File "app/foo.py", line 42, in <module>
        if let Some(rest) = trimmed.strip_prefix("File \"")
            && let Some(quote_end) = rest.find('"')
        {
            let path = &rest[..quote_end];
            if is_foreign(path) {
                continue;
            }
            let after = &rest[quote_end + 1..];
            if let Some(line_part) = after.strip_prefix(", line ") {
                let digits: String = line_part.chars().take_while(|c| c.is_ascii_digit()).collect();
                if !digits.is_empty() {
                    return Some(format!("{}:{}", path, digits));
                }
            }
        }

        // Node: at something (src/app.js:42:10)  /  at src/app.js:42:10
        if let Some(rest) = trimmed.strip_prefix("at ") {
            let location = rest
                .rfind('(')
                .map(|i| rest[i + 1..].trim_end_matches(')'))
                .unwrap_or(rest);
            let mut parts = location.rsplitn(3, ':');
            let _col = parts.next();
            let line_no = parts.next();
            let path = parts.next();
            if let (Some(path), Some(line_no)) = (path, line_no)
                && !is_foreign(path)
                && line_no.chars().all(|c| c.is_ascii_digit())
                && !line_no.is_empty()
            {
                return Some(format!("{}:{}", path, line_no));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests;
