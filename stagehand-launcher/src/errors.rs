use std::path::PathBuf;
use thiserror::Error;

/// Format a YAML error for user-friendly display, including the field path
fn format_yaml_error(e: &serde_path_to_error::Error<serde_yaml::Error>) -> String {
    let path = e.path().to_string();
    let inner = e.inner();
    let msg = inner.to_string();

    let located = if let Some(loc) = inner.location() {
        format!("Line {}, Column {}: {}", loc.line(), loc.column(), msg)
    } else {
        msg
    };

    if path.is_empty() {
        located
    } else {
        format!("{}: {}", path, located)
    }
}

fn format_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {}", c),
        None => "a signal".to_string(),
    }
}

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse config file '{path}':\n  {}", format_yaml_error(.source))]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_path_to_error::Error<serde_yaml::Error>,
    },

    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Required tool not available: {tool} ({detail})")]
    EnvMissing { tool: String, detail: String },

    #[error("Dependency install failed for service {service}: {detail}")]
    DependencyInstallFailed { service: String, detail: String },

    #[error("Import verification failed for service {service}: {detail}")]
    ImportError {
        service: String,
        detail: String,
        /// First stack frame pointing at application code, e.g. "app/main.py:12"
        frame: Option<String>,
    },

    #[error("Service {service} exited with {} before becoming healthy", format_exit_code(.exit_code))]
    ProcessExitedEarly {
        service: String,
        exit_code: Option<i32>,
        stderr_tail: Vec<String>,
    },

    #[error("Service {service} never became healthy at {url} within {timeout_secs}s")]
    HealthcheckTimeout {
        service: String,
        url: String,
        timeout_secs: u64,
    },

    #[error("Service {service} could not bind port {port}")]
    PortBindFailed {
        service: String,
        port: u16,
        stderr_tail: Vec<String>,
    },

    #[error("Failed to spawn process for service {service}: {source}")]
    ProcessSpawn {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process {pid}: {source}")]
    ProcessKill {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, LauncherError>;
