use super::*;
use crate::config::{LauncherConfig, ProvisionSpec};
use crate::recorder::RunRecorder;
use std::path::PathBuf;
use tempfile::TempDir;

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn spec_with_provision(working_dir: &TempDir, prov: ProvisionSpec) -> crate::config::ServiceSpec {
    let yaml = format!(
        r#"
command: ["true"]
working_dir: {}
ports: [8000]
health_url: "http://127.0.0.1:{{port}}/"
"#,
        working_dir.path().display()
    );
    let mut spec: crate::config::ServiceSpec = serde_yaml::from_str(&yaml).unwrap();
    spec.provision = Some(prov);
    spec
}

fn provision_spec(env_dir: &str, create: &str, probe: Option<&str>, install: &str, verify: Option<&str>) -> ProvisionSpec {
    ProvisionSpec {
        env_dir: PathBuf::from(env_dir),
        create: sh(create),
        probe: probe.map(sh),
        install: sh(install),
        verify: verify.map(sh),
        runtime_version: None,
    }
}

async fn run(service_dir: &TempDir, prov: ProvisionSpec) -> crate::errors::Result<()> {
    let runs = TempDir::new().unwrap();
    let recorder = RunRecorder::begin(runs.path()).unwrap();
    let spec = spec_with_provision(service_dir, prov);
    ensure_ready("backend", &spec, service_dir.path(), &recorder).await
}

#[tokio::test]
async fn test_create_probe_install_verify_happy_path() {
    let dir = TempDir::new().unwrap();
    let prov = provision_spec(
        ".venv",
        "mkdir -p .venv && touch created",
        Some("test -f .deps"),
        "touch .deps installed",
        Some("test -f installed && touch verified"),
    );

    run(&dir, prov).await.unwrap();
    assert!(dir.path().join("created").exists());
    assert!(dir.path().join("installed").exists());
    assert!(dir.path().join("verified").exists());
}

#[tokio::test]
async fn test_successful_probe_skips_install() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join(".venv")).unwrap();
    let prov = provision_spec(
        ".venv",
        "false", // would fail if creation ran again
        Some("true"),
        "touch should_not_exist",
        None,
    );

    run(&dir, prov).await.unwrap();
    assert!(!dir.path().join("should_not_exist").exists());
}

#[tokio::test]
async fn test_runtime_mismatch_recreates_environment() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join(".venv")).unwrap();
    std::fs::write(dir.path().join(".venv/stale"), "old").unwrap();

    let mut prov = provision_spec(
        ".venv",
        "mkdir -p .venv && touch .venv/fresh",
        Some("true"),
        "true",
        None,
    );
    prov.runtime_version = Some(crate::config::RuntimeVersion {
        command: sh("echo Python 3.9.2"),
        expect: "3.11".to_string(),
    });

    run(&dir, prov).await.unwrap();
    assert!(!dir.path().join(".venv/stale").exists(), "stale env must be removed");
    assert!(dir.path().join(".venv/fresh").exists());
}

#[tokio::test]
async fn test_matching_runtime_keeps_environment() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join(".venv")).unwrap();
    std::fs::write(dir.path().join(".venv/keep"), "x").unwrap();

    let mut prov = provision_spec(".venv", "false", Some("true"), "true", None);
    prov.runtime_version = Some(crate::config::RuntimeVersion {
        command: sh("echo Python 3.11.6"),
        expect: "3.11".to_string(),
    });

    run(&dir, prov).await.unwrap();
    assert!(dir.path().join(".venv/keep").exists());
}

#[tokio::test]
async fn test_version_mismatch_install_retries_once_after_recreate() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join(".venv")).unwrap();
    // First install attempt reports a version mismatch, the retry (after the
    // env was recreated, which drops the flag file) succeeds
    let prov = provision_spec(
        ".venv",
        "mkdir -p .venv",
        Some("false"),
        "if test -f .venv/flag; then echo 'ERROR: package requires a different python' >&2; exit 1; else touch retried; fi",
        None,
    );
    std::fs::write(dir.path().join(".venv/flag"), "x").unwrap();

    run(&dir, prov).await.unwrap();
    assert!(dir.path().join("retried").exists());
}

#[tokio::test]
async fn test_plain_install_failure_is_fatal_without_retry() {
    let dir = TempDir::new().unwrap();
    let prov = provision_spec(
        ".venv",
        "mkdir -p .venv",
        None,
        "echo 'resolution impossible' >&2; exit 1",
        None,
    );

    let err = run(&dir, prov).await.unwrap_err();
    match err {
        crate::errors::LauncherError::DependencyInstallFailed { service, detail } => {
            assert_eq!(service, "backend");
            assert!(detail.contains("resolution impossible"));
        }
        other => panic!("expected DependencyInstallFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_verify_failure_reports_import_error_with_frame() {
    let dir = TempDir::new().unwrap();
    let prov = provision_spec(
        ".venv",
        "mkdir -p .venv",
        Some("true"),
        "true",
        Some(
            "printf 'Traceback (most recent call last):\\n  File \"app/foo.py\", line 42, in <module>\\nModuleNotFoundError: No module named x\\n' >&2; exit 1",
        ),
    );

    let err = run(&dir, prov).await.unwrap_err();
    match err {
        crate::errors::LauncherError::ImportError { frame, .. } => {
            assert_eq!(frame.as_deref(), Some("app/foo.py:42"));
        }
        other => panic!("expected ImportError, got {:?}", other),
    }
}

#[test]
fn test_first_local_frame_filters_runtime_frames() {
    let traceback = r#"Traceback (most recent call last):
  File "<string>", line 1, in <module>
  File "/usr/lib/python3.11/importlib/__init__.py", line 126, in import_module
  File "/srv/app/.venv/lib/python3.11/site-packages/fastapi/__init__.py", line 7, in <module>
  File "app/foo.py", line 42, in <module>
ImportError: cannot import name 'missing'
"#;
    assert_eq!(
        first_local_frame(traceback, Path::new("/srv/app/.venv")),
        Some("app/foo.py:42".to_string())
    );
}

#[test]
fn test_first_local_frame_node_style() {
    let stack = r#"Error: Cannot find module './config'
    at Function.Module._resolveFilename (node:internal/modules/cjs/loader:1145:15)
    at require (node:internal/modules/helpers:179:18)
    at Object.<anonymous> (src/server.js:12:20)
"#;
    assert_eq!(
        first_local_frame(stack, Path::new("/srv/app/node_modules")),
        Some("src/server.js:12".to_string())
    );
}

#[test]
fn test_first_local_frame_none_when_all_foreign() {
    let traceback = r#"  File "/usr/lib/python3.11/runpy.py", line 196, in _run_module_as_main"#;
    assert_eq!(first_local_frame(traceback, Path::new("/srv/app/.venv")), None);
}

#[test]
fn test_version_mismatch_signatures() {
    assert!(is_version_mismatch("ERROR: Package 'x' requires a different Python: 3.9.2 not in '>=3.11'"));
    assert!(is_version_mismatch("npm warn EBADENGINE Unsupported engine"));
    assert!(!is_version_mismatch("ERROR: No matching distribution found for leftpad"));
}
