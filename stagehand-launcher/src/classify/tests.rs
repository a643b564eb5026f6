use super::*;
use crate::config::LauncherConfig;
use std::path::Path;

const CONFIG: &str = r#"
services:
  backend:
    command: [".venv/bin/uvicorn", "app.main:app", "--port", "{port}"]
    working_dir: backend
    ports: [8000, 8001]
    health_url: "http://127.0.0.1:{port}/api/health"
    provision:
      env_dir: .venv
      create: ["python3", "-m", "venv", ".venv"]
      install: [".venv/bin/pip", "install", "-r", "requirements.txt"]
      verify: [".venv/bin/python", "-c", "import app.main"]
"#;

fn ctx_with_tail<'a>(
    config: &'a LauncherConfig,
    run_dir: &'a Path,
    tails: BTreeMap<String, Vec<String>>,
) -> ClassifyContext<'a> {
    ClassifyContext {
        config,
        config_dir: Path::new("/srv/app"),
        run_dir,
        stderr_tails: tails,
    }
}

fn config() -> LauncherConfig {
    LauncherConfig::parse(CONFIG, Path::new("stagehand.yaml")).unwrap()
}

#[test]
fn test_import_error_carries_frame() {
    let config = config();
    let err = LauncherError::ImportError {
        service: "backend".to_string(),
        detail: "ModuleNotFoundError: No module named 'torch'".to_string(),
        frame: Some("app/foo.py:42".to_string()),
    };
    let report = classify(&err, &ctx_with_tail(&config, Path::new("/runs/r1"), BTreeMap::new()));

    assert_eq!(report.category, FailureCategory::ImportError);
    assert_eq!(report.first_local_stack_frame.as_deref(), Some("app/foo.py:42"));
    assert!(
        report
            .suggested_fix_steps
            .iter()
            .any(|s| s.contains("app/foo.py:42")),
        "{:?}",
        report.suggested_fix_steps
    );
}

#[test]
fn test_exited_early_maps_to_its_category() {
    let config = config();
    let err = LauncherError::ProcessExitedEarly {
        service: "backend".to_string(),
        exit_code: Some(3),
        stderr_tail: vec!["boom".to_string()],
    };
    let report = classify(&err, &ctx_with_tail(&config, Path::new("/runs/r1"), BTreeMap::new()));

    assert_eq!(report.category, FailureCategory::ProcessExitedEarly);
    // Fix steps name the capture file and the exact command
    assert!(report.suggested_fix_steps.iter().any(|s| s.contains("backend.stderr.log")));
    assert!(report.suggested_fix_steps.iter().any(|s| s.contains("uvicorn")));
}

#[test]
fn test_addr_in_use_stderr_refines_early_exit_to_bind_failure() {
    let config = config();
    let mut tails = BTreeMap::new();
    tails.insert(
        "backend".to_string(),
        vec!["OSError: [Errno 98] Address already in use".to_string()],
    );
    let err = LauncherError::ProcessExitedEarly {
        service: "backend".to_string(),
        exit_code: Some(1),
        stderr_tail: vec![],
    };
    let report = classify(&err, &ctx_with_tail(&config, Path::new("/runs/r1"), tails));

    assert_eq!(report.category, FailureCategory::PortBindFailed);
}

#[test]
fn test_structured_categories_are_never_overridden_by_stderr() {
    let config = config();
    let mut tails = BTreeMap::new();
    tails.insert(
        "backend".to_string(),
        vec!["ImportError: cannot import name 'foo'".to_string()],
    );
    let err = LauncherError::HealthcheckTimeout {
        service: "backend".to_string(),
        url: "http://127.0.0.1:8000/api/health".to_string(),
        timeout_secs: 60,
    };
    let report = classify(&err, &ctx_with_tail(&config, Path::new("/runs/r1"), tails));

    assert_eq!(report.category, FailureCategory::HealthcheckTimeout);
    assert!(report.suggested_fix_steps.iter().any(|s| s.contains("left running")));
}

#[test]
fn test_unknown_points_at_run_dir() {
    let config = config();
    let err = LauncherError::Internal("something odd".to_string());
    let report = classify(&err, &ctx_with_tail(&config, Path::new("/runs/r7"), BTreeMap::new()));

    assert_eq!(report.category, FailureCategory::Unknown);
    assert!(report.suggested_fix_steps.iter().any(|s| s.contains("/runs/r7")));
}

#[test]
fn test_env_missing_uses_configured_install_hint() {
    let yaml = r#"
services:
  backend:
    command: ["true"]
    ports: [8000]
    health_url: "http://127.0.0.1:{port}/"
toolchains:
  - name: python
    command: ["python3", "--version"]
    install_hint: "install python 3.11 from python.org"
"#;
    let config = LauncherConfig::parse(yaml, Path::new("x.yaml")).unwrap();
    let err = LauncherError::EnvMissing {
        tool: "python".to_string(),
        detail: "python3 is not runnable".to_string(),
    };
    let report = classify(&err, &ctx_with_tail(&config, Path::new("/runs/r1"), BTreeMap::new()));

    assert_eq!(report.category, FailureCategory::EnvMissing);
    assert_eq!(report.suggested_fix_steps[0], "install python 3.11 from python.org");
}

#[test]
fn test_report_round_trips_through_json() {
    let config = config();
    let err = LauncherError::PortBindFailed {
        service: "backend".to_string(),
        port: 8000,
        stderr_tail: vec![],
    };
    let report = classify(&err, &ctx_with_tail(&config, Path::new("/runs/r1"), BTreeMap::new()));

    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"PORT_BIND_FAILED\""));
    let back: RootCauseReport = serde_json::from_str(&json).unwrap();
    assert_eq!(back.category, FailureCategory::PortBindFailed);
}
