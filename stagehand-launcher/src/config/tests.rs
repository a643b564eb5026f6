use super::*;
use std::time::Duration;

const SAMPLE: &str = r#"
services:
  backend:
    command: [".venv/bin/uvicorn", "app.main:app", "--port", "{port}"]
    working_dir: backend
    ports: [8000, 8001, 8010]
    health_url: "http://127.0.0.1:{port}/api/health"
    health_timeout: 90s
    manifest: requirements.txt
    provision:
      env_dir: .venv
      create: ["python3", "-m", "venv", ".venv"]
      probe: [".venv/bin/python", "-c", "import fastapi"]
      install: [".venv/bin/pip", "install", "-r", "requirements.txt"]
      verify: [".venv/bin/python", "-c", "import app.main"]
      runtime_version:
        command: [".venv/bin/python", "--version"]
        expect: "3.11"
  frontend:
    command: ["npm", "run", "dev", "--", "--port", "{port}"]
    working_dir: frontend
    ports: [5173, 5174]
    health_url: "http://127.0.0.1:{port}/"
    open_browser: true
toolchains:
  - name: python
    command: ["python3", "--version"]
    min_version: "3.10"
    install_hint: "install python 3.10+ via your package manager"
expected_files:
  - path: backend/.env
    fix: "copy backend/.env.example to backend/.env"
"#;

fn parse_sample() -> LauncherConfig {
    LauncherConfig::parse(SAMPLE, Path::new("stagehand.yaml")).unwrap()
}

#[test]
fn test_parse_sample_config() {
    let config = parse_sample();
    config.validate().unwrap();

    assert_eq!(config.services.len(), 2);
    let backend = &config.services["backend"];
    assert_eq!(backend.ports, vec![8000, 8001, 8010]);
    assert_eq!(backend.health_timeout, Duration::from_secs(90));
    assert!(backend.provision.is_some());

    let frontend = &config.services["frontend"];
    assert_eq!(frontend.health_timeout, Duration::from_secs(60)); // default
    assert!(frontend.open_browser);
}

#[test]
fn test_services_iterate_in_sorted_order() {
    let config = parse_sample();
    let names: Vec<&str> = config.services.keys().map(|s| s.as_str()).collect();
    assert_eq!(names, vec!["backend", "frontend"]);
}

#[test]
fn test_port_substitution() {
    let config = parse_sample();
    let backend = &config.services["backend"];
    assert_eq!(
        backend.health_url_for(8001),
        "http://127.0.0.1:8001/api/health"
    );
    let cmd = backend.command_for(8001);
    assert_eq!(cmd[3], "8001");
    // Template itself is untouched
    assert_eq!(backend.command[3], "{port}");
}

#[test]
fn test_empty_command_rejected() {
    let yaml = r#"
services:
  backend:
    command: []
    ports: [8000]
    health_url: "http://127.0.0.1:8000/api/health"
"#;
    let config = LauncherConfig::parse(yaml, Path::new("x.yaml")).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("empty command"), "{}", err);
}

#[test]
fn test_empty_ports_rejected() {
    let yaml = r#"
services:
  backend:
    command: ["true"]
    ports: []
    health_url: "http://127.0.0.1:8000/api/health"
"#;
    let config = LauncherConfig::parse(yaml, Path::new("x.yaml")).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("no candidate ports"), "{}", err);
}

#[test]
fn test_multi_port_requires_placeholder_in_health_url() {
    let yaml = r#"
services:
  backend:
    command: ["true"]
    ports: [8000, 8001]
    health_url: "http://127.0.0.1:8000/api/health"
"#;
    let config = LauncherConfig::parse(yaml, Path::new("x.yaml")).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_unknown_field_reports_path() {
    let yaml = r#"
services:
  backend:
    command: ["true"]
    ports: [8000]
    health_url: "http://127.0.0.1:{port}/"
    healthcheck_url: "typo"
"#;
    let err = LauncherConfig::parse(yaml, Path::new("x.yaml")).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("backend"), "{}", msg);
}

#[test]
fn test_parse_duration_units() {
    assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
    assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
    assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
    assert!(parse_duration("").is_err());
    assert!(parse_duration("10y").is_err());
}

#[test]
fn test_format_duration_round_trip() {
    assert_eq!(format_duration(&Duration::from_secs(90)), "90s");
    assert_eq!(format_duration(&Duration::from_secs(120)), "2m");
    assert_eq!(format_duration(&Duration::from_millis(250)), "250ms");
}

#[test]
fn test_state_dir_defaults_next_to_config() {
    let config = parse_sample();
    let dir = config.state_dir(Path::new("/srv/app"));
    assert_eq!(dir, PathBuf::from("/srv/app/.stagehand"));
    assert_eq!(
        config.runs_root(Path::new("/srv/app")),
        PathBuf::from("/srv/app/.stagehand/runs")
    );
}
