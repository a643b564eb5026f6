//! Port negotiation tests against real loopback sockets

use std::collections::HashSet;
use stagehand_launcher::health::probe_client;
use stagehand_launcher::os::HostOs;
use stagehand_launcher::ports::resolve_port;
use stagehand_launcher::recorder::RunRecorder;
use stagehand_tests::{free_port, HttpStub, TestServiceBuilder};
use tempfile::TempDir;

fn test_recorder(temp: &TempDir) -> RunRecorder {
    RunRecorder::begin(&temp.path().join("runs")).unwrap()
}

/// A free first candidate is selected immediately, with no health probe
#[tokio::test]
async fn test_free_port_selected_without_probing() {
    let temp = TempDir::new().unwrap();
    let recorder = test_recorder(&temp);
    let client = probe_client();

    // Stub on a different port; the service's health URL points at it so any
    // probe would register a hit
    let stub = HttpStub::start(200).await.unwrap();
    let candidate = free_port();
    let spec = TestServiceBuilder::shell("sleep 3600")
        .with_ports(vec![candidate])
        .with_health_url(&stub.url("/health"))
        .build();

    let resolved = resolve_port(&HostOs, &client, "web", &spec, &HashSet::new(), &recorder)
        .await
        .unwrap();

    assert_eq!(resolved.port, candidate);
    assert!(!resolved.reused);
    assert!(!resolved.exhausted);
    assert_eq!(resolved.pid, None);
    assert_eq!(stub.hits(), 0, "free port must not be probed");
}

/// An occupied port whose occupant fails the probe is skipped for the next
/// free candidate
#[tokio::test]
async fn test_unhealthy_occupant_skipped() {
    let temp = TempDir::new().unwrap();
    let recorder = test_recorder(&temp);
    let client = probe_client();

    let stub = HttpStub::start(500).await.unwrap();
    let fallback = free_port();
    let spec = TestServiceBuilder::shell("sleep 3600")
        .with_ports(vec![stub.port(), fallback])
        .with_health_url("http://127.0.0.1:{port}/health")
        .build();

    let resolved = resolve_port(&HostOs, &client, "web", &spec, &HashSet::new(), &recorder)
        .await
        .unwrap();

    assert_eq!(resolved.port, fallback);
    assert!(!resolved.reused);
    assert!(stub.hits() >= 1, "occupied port must be probed before skipping");
}

/// An occupied port answering its health URL is reused instead of skipped
#[tokio::test]
async fn test_healthy_occupant_reused() {
    let temp = TempDir::new().unwrap();
    let recorder = test_recorder(&temp);
    let client = probe_client();

    let stub = HttpStub::start(200).await.unwrap();
    let spec = TestServiceBuilder::shell("sleep 3600")
        .with_ports(vec![stub.port(), free_port()])
        .with_health_url("http://127.0.0.1:{port}/health")
        .build();

    let resolved = resolve_port(&HostOs, &client, "web", &spec, &HashSet::new(), &recorder)
        .await
        .unwrap();

    assert_eq!(resolved.port, stub.port());
    assert!(resolved.reused);
    assert!(!resolved.exhausted);
}

/// When every candidate is occupied by a foreign process, negotiation hands
/// back the first candidate flagged as exhausted
#[tokio::test]
async fn test_exhausted_candidates_return_first() {
    let temp = TempDir::new().unwrap();
    let recorder = test_recorder(&temp);
    let client = probe_client();

    let first = HttpStub::start(404).await.unwrap();
    let second = HttpStub::start(404).await.unwrap();
    let spec = TestServiceBuilder::shell("sleep 3600")
        .with_ports(vec![first.port(), second.port()])
        .with_health_url("http://127.0.0.1:{port}/health")
        .build();

    let resolved = resolve_port(&HostOs, &client, "web", &spec, &HashSet::new(), &recorder)
        .await
        .unwrap();

    assert_eq!(resolved.port, first.port());
    assert!(!resolved.reused);
    assert!(resolved.exhausted);
}

/// The exhausted fallback also respects ports assigned to other services
/// this run: when the first candidate is taken, the fallback is the next one
#[tokio::test]
async fn test_exhausted_fallback_skips_taken_port() {
    let temp = TempDir::new().unwrap();
    let recorder = test_recorder(&temp);
    let client = probe_client();

    let first = HttpStub::start(404).await.unwrap();
    let second = HttpStub::start(404).await.unwrap();
    let spec = TestServiceBuilder::shell("sleep 3600")
        .with_ports(vec![first.port(), second.port()])
        .with_health_url("http://127.0.0.1:{port}/health")
        .build();

    let mut taken = HashSet::new();
    taken.insert(first.port());

    let resolved = resolve_port(&HostOs, &client, "api", &spec, &taken, &recorder)
        .await
        .unwrap();

    assert_eq!(
        resolved.port,
        second.port(),
        "fallback must not collide with a port assigned to another service"
    );
    assert!(!resolved.reused);
    assert!(resolved.exhausted);
}

/// A port already assigned to another service this run is never considered,
/// even when it is free on the host
#[tokio::test]
async fn test_taken_port_skipped() {
    let temp = TempDir::new().unwrap();
    let recorder = test_recorder(&temp);
    let client = probe_client();

    let shared = free_port();
    let fallback = free_port();
    let spec = TestServiceBuilder::shell("sleep 3600")
        .with_ports(vec![shared, fallback])
        .with_health_url("http://127.0.0.1:{port}/health")
        .build();

    let mut taken = HashSet::new();
    taken.insert(shared);

    let resolved = resolve_port(&HostOs, &client, "api", &spec, &taken, &recorder)
        .await
        .unwrap();

    assert_eq!(resolved.port, fallback);
    assert!(!resolved.reused);
    assert!(!resolved.exhausted);
}
