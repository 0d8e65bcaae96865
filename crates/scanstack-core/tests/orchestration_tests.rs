//! Orchestration runner tests against scripted compose output.

mod support;

use scanstack_core::orchestrate::{ComposeFrontend, ComposeRunner};
use scanstack_core::{SynthError, SynthSettings};
use support::FakeHost;
use tempfile::TempDir;

fn services(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn plugin_host() -> FakeHost {
    FakeHost::new().ok("docker compose version", "Docker Compose version v2.29.7")
}

// ============================================================================
// Happy path and front-end detection
// ============================================================================

#[tokio::test]
async fn test_whole_stack_starts_in_one_command() {
    let dir = TempDir::new().unwrap();
    let host = plugin_host().ok("up -d", "");
    let runner = ComposeRunner::new(&host, dir.path(), &SynthSettings::default());

    let outcome = runner.up(&services(&["scanner-map", "ollama"])).await.unwrap();
    assert_eq!(outcome.started, services(&["scanner-map", "ollama"]));
    assert!(!outcome.is_partial());
    assert_eq!(outcome.attempts.len(), 1);
    assert!(outcome.attempts[0].starts_with("docker compose -f "));
    assert!(outcome.attempts[0].contains("--project-directory"));
}

#[tokio::test]
async fn test_legacy_frontend_is_used_when_plugin_missing() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new().ok("docker-compose version", "docker-compose version 1.29.2");
    let runner = ComposeRunner::new(&host, dir.path(), &SynthSettings::default());
    assert_eq!(runner.detect_frontend().await.unwrap(), ComposeFrontend::Legacy);
}

#[tokio::test]
async fn test_no_compose_is_an_orchestration_error() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    let runner = ComposeRunner::new(&host, dir.path(), &SynthSettings::default());
    let err = runner.up(&services(&["scanner-map"])).await.unwrap_err();
    assert!(matches!(err, SynthError::Orchestration(_)));
}

// ============================================================================
// Narrowed retries
// ============================================================================

/// A port conflict yields a partial success naming exactly what started
#[tokio::test]
async fn test_port_conflict_reports_partial_success() {
    let dir = TempDir::new().unwrap();
    let host = plugin_host()
        .fail(
            "up -d",
            "Error response from daemon: driver failed programming external connectivity on endpoint scanner-map: Bind for 0.0.0.0:3001 failed: port is already allocated",
        )
        .ok("ps --services --filter status=running", "ollama\n")
        .ok("up -d --no-deps trunk-recorder", "")
        .fail(
            "up -d --no-deps scanner-map",
            "Bind for 0.0.0.0:3001 failed: port is already allocated",
        );
    let runner = ComposeRunner::new(&host, dir.path(), &SynthSettings::default());

    let outcome = runner
        .up(&services(&["scanner-map", "ollama", "trunk-recorder"]))
        .await
        .unwrap();
    assert_eq!(outcome.started, services(&["trunk-recorder"]));
    assert_eq!(outcome.already_running, services(&["ollama"]));
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].service, "scanner-map");
    assert!(outcome.failed[0].reason.contains("port is already allocated"));
    assert!(outcome.warnings()[0].starts_with("scanner-map did not start"));

    // Dependencies are started before the application
    let calls = host.calls();
    let recorder = calls.iter().position(|c| c.ends_with("--no-deps trunk-recorder"));
    let app = calls.iter().position(|c| c.ends_with("--no-deps scanner-map"));
    assert!(recorder.unwrap() < app.unwrap());
}

/// A missing image defers only the affected service
#[tokio::test]
async fn test_missing_image_defers_service_and_starts_the_rest() {
    let dir = TempDir::new().unwrap();
    let host = plugin_host()
        .fail(
            "up -d",
            "unable to prepare context: path \"/srv/scanner/op25\" not found",
        )
        .ok("up -d --no-deps ollama scanner-map", "");
    let runner = ComposeRunner::new(&host, dir.path(), &SynthSettings::default());

    let outcome = runner
        .up(&services(&["scanner-map", "ollama", "op25"]))
        .await
        .unwrap();
    assert_eq!(outcome.started, services(&["ollama", "scanner-map"]));
    assert_eq!(outcome.deferred.len(), 1);
    let deferred = &outcome.deferred[0];
    assert_eq!(deferred.service, "op25");
    assert_eq!(deferred.manual_step, "docker compose build op25 && docker compose up -d op25");
    assert!(outcome.is_partial());
    assert!(outcome.failed.is_empty());
}

/// A missing pulled dependency must not be dragged back in by depends_on
#[tokio::test]
async fn test_missing_pulled_dependency_is_not_restarted_through_depends_on() {
    let dir = TempDir::new().unwrap();
    let host = plugin_host()
        .fail(
            "up -d",
            "Error response from daemon: pull access denied for ollama/ollama, repository does not exist or may require 'docker login'",
        )
        .ok("up -d --no-deps trunk-recorder scanner-map", "");
    let runner = ComposeRunner::new(&host, dir.path(), &SynthSettings::default());

    let outcome = runner
        .up(&services(&["scanner-map", "ollama", "trunk-recorder"]))
        .await
        .unwrap();
    assert_eq!(outcome.started, services(&["trunk-recorder", "scanner-map"]));
    assert_eq!(outcome.deferred.len(), 1);
    assert_eq!(outcome.deferred[0].service, "ollama");
    assert_eq!(
        outcome.deferred[0].manual_step,
        "docker compose pull ollama && docker compose up -d ollama"
    );
    assert!(outcome.failed.is_empty());

    let retry = outcome.attempts.last().unwrap();
    let (_, targets) = retry.rsplit_once(" up -d ").unwrap();
    assert_eq!(targets, "--no-deps trunk-recorder scanner-map");
}

/// Nothing started at all is fatal and carries the tool output
#[tokio::test]
async fn test_nothing_started_is_fatal_with_diagnostics() {
    let dir = TempDir::new().unwrap();
    let host = plugin_host().fail("up -d", "Cannot connect to the Docker daemon at unix:///var/run/docker.sock");
    let runner = ComposeRunner::new(&host, dir.path(), &SynthSettings::default());

    let err = runner.up(&services(&["scanner-map"])).await.unwrap_err();
    match &err {
        SynthError::Fatal { diagnostics, .. } => {
            assert!(diagnostics.contains("Cannot connect to the Docker daemon"));
        }
        other => panic!("expected fatal error, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 70);
}

#[tokio::test]
async fn test_down_runs_compose_down() {
    let dir = TempDir::new().unwrap();
    let host = plugin_host().ok(" down", "");
    let runner = ComposeRunner::new(&host, dir.path(), &SynthSettings::default());
    let attempts = runner.down().await.unwrap();
    assert!(attempts[0].ends_with(" down"));
}
