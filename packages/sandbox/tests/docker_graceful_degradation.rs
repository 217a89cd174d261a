// ABOUTME: Tests for Docker runtime behaviour when the daemon is unreachable
// ABOUTME: Verifies failures surface as RuntimeUnavailable and nothing panics

use bollard::{Docker, API_DEFAULT_VERSION};
use boxcode_sandbox::{
    DockerRuntime, ExecutionPipeline, RuntimeClient, SandboxError, SandboxId, Session,
    SessionSpec,
};
use std::sync::Arc;

fn unreachable_runtime() -> DockerRuntime {
    // Nothing listens on port 1; building the client does not connect
    let client = Docker::connect_with_http("http://127.0.0.1:1", 2, API_DEFAULT_VERSION)
        .expect("http client construction does not connect");
    DockerRuntime::with_client(client)
}

/// Test that ping reports a missing daemon clearly
///
/// This test verifies:
/// 1. The error is classified as RuntimeUnavailable
/// 2. It counts as an infrastructure failure
/// 3. The user-facing message does not leak the daemon address
#[tokio::test]
async fn test_ping_without_daemon() {
    let err = unreachable_runtime().ping().await.unwrap_err();

    assert!(matches!(err, SandboxError::RuntimeUnavailable(_)), "{}", err);
    assert!(err.is_infrastructure());
    assert!(!err.user_message().contains("127.0.0.1"));
}

#[tokio::test]
async fn test_create_without_daemon() {
    let runtime: Arc<dyn RuntimeClient> = Arc::new(unreachable_runtime());
    let mut session = Session::new(runtime, SessionSpec::new("alpine", "latest", "/bin/sh"));

    assert!(matches!(
        session.resolve().await,
        Err(SandboxError::RuntimeUnavailable(_))
    ));
    assert!(session.id().is_none());
}

#[tokio::test]
async fn test_stop_without_daemon_is_not_swallowed() {
    let runtime = unreachable_runtime();

    // Only NotFound is treated as already stopped
    assert!(matches!(
        runtime.stop(&SandboxId::new("abc123")).await,
        Err(SandboxError::RuntimeUnavailable(_))
    ));
}

#[tokio::test]
async fn test_pipeline_without_daemon() {
    let pipeline = ExecutionPipeline::new(Arc::new(unreachable_runtime()));

    assert!(matches!(
        pipeline.run("python", "print(1)").await,
        Err(SandboxError::RuntimeUnavailable(_))
    ));
}

#[test]
fn test_connect_to_missing_socket() {
    let err = DockerRuntime::connect_unix("/nonexistent/boxcode/docker.sock")
        .err()
        .expect("missing socket must not connect");

    assert!(matches!(err, SandboxError::RuntimeUnavailable(_)), "{}", err);
    assert!(err.is_infrastructure());
}
