// ABOUTME: Integration tests for the interactive path: manager, console and I/O bridge together
// ABOUTME: Runs against the in-memory runtime so no Docker daemon is needed

use boxcode_sandbox::bridge::decode_chunk;
use boxcode_sandbox::runtime::fake::FakeRuntime;
use boxcode_sandbox::{
    Console, ConsoleOptions, DeleteOutcome, Frame, IoBridge, MemoryRegistry, OwnerId,
    RuntimeClient, SandboxError, SandboxSettings, SessionManager, SessionSpec,
};
use futures::channel::mpsc;
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;

fn setup() -> (Arc<FakeRuntime>, SessionManager) {
    let runtime = Arc::new(FakeRuntime::new());
    let settings = SandboxSettings::default();
    let registry = Arc::new(MemoryRegistry::new(settings.allowed_images.clone()));
    let manager = SessionManager::new(runtime.clone(), registry, &settings);
    (runtime, manager)
}

fn shell() -> SessionSpec {
    SessionSpec::new("ubuntu", "22.04", "/bin/bash")
}

/// Full interactive round trip
///
/// This test verifies:
/// 1. A created session can be started and attached through a console
/// 2. Input frames reach the process and its output comes back base64 encoded
/// 3. Closing the transport stops the sandbox
/// 4. Deleting the session afterwards removes the sandbox
#[tokio::test]
async fn test_shell_round_trip_and_cleanup() {
    let (runtime, manager) = setup();
    let owner = OwnerId::new("ada");

    let session = manager.create_session(&owner, shell()).await.unwrap();
    let id = session.id().unwrap().clone();
    let console = Console::open(session, IoBridge::default()).await.unwrap();

    let (in_tx, in_rx) = mpsc::unbounded::<Result<Frame, Infallible>>();
    let (out_tx, mut out_rx) = mpsc::unbounded::<Frame>();
    let run = tokio::spawn(console.run(in_rx, out_tx, ConsoleOptions::default()));

    in_tx
        .unbounded_send(Ok(Frame::Text("echo hi\n".to_string())))
        .unwrap();

    let mut echoed = Vec::new();
    while !String::from_utf8_lossy(&echoed).contains("hi") {
        match out_rx.next().await {
            Some(Frame::Text(text)) => echoed.extend(decode_chunk(&text).unwrap()),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    in_tx.unbounded_send(Ok(Frame::Close)).unwrap();
    let exit = run.await.unwrap().unwrap();
    assert!(exit.transport_closed);
    assert!(!runtime.inspect(&id).await.unwrap().running);

    assert_eq!(
        manager.delete_session(&owner, id.as_str()).await.unwrap(),
        DeleteOutcome::Removed
    );
    assert!(!runtime.exists(&id));
}

#[tokio::test]
async fn test_quota_ceiling_of_eight() {
    let (runtime, manager) = setup();
    let owner = OwnerId::new("ada");

    for _ in 0..8 {
        manager.create_session(&owner, shell()).await.unwrap();
    }
    let err = manager.create_session(&owner, shell()).await.unwrap_err();

    assert!(matches!(err, SandboxError::QuotaExceeded { limit: 8, .. }));
    assert_eq!(runtime.create_calls(), 8);

    // Other owners are unaffected
    manager
        .create_session(&OwnerId::new("grace"), shell())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_stops_are_idempotent() {
    let (runtime, manager) = setup();
    let owner = OwnerId::new("ada");

    let mut session = manager.create_session(&owner, shell()).await.unwrap();
    session.start().await.unwrap();
    let id = session.id().unwrap().clone();

    // Transport close and normal completion racing each other
    let (first, second) = tokio::join!(runtime.stop(&id), manager.stop_all(&owner));
    first.unwrap();
    assert_eq!(second.unwrap(), 1);

    session.stop().await.unwrap();
    assert!(!runtime.inspect(&id).await.unwrap().running);
    assert!(runtime.stop_calls(&id) >= 2);
}

#[tokio::test]
async fn test_reattach_with_replay() {
    let (runtime, manager) = setup();
    let owner = OwnerId::new("ada");

    let session = manager.create_session(&owner, shell()).await.unwrap();
    let id = session.id().unwrap().clone();
    drop(session);

    let reopened = manager.open_session(&owner, id.as_str()).await.unwrap();
    let console = Console::open(reopened, IoBridge::new(4)).await.unwrap();

    let (in_tx, in_rx) = mpsc::unbounded::<Result<Frame, Infallible>>();
    let (out_tx, mut out_rx) = mpsc::unbounded::<Frame>();
    let options = ConsoleOptions {
        replay_output: true,
        ..Default::default()
    };
    let run = tokio::spawn(console.run(in_rx, out_tx, options));

    in_tx
        .unbounded_send(Ok(Frame::Binary(b"abcdefghij".to_vec())))
        .unwrap();

    let mut echoed = Vec::new();
    while echoed.len() < 10 {
        let Some(Frame::Text(text)) = out_rx.next().await else {
            panic!("output ended early");
        };
        let chunk = decode_chunk(&text).unwrap();
        // Chunks never exceed the configured size
        assert!(chunk.len() <= 4);
        echoed.extend(chunk);
    }
    assert_eq!(echoed, b"abcdefghij");

    drop(in_tx);
    run.await.unwrap().unwrap();
    assert_eq!(runtime.create_calls(), 1);
}
