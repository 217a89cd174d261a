// ABOUTME: Session lifecycle state machine over a single sandbox
// ABOUTME: Handles resolve/reconnect, start, attach, resize, idempotent stop and final removal

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError};
use crate::runtime::{
    AttachedStream, LogStream, RuntimeClient, SandboxId, SandboxSpec, SandboxStatus, TerminalSize,
};

/// Prefixes whose remainder is handed to the shell as a single script argument
const SHELL_PREFIXES: &[&str] = &["/bin/sh -c", "/bin/bash -c", "sh -c", "bash -c"];

/// Split an entry command into an argument vector.
///
/// `/bin/sh -c echo a b` becomes `["/bin/sh", "-c", "echo a b"]`; anything
/// else is split on whitespace.
pub fn tokenize_command(command: &str) -> Result<Vec<String>> {
    let command = command.trim();
    if command.is_empty() {
        return Err(SandboxError::InvalidSpec("command is empty".to_string()));
    }

    for prefix in SHELL_PREFIXES {
        let Some(rest) = command.strip_prefix(prefix) else {
            continue;
        };
        // `/bin/sh -cx` is not the shell prefix
        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            continue;
        }
        let script = rest.trim_start();
        if script.is_empty() {
            return Err(SandboxError::InvalidSpec(format!(
                "'{}' needs a script to run",
                command
            )));
        }
        let (shell, flag) = prefix.split_once(' ').unwrap_or((prefix, "-c"));
        return Ok(vec![shell.to_string(), flag.to_string(), script.to_string()]);
    }

    Ok(command.split_whitespace().map(String::from).collect())
}

/// Desired configuration of a session's sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSpec {
    pub image: String,
    pub tag: String,
    pub command: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub auto_remove: bool,
    #[serde(default)]
    pub network_enabled: bool,
    #[serde(default = "default_attach_io")]
    pub attach_io: bool,
}

fn default_attach_io() -> bool {
    true
}

impl SessionSpec {
    /// Network disabled, no auto removal, I/O attachable
    pub fn new(
        image: impl Into<String>,
        tag: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            image: image.into(),
            tag: tag.into(),
            command: command.into(),
            name: None,
            auto_remove: false,
            network_enabled: false,
            attach_io: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_network(mut self, enabled: bool) -> Self {
        self.network_enabled = enabled;
        self
    }

    pub fn with_auto_remove(mut self, enabled: bool) -> Self {
        self.auto_remove = enabled;
        self
    }

    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }

    /// Validate and tokenize into the runtime's creation request
    pub fn to_sandbox_spec(&self) -> Result<SandboxSpec> {
        if self.image.trim().is_empty() {
            return Err(SandboxError::InvalidSpec("image is required".to_string()));
        }
        if self.tag.trim().is_empty() {
            return Err(SandboxError::InvalidSpec("tag is required".to_string()));
        }
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(SandboxError::InvalidSpec(
                    "name must not be blank".to_string(),
                ));
            }
        }

        Ok(SandboxSpec {
            image_ref: self.image_ref(),
            argv: tokenize_command(&self.command)?,
            name: self.name.clone(),
            auto_remove: self.auto_remove,
            network_enabled: self.network_enabled,
            attach_io: self.attach_io,
            labels: HashMap::new(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No sandbox yet. `reuse` carries a caller-supplied id to reconnect to.
    Unresolved { reuse: Option<SandboxId> },
    Created(SandboxId),
    Running(SandboxId),
    Stopped(SandboxId),
    /// Terminal
    Removed(SandboxId),
}

impl SessionState {
    pub fn id(&self) -> Option<&SandboxId> {
        match self {
            SessionState::Unresolved { .. } => None,
            SessionState::Created(id)
            | SessionState::Running(id)
            | SessionState::Stopped(id)
            | SessionState::Removed(id) => Some(id),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            SessionState::Unresolved { .. } => "unresolved",
            SessionState::Created(_) => "created",
            SessionState::Running(_) => "running",
            SessionState::Stopped(_) => "stopped",
            SessionState::Removed(_) => "removed",
        }
    }
}

/// Handle to one sandbox plus its desired configuration and lifecycle state.
///
/// A session is owned by whoever drives it; the runtime client is shared.
pub struct Session {
    runtime: Arc<dyn RuntimeClient>,
    spec: SessionSpec,
    state: SessionState,
    attached: bool,
}

impl Session {
    pub fn new(runtime: Arc<dyn RuntimeClient>, spec: SessionSpec) -> Self {
        Self {
            runtime,
            spec,
            state: SessionState::Unresolved { reuse: None },
            attached: false,
        }
    }

    /// A session that resolves by reconnecting to `id` instead of creating
    pub fn reconnect(runtime: Arc<dyn RuntimeClient>, spec: SessionSpec, id: SandboxId) -> Self {
        Self {
            runtime,
            spec,
            state: SessionState::Unresolved { reuse: Some(id) },
            attached: false,
        }
    }

    pub fn spec(&self) -> &SessionSpec {
        &self.spec
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn id(&self) -> Option<&SandboxId> {
        self.state.id()
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeClient> {
        &self.runtime
    }

    /// Id of a resolved, not yet removed session
    fn live_id(&self, op: &str) -> Result<SandboxId> {
        match &self.state {
            SessionState::Unresolved { .. } => Err(SandboxError::InvalidState(format!(
                "cannot {} an unresolved session",
                op
            ))),
            SessionState::Removed(id) => Err(SandboxError::InvalidState(format!(
                "cannot {} removed session {}",
                op, id
            ))),
            other => other
                .id()
                .cloned()
                .ok_or_else(|| SandboxError::InvalidState(op.to_string())),
        }
    }

    /// Bind the session to a sandbox, creating one unless a reuse id resolves.
    /// Resolving an already resolved session returns its id.
    pub async fn resolve(&mut self) -> Result<SandboxId> {
        let reuse = match &self.state {
            SessionState::Unresolved { reuse } => reuse.clone(),
            SessionState::Removed(id) => {
                return Err(SandboxError::InvalidState(format!(
                    "session {} was removed",
                    id
                )))
            }
            resolved => return resolved.id().cloned().ok_or_else(|| {
                SandboxError::InvalidState("resolved session without id".to_string())
            }),
        };

        let id = match reuse {
            Some(id) => {
                let status = self.runtime.inspect(&id).await?;
                debug!("Reconnected to sandbox {} (running: {})", id, status.running);
                self.state = if status.running {
                    SessionState::Running(id.clone())
                } else {
                    SessionState::Created(id.clone())
                };
                id
            }
            None => {
                let sandbox_spec = self.spec.to_sandbox_spec()?;
                let id = self.runtime.create(&sandbox_spec).await?;
                info!("Created sandbox {} from {}", id, sandbox_spec.image_ref);
                self.state = SessionState::Created(id.clone());
                id
            }
        };

        Ok(id)
    }

    /// Start the sandbox. On `NotFound` the state is left as it was.
    pub async fn start(&mut self) -> Result<()> {
        let id = self.live_id("start")?;
        if matches!(self.state, SessionState::Running(_)) {
            return Ok(());
        }

        self.runtime.start(&id).await?;
        self.state = SessionState::Running(id);
        Ok(())
    }

    pub async fn inspect(&self) -> Result<SandboxStatus> {
        let id = self.live_id("inspect")?;
        self.runtime.inspect(&id).await
    }

    /// Open the duplex stream to the primary process
    pub async fn attach(&mut self, replay_output: bool) -> Result<AttachedStream> {
        let id = self.live_id("attach")?;
        if !matches!(self.state, SessionState::Running(_)) {
            return Err(SandboxError::NotRunning(id.to_string()));
        }

        let stream = self.runtime.attach(&id, replay_output).await?;
        self.attached = true;
        Ok(stream)
    }

    /// Fire-and-forget terminal resize; failures are logged, never returned
    pub async fn resize(&self, size: TerminalSize) {
        let Some(id) = self.id() else {
            debug!("Ignoring resize of an unresolved session");
            return;
        };
        if let Err(e) = self.runtime.resize(id, size).await {
            warn!(
                "Failed to resize sandbox {} to {}x{}: {}",
                id, size.cols, size.rows, e
            );
        }
    }

    /// Legacy create-then-exec invocation
    pub async fn exec(&self, argv: Vec<String>) -> Result<()> {
        let id = self.live_id("exec in")?;
        self.runtime.exec(&id, argv).await
    }

    pub async fn copy_archive(&self, dest_path: &str, archive: Vec<u8>) -> Result<()> {
        let id = self.live_id("copy into")?;
        self.runtime.copy_archive(&id, dest_path, archive).await
    }

    pub async fn logs(&self, follow: bool) -> Result<LogStream> {
        let id = self.live_id("read logs of")?;
        self.runtime.logs(&id, follow).await
    }

    pub async fn wait(&self) -> Result<i64> {
        let id = self.live_id("wait on")?;
        self.runtime.wait(&id).await
    }

    /// Stop the sandbox. Repeated stops, and stops of an auto-removed sandbox
    /// that is already gone, succeed.
    pub async fn stop(&mut self) -> Result<()> {
        let id = match &self.state {
            SessionState::Unresolved { .. } => return Ok(()),
            SessionState::Stopped(_) | SessionState::Removed(_) => return Ok(()),
            other => other
                .id()
                .cloned()
                .ok_or_else(|| SandboxError::InvalidState("stop".to_string()))?,
        };

        match stop_sandbox(self.runtime.as_ref(), &id).await {
            Ok(()) => {
                self.state = SessionState::Stopped(id);
                self.attached = false;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove the sandbox. Final: the session cannot be used afterwards.
    pub async fn remove(&mut self, force: bool) -> Result<()> {
        let id = match &self.state {
            SessionState::Unresolved { .. } => {
                return Err(SandboxError::InvalidState(
                    "cannot remove an unresolved session".to_string(),
                ))
            }
            SessionState::Removed(_) => return Ok(()),
            other => other
                .id()
                .cloned()
                .ok_or_else(|| SandboxError::InvalidState("remove".to_string()))?,
        };

        match self.runtime.remove(&id, force).await {
            Ok(()) => {}
            Err(SandboxError::NotFound(_)) => {
                debug!("Sandbox {} already gone", id);
            }
            Err(e) => return Err(e),
        }

        info!("Removed sandbox {}", id);
        self.state = SessionState::Removed(id);
        self.attached = false;
        Ok(())
    }

    /// Guard that performs `action` on this session's sandbox if dropped
    /// before `finish` is awaited
    pub fn teardown_guard(&self, action: Teardown) -> Option<TeardownGuard> {
        self.id()
            .cloned()
            .map(|id| TeardownGuard::new(self.runtime.clone(), id, action))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("spec", &self.spec)
            .field("state", &self.state.name())
            .field("id", &self.id())
            .field("attached", &self.attached)
            .finish()
    }
}

/// Stop that treats a sandbox which no longer exists as stopped
pub async fn stop_sandbox(runtime: &dyn RuntimeClient, id: &SandboxId) -> Result<()> {
    match runtime.stop(id).await {
        Ok(()) => Ok(()),
        Err(SandboxError::NotFound(_)) => {
            debug!("Sandbox {} already gone, nothing to stop", id);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Stop,
    ForceRemove,
}

/// Scoped cleanup for a sandbox id. `finish` runs the action inline; dropping
/// the guard unfinished spawns it on the current Tokio runtime.
pub struct TeardownGuard {
    runtime: Arc<dyn RuntimeClient>,
    id: SandboxId,
    action: Teardown,
    armed: bool,
}

impl TeardownGuard {
    pub fn new(runtime: Arc<dyn RuntimeClient>, id: SandboxId, action: Teardown) -> Self {
        Self {
            runtime,
            id,
            action,
            armed: true,
        }
    }

    pub fn id(&self) -> &SandboxId {
        &self.id
    }

    pub async fn finish(mut self) -> Result<()> {
        self.armed = false;
        run_teardown(self.runtime.as_ref(), &self.id, self.action).await
    }

    /// Give up the cleanup without running it
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                "No async runtime to run {:?} for sandbox {}; it may leak",
                self.action, self.id
            );
            return;
        };

        let runtime = self.runtime.clone();
        let id = self.id.clone();
        let action = self.action;
        debug!("Scheduling {:?} for sandbox {} from drop", action, id);
        handle.spawn(async move {
            if let Err(e) = run_teardown(runtime.as_ref(), &id, action).await {
                warn!("Deferred {:?} of sandbox {} failed: {}", action, id, e);
            }
        });
    }
}

async fn run_teardown(runtime: &dyn RuntimeClient, id: &SandboxId, action: Teardown) -> Result<()> {
    match action {
        Teardown::Stop => stop_sandbox(runtime, id).await,
        Teardown::ForceRemove => match runtime.remove(id, true).await {
            Err(SandboxError::NotFound(_)) => Ok(()),
            other => other,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::{FakeCall, FakeOp, FakeRuntime};
    use rstest::rstest;

    fn shell_spec() -> SessionSpec {
        SessionSpec::new("ubuntu", "22.04", "/bin/bash")
    }

    fn fake() -> Arc<FakeRuntime> {
        Arc::new(FakeRuntime::new())
    }

    #[rstest]
    #[case("/bin/bash", vec!["/bin/bash"])]
    #[case("python3 /app/main.py", vec!["python3", "/app/main.py"])]
    #[case("  go   run /app/main.go ", vec!["go", "run", "/app/main.go"])]
    #[case("/bin/sh -c echo a  b", vec!["/bin/sh", "-c", "echo a  b"])]
    #[case("bash -c ls -la /tmp", vec!["bash", "-c", "ls -la /tmp"])]
    #[case("/bin/sh -cx", vec!["/bin/sh", "-cx"])]
    fn test_tokenize_command(#[case] command: &str, #[case] expected: Vec<&str>) {
        assert_eq!(tokenize_command(command).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("/bin/sh -c")]
    #[case("/bin/sh -c   ")]
    fn test_tokenize_rejects(#[case] command: &str) {
        assert!(matches!(
            tokenize_command(command),
            Err(SandboxError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_spec_defaults_are_safe() {
        let spec = shell_spec().to_sandbox_spec().unwrap();
        assert_eq!(spec.image_ref, "ubuntu:22.04");
        assert!(!spec.network_enabled);
        assert!(!spec.auto_remove);
        assert!(spec.attach_io);
    }

    #[test]
    fn test_spec_requires_image_and_tag() {
        let spec = SessionSpec::new("", "22.04", "/bin/bash");
        assert!(matches!(
            spec.to_sandbox_spec(),
            Err(SandboxError::InvalidSpec(_))
        ));

        let spec = SessionSpec::new("ubuntu", "", "/bin/bash");
        assert!(matches!(
            spec.to_sandbox_spec(),
            Err(SandboxError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let spec: SessionSpec = serde_json::from_str(
            r#"{"image":"ubuntu","tag":"22.04","command":"/bin/bash"}"#,
        )
        .unwrap();
        assert_eq!(spec, shell_spec());
    }

    #[tokio::test]
    async fn test_create_then_inspect_reports_existing_sandbox() {
        let runtime = fake();
        let mut session = Session::new(runtime.clone(), shell_spec());

        let id = session.resolve().await.unwrap();
        assert!(!id.as_str().is_empty());
        assert_eq!(session.state(), &SessionState::Created(id.clone()));

        let status = session.inspect().await.unwrap();
        assert!(!status.running);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let runtime = fake();
        let mut session = Session::new(runtime.clone(), shell_spec());

        let first = session.resolve().await.unwrap();
        let second = session.resolve().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(runtime.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_skips_create() {
        let runtime = fake();
        let id = SandboxId::new("existing");
        runtime.insert_existing(&id, shell_spec().to_sandbox_spec().unwrap(), true);

        let mut session = Session::reconnect(runtime.clone(), shell_spec(), id.clone());
        assert_eq!(session.resolve().await.unwrap(), id);
        assert_eq!(session.state(), &SessionState::Running(id));
        assert_eq!(runtime.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_to_missing_sandbox() {
        let runtime = fake();
        let mut session = Session::reconnect(runtime.clone(), shell_spec(), "gone".into());

        assert!(session.resolve().await.unwrap_err().is_not_found());
        assert!(matches!(session.state(), SessionState::Unresolved { .. }));
        assert_eq!(runtime.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_start_not_found_keeps_created_state() {
        let runtime = fake();
        let mut session = Session::new(runtime.clone(), shell_spec());
        let id = session.resolve().await.unwrap();

        // Removed behind the session's back
        runtime.remove(&id, true).await.unwrap();

        assert!(session.start().await.unwrap_err().is_not_found());
        assert_eq!(session.state(), &SessionState::Created(id));
    }

    #[tokio::test]
    async fn test_attach_requires_running() {
        let runtime = fake();
        let mut session = Session::new(runtime.clone(), shell_spec());
        session.resolve().await.unwrap();

        assert!(matches!(
            session.attach(false).await,
            Err(SandboxError::NotRunning(_))
        ));

        session.start().await.unwrap();
        session.attach(false).await.unwrap();
        assert!(session.is_attached());
    }

    #[tokio::test]
    async fn test_exec_needs_a_running_sandbox() {
        let runtime = fake();
        let mut session = Session::new(runtime.clone(), shell_spec());
        let argv = vec!["ls".to_string(), "-la".to_string()];

        assert!(matches!(
            session.exec(argv.clone()).await,
            Err(SandboxError::InvalidState(_))
        ));

        let id = session.resolve().await.unwrap();
        assert!(matches!(
            session.exec(argv.clone()).await,
            Err(SandboxError::NotRunning(_))
        ));

        session.start().await.unwrap();
        session.exec(argv.clone()).await.unwrap();
        assert!(runtime.calls().contains(&FakeCall::Exec(id, argv)));
    }

    #[tokio::test]
    async fn test_exec_failures_reach_the_caller() {
        let runtime = fake();
        let mut session = Session::new(runtime.clone(), shell_spec());
        let id = session.resolve().await.unwrap();
        session.start().await.unwrap();

        runtime.fail_on(FakeOp::Exec);
        assert!(matches!(
            session.exec(vec!["true".to_string()]).await,
            Err(SandboxError::Runtime(_))
        ));
        runtime.clear_failures();
        session.exec(vec!["true".to_string()]).await.unwrap();

        runtime.remove(&id, true).await.unwrap();
        assert!(session
            .exec(vec!["true".to_string()])
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_stop_twice_is_idempotent() {
        let runtime = fake();
        let mut session = Session::new(runtime.clone(), shell_spec());
        let id = session.resolve().await.unwrap();
        session.start().await.unwrap();

        session.stop().await.unwrap();
        session.stop().await.unwrap();

        assert_eq!(session.state(), &SessionState::Stopped(id.clone()));
        assert!(!runtime.inspect(&id).await.unwrap().running);
    }

    #[tokio::test]
    async fn test_stop_of_auto_removed_sandbox() {
        let runtime = fake();
        let mut session = Session::new(runtime.clone(), shell_spec().with_auto_remove(true));
        let id = session.resolve().await.unwrap();
        session.start().await.unwrap();

        // Another party stopped it and the runtime removed it
        runtime.stop(&id).await.unwrap();
        assert!(!runtime.exists(&id));

        session.stop().await.unwrap();
        assert_eq!(session.state(), &SessionState::Stopped(id));
    }

    #[tokio::test]
    async fn test_stop_surfaces_infrastructure_failures() {
        let runtime = fake();
        let mut session = Session::new(runtime.clone(), shell_spec());
        let id = session.resolve().await.unwrap();
        session.start().await.unwrap();

        runtime.fail_on(FakeOp::Stop);
        assert!(matches!(session.stop().await, Err(SandboxError::Runtime(_))));
        assert_eq!(session.state(), &SessionState::Running(id));
    }

    #[tokio::test]
    async fn test_removed_session_is_terminal() {
        let runtime = fake();
        let mut session = Session::new(runtime.clone(), shell_spec());
        let id = session.resolve().await.unwrap();

        session.remove(true).await.unwrap();
        assert_eq!(session.state(), &SessionState::Removed(id.clone()));
        assert!(!runtime.exists(&id));

        assert!(matches!(
            session.start().await,
            Err(SandboxError::InvalidState(_))
        ));
        assert!(matches!(
            session.resolve().await,
            Err(SandboxError::InvalidState(_))
        ));
        // Removing again is a no-op
        session.remove(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_failure_is_not_fatal() {
        let runtime = fake();
        let mut session = Session::new(runtime.clone(), shell_spec());
        let id = session.resolve().await.unwrap();

        // Not running yet, the runtime refuses; the session shrugs
        session.resize(TerminalSize::new(40, 120)).await;

        assert!(runtime
            .calls()
            .contains(&FakeCall::Resize(id, TerminalSize::new(40, 120))));
    }

    #[tokio::test]
    async fn test_dropped_guard_schedules_teardown() {
        let runtime = fake();
        let mut session = Session::new(runtime.clone(), shell_spec());
        let id = session.resolve().await.unwrap();

        let guard = session.teardown_guard(Teardown::ForceRemove).unwrap();
        drop(guard);

        for _ in 0..50 {
            if !runtime.exists(&id) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!runtime.exists(&id));
    }

    #[tokio::test]
    async fn test_finished_guard_runs_inline() {
        let runtime = fake();
        let mut session = Session::new(runtime.clone(), shell_spec());
        let id = session.resolve().await.unwrap();
        session.start().await.unwrap();

        let guard = session.teardown_guard(Teardown::Stop).unwrap();
        guard.finish().await.unwrap();

        assert_eq!(runtime.stop_calls(&id), 1);
        assert!(!runtime.inspect(&id).await.unwrap().running);
    }
}
