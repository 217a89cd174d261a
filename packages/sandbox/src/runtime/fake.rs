// ABOUTME: In-memory runtime client used by tests and offline development
// ABOUTME: Simulates sandboxes with an echoing TTY and scripted batch programs

use super::{
    AttachedStream, LogStream, RuntimeClient, SandboxId, SandboxSpec, SandboxStatus, TerminalSize,
};
use crate::error::{Result, SandboxError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

/// File written into a fake sandbox through `copy_archive`
#[derive(Debug, Clone, PartialEq)]
pub struct FakeFile {
    pub contents: Vec<u8>,
    pub mode: u32,
}

/// Operations that can be made to fail on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Create,
    Start,
    Attach,
    Exec,
    CopyArchive,
    Logs,
    Stop,
    Remove,
    Wait,
}

/// Every call the fake has received, in order
#[derive(Debug, Clone, PartialEq)]
pub enum FakeCall {
    Create(SandboxSpec),
    Start(SandboxId),
    Inspect(SandboxId),
    Resize(SandboxId, TerminalSize),
    Attach(SandboxId),
    Exec(SandboxId, Vec<String>),
    CopyArchive(SandboxId, String),
    Logs(SandboxId),
    Stop(SandboxId),
    Remove(SandboxId, bool),
    Wait(SandboxId),
}

/// Decides what a started sandbox does. `Some(output)` makes it a batch
/// process that prints `output` and exits; `None` keeps it running as an
/// interactive echo shell.
pub type Program =
    Arc<dyn Fn(&SandboxSpec, &BTreeMap<String, FakeFile>) -> Option<Vec<u8>> + Send + Sync>;

struct FakeSandbox {
    spec: SandboxSpec,
    running: watch::Sender<bool>,
    files: BTreeMap<String, FakeFile>,
    output: Vec<u8>,
}

impl FakeSandbox {
    fn is_running(&self) -> bool {
        *self.running.borrow()
    }
}

#[derive(Default)]
struct FakeState {
    sandboxes: BTreeMap<SandboxId, FakeSandbox>,
    calls: Vec<FakeCall>,
    failures: HashSet<FakeOp>,
    available: bool,
}

pub struct FakeRuntime {
    state: Mutex<FakeState>,
    program: Program,
    next_id: AtomicU64,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    /// Every sandbox behaves as an interactive echo shell
    pub fn new() -> Self {
        Self::with_program(Arc::new(
            |_: &SandboxSpec, _: &BTreeMap<String, FakeFile>| None,
        ))
    }

    pub fn with_program(program: Program) -> Self {
        Self {
            state: Mutex::new(FakeState {
                available: true,
                ..Default::default()
            }),
            program,
            next_id: AtomicU64::new(1),
        }
    }

    /// Every started sandbox prints `output` and exits
    pub fn with_output(output: Vec<u8>) -> Self {
        Self::with_program(Arc::new(
            move |_: &SandboxSpec, _: &BTreeMap<String, FakeFile>| Some(output.clone()),
        ))
    }

    /// Batch programs that interpret a handful of one-line snippets, keyed on
    /// the uploaded entry file
    pub fn with_interpreters() -> Self {
        Self::with_program(Arc::new(
            |_: &SandboxSpec, files: &BTreeMap<String, FakeFile>| {
                files.iter().find_map(|(path, file)| {
                    let source = String::from_utf8_lossy(&file.contents);
                    interpret(path, &source)
                })
            },
        ))
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every subsequent call of `op` fail with an opaque runtime error
    pub fn fail_on(&self, op: FakeOp) {
        self.state().failures.insert(op);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Simulate the daemon going away
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.state().calls.clone()
    }

    pub fn create_calls(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| matches!(call, FakeCall::Create(_)))
            .count()
    }

    pub fn stop_calls(&self, id: &SandboxId) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| matches!(call, FakeCall::Stop(stopped) if stopped == id))
            .count()
    }

    pub fn exists(&self, id: &SandboxId) -> bool {
        self.state().sandboxes.contains_key(id)
    }

    pub fn sandbox_count(&self) -> usize {
        self.state().sandboxes.len()
    }

    pub fn file(&self, id: &SandboxId, path: &str) -> Option<FakeFile> {
        self.state()
            .sandboxes
            .get(id)
            .and_then(|sandbox| sandbox.files.get(path).cloned())
    }

    /// Register a sandbox that exists outside of `create`, e.g. left over from
    /// an earlier process
    pub fn insert_existing(&self, id: &SandboxId, spec: SandboxSpec, running: bool) {
        let (running, _) = watch::channel(running);
        self.state().sandboxes.insert(
            id.clone(),
            FakeSandbox {
                spec,
                running,
                files: BTreeMap::new(),
                output: Vec::new(),
            },
        );
    }

    /// Make the primary process of `id` exit on its own
    pub fn exit_process(&self, id: &SandboxId) {
        if let Some(sandbox) = self.state().sandboxes.get(id) {
            sandbox.running.send_replace(false);
        }
    }

    fn record(&self, call: FakeCall, op: Option<FakeOp>) -> Result<()> {
        let mut state = self.state();
        state.calls.push(call);
        if !state.available {
            return Err(SandboxError::RuntimeUnavailable(
                "fake runtime is offline".to_string(),
            ));
        }
        if let Some(op) = op {
            if state.failures.contains(&op) {
                return Err(SandboxError::Runtime(format!("injected {:?} failure", op)));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        if self.state().available {
            Ok(())
        } else {
            Err(SandboxError::RuntimeUnavailable(
                "fake runtime is offline".to_string(),
            ))
        }
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxId> {
        self.record(FakeCall::Create(spec.clone()), Some(FakeOp::Create))?;

        if spec.image_ref.is_empty() || spec.argv.is_empty() {
            return Err(SandboxError::InvalidSpec(
                "image and command are required".to_string(),
            ));
        }

        let mut state = self.state();
        if let Some(name) = &spec.name {
            if state
                .sandboxes
                .values()
                .any(|sandbox| sandbox.spec.name.as_ref() == Some(name))
            {
                return Err(SandboxError::NameConflict(name.clone()));
            }
        }

        let id = SandboxId::new(format!(
            "fake{:012x}",
            self.next_id.fetch_add(1, Ordering::SeqCst)
        ));
        let (running, _) = watch::channel(false);
        state.sandboxes.insert(
            id.clone(),
            FakeSandbox {
                spec: spec.clone(),
                running,
                files: BTreeMap::new(),
                output: Vec::new(),
            },
        );

        Ok(id)
    }

    async fn start(&self, id: &SandboxId) -> Result<()> {
        self.record(FakeCall::Start(id.clone()), Some(FakeOp::Start))?;

        let mut state = self.state();
        let sandbox = state
            .sandboxes
            .get_mut(id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;

        match (self.program)(&sandbox.spec, &sandbox.files) {
            Some(output) => {
                sandbox.output.extend_from_slice(&output);
                sandbox.running.send_replace(false);
                if sandbox.spec.auto_remove {
                    state.sandboxes.remove(id);
                }
            }
            None => {
                sandbox.running.send_replace(true);
            }
        }

        Ok(())
    }

    async fn inspect(&self, id: &SandboxId) -> Result<SandboxStatus> {
        self.record(FakeCall::Inspect(id.clone()), None)?;

        self.state()
            .sandboxes
            .get(id)
            .map(|sandbox| SandboxStatus {
                running: sandbox.is_running(),
            })
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))
    }

    async fn resize(&self, id: &SandboxId, size: TerminalSize) -> Result<()> {
        self.record(FakeCall::Resize(id.clone(), size), None)?;

        match self.state().sandboxes.get(id) {
            None => Err(SandboxError::NotFound(id.to_string())),
            Some(sandbox) if !sandbox.is_running() => Err(SandboxError::NotRunning(id.to_string())),
            Some(_) => Ok(()),
        }
    }

    async fn attach(&self, id: &SandboxId, replay_output: bool) -> Result<AttachedStream> {
        self.record(FakeCall::Attach(id.clone()), Some(FakeOp::Attach))?;

        let (mut exited, replay) = {
            let state = self.state();
            let sandbox = state
                .sandboxes
                .get(id)
                .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
            let replay = if replay_output {
                sandbox.output.clone()
            } else {
                Vec::new()
            };
            (sandbox.running.subscribe(), replay)
        };

        let (client, mut process) = tokio::io::duplex(8 * 1024);

        // The "process": a TTY that echoes its input until the sandbox stops
        tokio::spawn(async move {
            if !replay.is_empty() && process.write_all(&replay).await.is_err() {
                return;
            }
            let mut buf = vec![0u8; 1024];
            loop {
                if !*exited.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    changed = exited.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    read = process.read(&mut buf) => {
                        match read {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if process.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });

        let (output, input) = tokio::io::split(client);
        Ok(AttachedStream {
            output: Box::pin(output),
            input: Box::pin(input),
        })
    }

    async fn exec(&self, id: &SandboxId, argv: Vec<String>) -> Result<()> {
        self.record(FakeCall::Exec(id.clone(), argv), Some(FakeOp::Exec))?;

        match self.state().sandboxes.get(id) {
            None => Err(SandboxError::NotFound(id.to_string())),
            Some(sandbox) if !sandbox.is_running() => Err(SandboxError::NotRunning(id.to_string())),
            Some(_) => Ok(()),
        }
    }

    async fn copy_archive(&self, id: &SandboxId, dest_path: &str, archive: Vec<u8>) -> Result<()> {
        self.record(
            FakeCall::CopyArchive(id.clone(), dest_path.to_string()),
            Some(FakeOp::CopyArchive),
        )?;

        let mut state = self.state();
        let sandbox = state
            .sandboxes
            .get_mut(id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;

        let dest = dest_path.trim_end_matches('/');
        if sandbox.files.contains_key(dest) {
            return Err(SandboxError::PathConflict(dest_path.to_string()));
        }

        let mut entries = tar::Archive::new(archive.as_slice());
        for entry in entries.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().into_owned();
            let mode = entry.header().mode()?;
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            sandbox
                .files
                .insert(format!("{}/{}", dest, path), FakeFile { contents, mode });
        }

        Ok(())
    }

    async fn logs(&self, id: &SandboxId, _follow: bool) -> Result<LogStream> {
        self.record(FakeCall::Logs(id.clone()), Some(FakeOp::Logs))?;

        let output = self
            .state()
            .sandboxes
            .get(id)
            .map(|sandbox| sandbox.output.clone())
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;

        let chunks: Vec<Result<Bytes>> = if output.is_empty() {
            Vec::new()
        } else {
            vec![Ok(Bytes::from(output))]
        };
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn stop(&self, id: &SandboxId) -> Result<()> {
        self.record(FakeCall::Stop(id.clone()), Some(FakeOp::Stop))?;

        let mut state = self.state();
        let sandbox = state
            .sandboxes
            .get(id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;

        sandbox.running.send_replace(false);
        if sandbox.spec.auto_remove {
            state.sandboxes.remove(id);
        }
        Ok(())
    }

    async fn remove(&self, id: &SandboxId, force: bool) -> Result<()> {
        self.record(FakeCall::Remove(id.clone(), force), Some(FakeOp::Remove))?;

        let mut state = self.state();
        let sandbox = state
            .sandboxes
            .get(id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;

        if sandbox.is_running() && !force {
            return Err(SandboxError::SandboxRunning(id.to_string()));
        }
        sandbox.running.send_replace(false);
        state.sandboxes.remove(id);
        Ok(())
    }

    async fn wait(&self, id: &SandboxId) -> Result<i64> {
        self.record(FakeCall::Wait(id.clone()), Some(FakeOp::Wait))?;

        let mut running = self
            .state()
            .sandboxes
            .get(id)
            .map(|sandbox| sandbox.running.subscribe())
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;

        // A dropped sender means the sandbox was removed, which also ends the process
        let _ = running.wait_for(|running| !*running).await;
        Ok(0)
    }
}

fn interpret(path: &str, source: &str) -> Option<Vec<u8>> {
    let source = source.trim();
    let output = if path.ends_with(".py") {
        let inner = source.strip_prefix("print(")?.strip_suffix(')')?;
        evaluate(inner).unwrap_or_else(|| inner.trim_matches(['"', '\'']).to_string())
    } else if path.ends_with(".sh") {
        let inner = source.strip_prefix("echo ")?;
        inner.trim_matches(['"', '\'']).to_string()
    } else {
        return None;
    };
    Some(format!("{}\n", output).into_bytes())
}

/// `a+b` style integer sums, the only arithmetic the fake understands
fn evaluate(expr: &str) -> Option<String> {
    expr.split('+')
        .map(|term| term.trim().parse::<i64>())
        .sum::<std::result::Result<i64, _>>()
        .ok()
        .map(|total| total.to_string())
}
