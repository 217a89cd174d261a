// ABOUTME: Runtime client capability interface for container-backed sandboxes
// ABOUTME: Defines the stateless adapter contract plus the value types crossing it

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

pub mod docker;
#[cfg(any(test, feature = "test-utils"))]
pub mod fake;

pub use docker::DockerRuntime;
#[cfg(any(test, feature = "test-utils"))]
pub use fake::FakeRuntime;

/// Runtime-assigned sandbox identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SandboxId(String);

impl SandboxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SandboxId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SandboxId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for SandboxId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Fully resolved creation request handed to the runtime
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    /// `image:tag`
    pub image_ref: String,
    pub argv: Vec<String>,
    pub name: Option<String>,
    pub auto_remove: bool,
    pub network_enabled: bool,
    pub attach_io: bool,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxStatus {
    pub running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Live byte stream bound to a sandbox's primary process.
///
/// Dropping either half does not stop the sandbox.
pub struct AttachedStream {
    pub output: Pin<Box<dyn AsyncRead + Send>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl fmt::Debug for AttachedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedStream").finish_non_exhaustive()
    }
}

/// Combined stdout/stderr as emitted by the runtime
pub type LogStream = BoxStream<'static, Result<Bytes>>;

/// Capability interface over a container runtime.
///
/// Implementations hold no session state and must be safe to share across
/// every session in the process.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Check whether the backing service is reachable
    async fn ping(&self) -> Result<()>;

    /// Create a sandbox without starting it
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxId>;

    async fn start(&self, id: &SandboxId) -> Result<()>;

    async fn inspect(&self, id: &SandboxId) -> Result<SandboxStatus>;

    async fn resize(&self, id: &SandboxId, size: TerminalSize) -> Result<()>;

    /// Attach to the primary process. With `replay_output` the stream starts
    /// with output produced before the attach.
    async fn attach(&self, id: &SandboxId, replay_output: bool) -> Result<AttachedStream>;

    /// Run an extra command inside an existing sandbox
    async fn exec(&self, id: &SandboxId, argv: Vec<String>) -> Result<()>;

    /// Unpack a tar archive at `dest_path` inside the sandbox filesystem
    async fn copy_archive(&self, id: &SandboxId, dest_path: &str, archive: Vec<u8>) -> Result<()>;

    async fn logs(&self, id: &SandboxId, follow: bool) -> Result<LogStream>;

    async fn stop(&self, id: &SandboxId) -> Result<()>;

    async fn remove(&self, id: &SandboxId, force: bool) -> Result<()>;

    /// Block until the primary process exits, returning its exit code
    async fn wait(&self, id: &SandboxId) -> Result<i64>;
}
