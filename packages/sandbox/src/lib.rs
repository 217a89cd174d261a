// ABOUTME: Container session runtime: sandbox lifecycle, I/O bridging and one-shot code execution
// ABOUTME: Built over a runtime client capability, backed by Docker (in memory under test-utils)

pub mod auth;
pub mod bridge;
pub mod console;
pub mod error;
pub mod execution;
pub mod manager;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod settings;

pub use auth::{AuthError, Authenticator, StaticAuthenticator};
pub use bridge::{BridgeHandle, BridgeStats, CloseHook, Frame, IoBridge, PumpStats};
pub use console::{Console, ConsoleExit, ConsoleOptions};
pub use error::{Result, SandboxError};
pub use execution::{ExecutionOutput, ExecutionPipeline, Language, LanguageProfile};
pub use manager::{DeleteOutcome, SessionInfo, SessionManager};
pub use registry::{AllowedImage, MemoryRegistry, OwnerId, SessionMeta, SessionRegistry};
pub use runtime::{
    AttachedStream, DockerRuntime, RuntimeClient, SandboxId, SandboxSpec, SandboxStatus,
    TerminalSize,
};
#[cfg(any(test, feature = "test-utils"))]
pub use runtime::FakeRuntime;
pub use session::{Session, SessionSpec, SessionState, Teardown, TeardownGuard};
pub use settings::{ConfigError, SandboxSettings};
