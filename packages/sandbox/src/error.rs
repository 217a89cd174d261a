// ABOUTME: Error taxonomy shared by the runtime adapter, sessions, bridge and pipeline
// ABOUTME: Runtime-specific failures are mapped into these variants at the adapter boundary

use std::fmt::Display;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Invalid sandbox spec: {0}")]
    InvalidSpec(String),

    #[error("Name already in use: {0}")]
    NameConflict(String),

    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Sandbox not running: {0}")]
    NotRunning(String),

    #[error("Path conflict in sandbox: {0}")]
    PathConflict(String),

    #[error("Sandbox is still running: {0}")]
    SandboxRunning(String),

    #[error("Session quota exceeded for {owner}: limit is {limit}")]
    QuotaExceeded { owner: String, limit: u32 },

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Image not allowed: {0}")]
    ImageNotAllowed(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Archive error: {0}")]
    Archive(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
    /// Failures of the surrounding infrastructure rather than of the request.
    /// These are logged with full context and reported opaquely.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            SandboxError::RuntimeUnavailable(_)
                | SandboxError::Runtime(_)
                | SandboxError::Persistence(_)
                | SandboxError::Archive(_)
        )
    }

    /// Log an infrastructure failure at error level with `context`, passing
    /// the error on unchanged. Request errors are not logged here.
    pub fn logged(self, context: impl Display) -> Self {
        if self.is_infrastructure() {
            error!("{}: {}", context, self);
        }
        self
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SandboxError::NotFound(_))
    }

    /// Sanitized message suitable for showing to the end user
    pub fn user_message(&self) -> String {
        match self {
            SandboxError::InvalidSpec(msg) => format!("Invalid sandbox configuration: {}", msg),
            SandboxError::NameConflict(name) => {
                format!("A sandbox named '{}' already exists", name)
            }
            SandboxError::NotFound(_) => "The requested sandbox was not found".to_string(),
            SandboxError::NotRunning(_) => "The sandbox is not running".to_string(),
            SandboxError::PathConflict(path) => {
                format!("Cannot write to '{}' inside the sandbox", path)
            }
            SandboxError::SandboxRunning(_) => "Stop the sandbox before removing it".to_string(),
            SandboxError::QuotaExceeded { limit, .. } => {
                format!("Session limit reached ({} allowed)", limit)
            }
            SandboxError::UnsupportedLanguage(lang) => {
                format!("Language '{}' is not supported", lang)
            }
            SandboxError::ImageNotAllowed(image) => format!("Image '{}' is not available", image),
            SandboxError::InvalidState(_) => "The session can no longer be used".to_string(),
            SandboxError::Transport(_) => "Connection to the sandbox was lost".to_string(),
            SandboxError::RuntimeUnavailable(_)
            | SandboxError::Runtime(_)
            | SandboxError::Persistence(_)
            | SandboxError::Archive(_) => "An internal error occurred".to_string(),
        }
    }
}
