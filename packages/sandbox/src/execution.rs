// ABOUTME: One-shot code execution pipeline over an ephemeral, network-disabled sandbox
// ABOUTME: Injects the source as a tar entry, runs to completion and always removes the sandbox

use futures::TryStreamExt;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{Result, SandboxError};
use crate::runtime::{RuntimeClient, SandboxId};
use crate::session::{Session, SessionSpec, Teardown};
use crate::settings::DEFAULT_ARCHIVE_MODE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Rust,
    Python,
    C,
    Cpp,
    TypeScript,
    Go,
    Bash,
}

impl Language {
    pub const ALL: [Language; 7] = [
        Language::Rust,
        Language::Python,
        Language::C,
        Language::Cpp,
        Language::TypeScript,
        Language::Go,
        Language::Bash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Rust => "rust",
            Language::Python => "python",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::TypeScript => "typescript",
            Language::Go => "go",
            Language::Bash => "bash",
        }
    }

    pub fn profile(&self) -> LanguageProfile {
        match self {
            Language::Rust => LanguageProfile {
                language: *self,
                command: "/usr/local/cargo/bin/cargo run",
                image: "customrust",
                tag: "latest",
                destination: "/usr/src/app/devcontainer/src",
                entry_filename: "main.rs",
            },
            Language::Python => LanguageProfile {
                language: *self,
                command: "python3 /app/main.py",
                image: "custompython",
                tag: "latest",
                destination: "/app",
                entry_filename: "main.py",
            },
            Language::C => LanguageProfile {
                language: *self,
                command: "./run.sh",
                image: "customc",
                tag: "latest",
                destination: "/app",
                entry_filename: "main.c",
            },
            Language::Cpp => LanguageProfile {
                language: *self,
                command: "./runcpp.sh",
                image: "customcpp",
                tag: "latest",
                destination: "/app",
                entry_filename: "main.cpp",
            },
            Language::TypeScript => LanguageProfile {
                language: *self,
                command: "ts-node /app/index.ts",
                image: "customts",
                tag: "latest",
                destination: "/app",
                entry_filename: "index.ts",
            },
            Language::Go => LanguageProfile {
                language: *self,
                command: "go run /app/main.go",
                image: "customgo",
                tag: "latest",
                destination: "/app",
                entry_filename: "main.go",
            },
            Language::Bash => LanguageProfile {
                language: *self,
                command: "bash /app/main.sh",
                image: "custombash",
                tag: "latest",
                destination: "/app",
                entry_filename: "main.sh",
            },
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "rust" | "rs" => Ok(Language::Rust),
            "python" | "py" => Ok(Language::Python),
            "c" => Ok(Language::C),
            "cpp" | "c++" => Ok(Language::Cpp),
            "typescript" | "ts" => Ok(Language::TypeScript),
            "go" | "golang" => Ok(Language::Go),
            "bash" | "sh" => Ok(Language::Bash),
            _ => Err(SandboxError::UnsupportedLanguage(s.to_string())),
        }
    }
}

/// How to run one language: image, entry command and where the source lands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LanguageProfile {
    pub language: Language,
    pub command: &'static str,
    pub image: &'static str,
    pub tag: &'static str,
    pub destination: &'static str,
    pub entry_filename: &'static str,
}

impl LanguageProfile {
    /// Ephemeral sandbox: no network, explicit removal, I/O attached
    pub fn session_spec(&self) -> SessionSpec {
        SessionSpec::new(self.image, self.tag, self.command)
            .with_network(false)
            .with_auto_remove(false)
    }
}

/// Single-entry tar archive holding `source` as `filename`
pub fn source_archive(filename: &str, source: &str, mode: u32) -> Result<Vec<u8>> {
    let data = source.as_bytes();

    let mut header = tar::Header::new_gnu();
    header.set_path(filename)?;
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, data)?;
    Ok(builder.into_inner()?)
}

/// Result of a completed run. Empty output is still a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub sandbox_id: SandboxId,
    pub language: Language,
    pub output: Vec<u8>,
}

impl ExecutionOutput {
    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

pub struct ExecutionPipeline {
    runtime: Arc<dyn RuntimeClient>,
    archive_mode: u32,
}

impl ExecutionPipeline {
    pub fn new(runtime: Arc<dyn RuntimeClient>) -> Self {
        Self {
            runtime,
            archive_mode: DEFAULT_ARCHIVE_MODE,
        }
    }

    pub fn with_archive_mode(mut self, mode: u32) -> Self {
        self.archive_mode = mode;
        self
    }

    /// Run `source` in a fresh sandbox for `language` and capture its output.
    ///
    /// Once the sandbox exists it is force-removed on every exit path,
    /// including cancellation of this future.
    pub async fn run(&self, language: &str, source: &str) -> Result<ExecutionOutput> {
        let profile = language.parse::<Language>()?.profile();
        info!(
            "Running {} snippet ({} bytes) in {}:{}",
            profile.language,
            source.len(),
            profile.image,
            profile.tag
        );

        let mut session = Session::new(self.runtime.clone(), profile.session_spec());
        let sandbox_id = session
            .resolve()
            .await
            .map_err(|e| e.logged(format!("Failed to create {} sandbox", profile.language)))?;
        let guard = session
            .teardown_guard(Teardown::ForceRemove)
            .ok_or_else(|| SandboxError::InvalidState("resolved session without id".to_string()))?;

        let outcome = self.execute(&mut session, &profile, source).await;

        // Removal failures are logged, not returned: the run itself is over
        if let Err(e) = guard.finish().await {
            error!("Failed to remove sandbox {} after run: {}", sandbox_id, e);
        }

        match outcome {
            Ok(output) => {
                info!(
                    "Sandbox {} produced {} bytes of output",
                    sandbox_id,
                    output.len()
                );
                Ok(ExecutionOutput {
                    sandbox_id,
                    language: profile.language,
                    output,
                })
            }
            Err(e) if e.is_infrastructure() => {
                Err(e.logged(format!("Run in sandbox {} failed", sandbox_id)))
            }
            Err(e) => {
                warn!("Run in sandbox {} failed: {}", sandbox_id, e);
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        session: &mut Session,
        profile: &LanguageProfile,
        source: &str,
    ) -> Result<Vec<u8>> {
        let archive = source_archive(profile.entry_filename, source, self.archive_mode)?;
        session.copy_archive(profile.destination, archive).await?;
        session.start().await?;

        let output = session
            .logs(true)
            .await?
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await?;

        Ok(output)
    }
}
