// ABOUTME: Session manager orchestrating the registry and the runtime client
// ABOUTME: Enforces per-user quotas and allowed images, and tears sandboxes down on delete

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{Result, SandboxError};
use crate::registry::{AllowedImage, OwnerId, SessionMeta, SessionRegistry};
use crate::runtime::{RuntimeClient, TerminalSize};
use crate::session::{stop_sandbox, Session, SessionSpec};
use crate::settings::SandboxSettings;

/// Result of asking to delete a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Removed,
    NotFound,
    /// Refused: stop the sandbox first
    StillRunning,
}

/// Registry record joined with live runtime state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    #[serde(flatten)]
    pub meta: SessionMeta,
    /// `None` when the runtime no longer knows the sandbox
    pub running: Option<bool>,
}

pub struct SessionManager {
    runtime: Arc<dyn RuntimeClient>,
    registry: Arc<dyn SessionRegistry>,
    max_sessions_per_user: u32,
}

impl SessionManager {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        registry: Arc<dyn SessionRegistry>,
        settings: &SandboxSettings,
    ) -> Self {
        Self {
            runtime,
            registry,
            max_sessions_per_user: settings.max_sessions_per_user,
        }
    }

    /// Create and record a new session for `owner`.
    ///
    /// The quota check reads the registry count before creating; concurrent
    /// requests from one owner can overshoot the ceiling.
    pub async fn create_session(&self, owner: &OwnerId, spec: SessionSpec) -> Result<Session> {
        let current = self
            .registry
            .count(owner)
            .await
            .map_err(|e| e.logged(format!("Failed to count sessions of {}", owner)))?;
        if current >= self.max_sessions_per_user {
            warn!(
                "Session quota reached for {} ({}/{})",
                owner, current, self.max_sessions_per_user
            );
            return Err(SandboxError::QuotaExceeded {
                owner: owner.to_string(),
                limit: self.max_sessions_per_user,
            });
        }

        self.check_allowed(&spec).await?;

        let mut session = Session::new(self.runtime.clone(), spec.clone());
        let id = session
            .resolve()
            .await
            .map_err(|e| e.logged(format!("Failed to create sandbox for {}", owner)))?;

        if let Err(e) = self
            .registry
            .insert(SessionMeta::new(owner.clone(), &id, &spec))
            .await
        {
            error!("Failed to record session {} for {}: {}", id, owner, e);
            if let Err(cleanup) = session.remove(true).await {
                error!("Failed to remove unrecorded sandbox {}: {}", id, cleanup);
            }
            return Err(e);
        }

        info!("Created session {} for {}", id, owner);
        Ok(session)
    }

    async fn check_allowed(&self, spec: &SessionSpec) -> Result<()> {
        let image_ref = spec.image_ref();
        let allowed = self
            .registry
            .list_allowed_images()
            .await
            .map_err(|e| e.logged("Failed to load allowed images"))?;
        if allowed
            .iter()
            .any(|image| image.permits(&image_ref, &spec.command))
        {
            Ok(())
        } else {
            Err(SandboxError::ImageNotAllowed(format!(
                "{} ({})",
                image_ref, spec.command
            )))
        }
    }

    /// Reconnect to a session `owner` recorded earlier
    pub async fn open_session(&self, owner: &OwnerId, session_id: &str) -> Result<Session> {
        let meta = self.owned(owner, session_id).await?;
        let mut session = Session::reconnect(self.runtime.clone(), meta.spec(), meta.sandbox_id());
        session
            .resolve()
            .await
            .map_err(|e| e.logged(format!("Failed to reconnect to session {}", session_id)))?;
        Ok(session)
    }

    async fn owned(&self, owner: &OwnerId, session_id: &str) -> Result<SessionMeta> {
        self.registry
            .lookup(owner, session_id)
            .await
            .map_err(|e| e.logged(format!("Failed to look up session {}", session_id)))?
            .ok_or_else(|| SandboxError::NotFound(session_id.to_string()))
    }

    pub async fn list_sessions(&self, owner: &OwnerId) -> Result<Vec<SessionMeta>> {
        self.registry.list(owner).await
    }

    pub async fn session_info(&self, owner: &OwnerId, session_id: &str) -> Result<SessionInfo> {
        let meta = self.owned(owner, session_id).await?;
        let running = match self.runtime.inspect(&meta.sandbox_id()).await {
            Ok(status) => Some(status.running),
            Err(SandboxError::NotFound(_)) => None,
            Err(e) => return Err(e.logged(format!("Failed to inspect session {}", session_id))),
        };
        Ok(SessionInfo { meta, running })
    }

    /// Resize the terminal of an owned session. Runtime refusals are logged only.
    pub async fn resize_session(
        &self,
        owner: &OwnerId,
        session_id: &str,
        size: TerminalSize,
    ) -> Result<()> {
        let meta = self.owned(owner, session_id).await?;
        if let Err(e) = self.runtime.resize(&meta.sandbox_id(), size).await {
            warn!("Failed to resize session {}: {}", session_id, e);
        }
        Ok(())
    }

    /// Forget a stopped session and remove its sandbox
    pub async fn delete_session(&self, owner: &OwnerId, session_id: &str) -> Result<DeleteOutcome> {
        let Some(meta) = self
            .registry
            .lookup(owner, session_id)
            .await
            .map_err(|e| e.logged(format!("Failed to look up session {}", session_id)))?
        else {
            return Ok(DeleteOutcome::NotFound);
        };
        let id = meta.sandbox_id();

        match self.runtime.inspect(&id).await {
            Ok(status) if status.running => return Ok(DeleteOutcome::StillRunning),
            Ok(_) | Err(SandboxError::NotFound(_)) => {}
            Err(e) => return Err(e.logged(format!("Failed to inspect session {}", session_id))),
        }

        let deleted = self
            .registry
            .delete(session_id, owner)
            .await
            .map_err(|e| e.logged(format!("Failed to delete session {}", session_id)))?;
        if !deleted {
            return Ok(DeleteOutcome::NotFound);
        }

        match self.runtime.remove(&id, true).await {
            Ok(()) | Err(SandboxError::NotFound(_)) => {
                info!("Deleted session {} of {}", session_id, owner);
                Ok(DeleteOutcome::Removed)
            }
            Err(e) => {
                error!(
                    "Session {} deleted but its sandbox could not be removed: {}",
                    session_id, e
                );
                Err(e)
            }
        }
    }

    /// Stop every sandbox `owner` holds. Returns how many stops succeeded.
    pub async fn stop_all(&self, owner: &OwnerId) -> Result<usize> {
        let sessions = self.registry.list(owner).await?;
        info!("Stopping {} sessions of {}", sessions.len(), owner);

        let results = join_all(sessions.iter().map(|meta| {
            let runtime = self.runtime.clone();
            let id = meta.sandbox_id();
            async move {
                let result = stop_sandbox(runtime.as_ref(), &id).await;
                (id, result)
            }
        }))
        .await;

        let mut stopped = 0;
        for (id, result) in results {
            match result {
                Ok(()) => stopped += 1,
                Err(e) => warn!("Failed to stop sandbox {}: {}", id, e),
            }
        }
        Ok(stopped)
    }

    pub async fn allowed_images(&self) -> Result<Vec<AllowedImage>> {
        self.registry.list_allowed_images().await
    }
}
