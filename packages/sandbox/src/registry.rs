// ABOUTME: Session registry collaborator: who owns which sandbox, and which images are allowed
// ABOUTME: Includes an in-process registry backed by a tokio RwLock

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Result, SandboxError};
use crate::runtime::SandboxId;
use crate::session::SessionSpec;

/// Identity of the user owning sessions
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted record of one owned session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub owner_id: OwnerId,
    pub session_id: String,
    pub image: String,
    pub tag: String,
    pub name: Option<String>,
    pub auto_remove: bool,
    pub network_enabled: bool,
    pub command: String,
    pub created_at: DateTime<Utc>,
}

impl SessionMeta {
    pub fn new(owner_id: OwnerId, session_id: &SandboxId, spec: &SessionSpec) -> Self {
        Self {
            owner_id,
            session_id: session_id.to_string(),
            image: spec.image.clone(),
            tag: spec.tag.clone(),
            name: spec.name.clone(),
            auto_remove: spec.auto_remove,
            network_enabled: spec.network_enabled,
            command: spec.command.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn sandbox_id(&self) -> SandboxId {
        SandboxId::new(self.session_id.clone())
    }

    pub fn spec(&self) -> SessionSpec {
        SessionSpec {
            image: self.image.clone(),
            tag: self.tag.clone(),
            command: self.command.clone(),
            name: self.name.clone(),
            auto_remove: self.auto_remove,
            network_enabled: self.network_enabled,
            attach_io: true,
        }
    }
}

/// An image users may start, with the commands it may run.
/// An empty command list allows any command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedImage {
    pub image_ref: String,
    pub commands: Vec<String>,
}

impl AllowedImage {
    pub fn permits(&self, image_ref: &str, command: &str) -> bool {
        self.image_ref == image_ref
            && (self.commands.is_empty() || self.commands.iter().any(|c| c == command.trim()))
    }
}

#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn lookup(&self, owner: &OwnerId, session_id: &str) -> Result<Option<SessionMeta>>;

    /// Fails with `NameConflict` when the owner already records `session_id`
    async fn insert(&self, meta: SessionMeta) -> Result<()>;

    /// Returns whether a record was removed
    async fn delete(&self, session_id: &str, owner: &OwnerId) -> Result<bool>;

    async fn count(&self, owner: &OwnerId) -> Result<u32>;

    async fn list(&self, owner: &OwnerId) -> Result<Vec<SessionMeta>>;

    async fn list_allowed_images(&self) -> Result<Vec<AllowedImage>>;
}

/// Registry kept in process memory
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    sessions: RwLock<BTreeMap<(OwnerId, String), SessionMeta>>,
    allowed_images: Vec<AllowedImage>,
}

impl MemoryRegistry {
    pub fn new(allowed_images: Vec<AllowedImage>) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            allowed_images,
        }
    }
}

#[async_trait]
impl SessionRegistry for MemoryRegistry {
    async fn lookup(&self, owner: &OwnerId, session_id: &str) -> Result<Option<SessionMeta>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(&(owner.clone(), session_id.to_string()))
            .cloned())
    }

    async fn insert(&self, meta: SessionMeta) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let key = (meta.owner_id.clone(), meta.session_id.clone());
        if sessions.contains_key(&key) {
            return Err(SandboxError::NameConflict(meta.session_id));
        }
        debug!("Recording session {} for {}", meta.session_id, meta.owner_id);
        sessions.insert(key, meta);
        Ok(())
    }

    async fn delete(&self, session_id: &str, owner: &OwnerId) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions
            .remove(&(owner.clone(), session_id.to_string()))
            .is_some())
    }

    async fn count(&self, owner: &OwnerId) -> Result<u32> {
        let sessions = self.sessions.read().await;
        Ok(sessions.keys().filter(|(o, _)| o == owner).count() as u32)
    }

    async fn list(&self, owner: &OwnerId) -> Result<Vec<SessionMeta>> {
        let sessions = self.sessions.read().await;
        let mut owned: Vec<SessionMeta> = sessions
            .values()
            .filter(|meta| &meta.owner_id == owner)
            .cloned()
            .collect();
        owned.sort_by_key(|meta| meta.created_at);
        Ok(owned)
    }

    async fn list_allowed_images(&self) -> Result<Vec<AllowedImage>> {
        Ok(self.allowed_images.clone())
    }
}
