// ABOUTME: Auth collaborator resolving a request credential to an owner identity
// ABOUTME: Ships a static token table used by the CLI and tests

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::registry::OwnerId;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing credential")]
    MissingCredential,
    #[error("Unknown or expired credential")]
    InvalidCredential,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: Option<&str>) -> Result<OwnerId, AuthError>;
}

/// Fixed credential -> owner table
#[derive(Debug, Default, Clone)]
pub struct StaticAuthenticator {
    tokens: HashMap<String, OwnerId>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, owner: OwnerId) -> Self {
        self.tokens.insert(token.into(), owner);
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, credential: Option<&str>) -> Result<OwnerId, AuthError> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(AuthError::MissingCredential)?;

        self.tokens
            .get(credential)
            .cloned()
            .ok_or(AuthError::InvalidCredential)
    }
}
