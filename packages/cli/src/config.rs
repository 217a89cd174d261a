// ABOUTME: CLI configuration loaded from the environment (and .env via dotenvy)
// ABOUTME: Holds sandbox settings plus the credential table used to resolve the session owner

use boxcode_sandbox::{AuthError, Authenticator, OwnerId, SandboxSettings, StaticAuthenticator};
use std::env;
use thiserror::Error;

pub const DEFAULT_LOG_FILTER: &str = "boxcode=info";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Sandbox(#[from] boxcode_sandbox::ConfigError),
    #[error("Invalid BOXCODE_TOKENS entry '{0}', expected token=owner")]
    InvalidToken(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub sandbox: SandboxSettings,
    /// `BOXCODE_TOKENS`: comma-separated `token=owner` pairs
    pub tokens: Vec<(String, OwnerId)>,
    /// `BOXCODE_TOKEN`: credential presented by this invocation
    pub token: Option<String>,
    /// Owner used when no token table is configured
    pub local_owner: OwnerId,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let sandbox = SandboxSettings::from_lookup(&lookup)?;

        let tokens = match lookup("BOXCODE_TOKENS") {
            Some(raw) => parse_tokens(&raw)?,
            None => Vec::new(),
        };

        let token = lookup("BOXCODE_TOKEN").filter(|t| !t.trim().is_empty());

        let local_owner = lookup("USER")
            .filter(|user| !user.trim().is_empty())
            .map(OwnerId::new)
            .unwrap_or_else(|| OwnerId::new("local"));

        Ok(Config {
            sandbox,
            tokens,
            token,
            local_owner,
        })
    }

    pub fn authenticator(&self) -> StaticAuthenticator {
        self.tokens
            .iter()
            .fold(StaticAuthenticator::new(), |auth, (token, owner)| {
                auth.with_token(token.clone(), owner.clone())
            })
    }

    /// Resolve who this invocation acts as. Without a token table every
    /// invocation is the local user.
    pub async fn owner(&self) -> Result<OwnerId, AuthError> {
        if self.tokens.is_empty() {
            return Ok(self.local_owner.clone());
        }
        self.authenticator()
            .authenticate(self.token.as_deref())
            .await
    }
}

fn parse_tokens(raw: &str) -> Result<Vec<(String, OwnerId)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((token, owner)) if !token.trim().is_empty() && !owner.trim().is_empty() => {
                Ok((token.trim().to_string(), OwnerId::new(owner.trim())))
            }
            _ => Err(ConfigError::InvalidToken(entry.to_string())),
        })
        .collect()
}
