//! Credential providers for the collection endpoint.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

/// Source of the bearer token used to authenticate uploads.
///
/// Implementations must be side-effect free: the router and the uploader
/// may both ask for a token while handling the same sample.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// The current token, or `None` when no identity is available.
    async fn token(&self) -> Option<String>;
}

/// A fixed token supplied at construction.
#[derive(Clone)]
pub struct StaticToken {
    token: Option<String>,
}

impl StaticToken {
    /// Create a provider for the given token. Blank tokens count as absent.
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        let token = if token.trim().is_empty() {
            None
        } else {
            Some(token)
        };
        Self { token }
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticToken")
            .field("present", &self.token.is_some())
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn token(&self) -> Option<String> {
        self.token.clone()
    }
}

/// A token read from a file on every call, so an external login flow can
/// rotate it without restarting the agent.
#[derive(Debug, Clone)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialProvider for TokenFile {
    async fn token(&self) -> Option<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let token = content.trim();
                if token.is_empty() {
                    None
                } else {
                    Some(token.to_string())
                }
            }
            Err(e) => {
                debug!("No token at {}: {}", self.path.display(), e);
                None
            }
        }
    }
}

/// Provider that never has a token. Every sample is queued.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn token(&self) -> Option<String> {
        None
    }
}
