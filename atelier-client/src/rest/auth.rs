//! Bearer tokens for outgoing REST requests.

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ENV_API_TOKEN;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("token provider failed: {0}")]
    Provider(String),
}

/// Yields the bearer token for each request. A failure short-circuits the
/// request before anything is sent.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, AuthError>;
}

/// A fixed token, or none at all.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    /// No token: every request fails with [`AuthError::NotAuthenticated`].
    pub fn anonymous() -> Self {
        Self(None)
    }

    pub fn from_env() -> Self {
        Self(std::env::var(ENV_API_TOKEN).ok().filter(|t| !t.is_empty()))
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, AuthError> {
        self.0.clone().ok_or(AuthError::NotAuthenticated)
    }
}
