//! Authoritative persistence path against the hosted item store.
//!
//! - [`auth`]: bearer token providers
//! - [`api`]: the item API seam and its HTTP implementation
//! - [`memory`]: in-process item API used by tests and offline demos
//! - [`engine`]: optimistic mutations with rollback, viewport saves and
//!   the change feed

pub mod api;
pub mod auth;
pub mod engine;
pub mod memory;

use thiserror::Error;

pub use api::{HttpItemApi, ItemApi};
pub use auth::{AuthError, StaticToken, TokenProvider};
pub use engine::{LocalEdits, SyncEngine};
pub use memory::MemoryItemApi;

/// Failures of the REST path. Each one is paired with a rollback of the
/// optimistic mutation that triggered it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("item '{0}' not found")]
    NotFound(String),
    #[error("item '{0}' has not been persisted yet")]
    NotPersisted(String),
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SyncError::Decode(e.to_string())
        } else {
            SyncError::Network(e.to_string())
        }
    }
}
