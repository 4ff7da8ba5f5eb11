//! Upstream catalog contract.

use async_trait::async_trait;
use thiserror::Error;

/// One archived video as listed upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogVideo {
    pub id: String,
    pub title: String,
    pub description: String,
    /// Epoch ms
    pub created_at: i64,
    pub duration_secs: Option<i64>,
}

/// One page of a newest-first listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogPage {
    pub videos: Vec<CatalogVideo>,
    /// Cursor for the next (older) page; `None` when the listing is exhausted.
    pub next_cursor: Option<String>,
}

/// Errors from the catalog job and its client.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Network failure, rate limiting or upstream 5xx.
    #[error("Transient upstream error: {0}")]
    Transient(String),

    #[error("Upstream rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Upstream error: {0}")]
    Permanent(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// Credentials could not be read from the vault.
    #[error("Credential error: {0}")]
    Credentials(String),

    #[error(transparent)]
    Storage(#[from] crate::Error),
}

impl CatalogError {
    /// Check if this error is transient and may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the failure was the upstream's and should trip the breaker.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Unauthorized(_) | Self::Permanent(_) | Self::UnknownChannel(_)
        )
    }
}

/// Lists a channel's archived videos, newest first.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn list_videos(
        &self,
        channel: &str,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<CatalogPage, CatalogError>;
}
