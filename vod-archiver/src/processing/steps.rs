//! Collaborators for the download, transcode and upload steps.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::database::models::VodDbModel;

/// Errors returned by a processing step.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    /// Worth retrying later: network trouble, timeouts, upstream 5xx.
    #[error("Transient step failure: {0}")]
    Transient(String),

    /// The VOD can never succeed, e.g. it was deleted upstream.
    #[error("Permanent step failure: {0}")]
    Permanent(String),

    /// Credentials are missing or unreadable; the step waits for an operator.
    #[error("Credentials unavailable: {0}")]
    Credentials(String),

    #[error("Step cancelled")]
    Cancelled,
}

impl StepError {
    /// Check if this error is transient and may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the failure should count against the channel's breaker.
    pub fn is_upstream_failure(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Fetches the source media of a VOD.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download to `output`, resuming a partial file there if possible.
    async fn download(
        &self,
        vod: &VodDbModel,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), StepError>;

    /// Whether an interrupted download at `partial` can be continued.
    async fn can_resume(&self, vod: &VodDbModel, partial: &Path) -> bool;
}

/// Converts the downloaded source into the upload artifact.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(
        &self,
        vod: &VodDbModel,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), StepError>;
}

/// Publishes the artifact. Returns the public URL.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(
        &self,
        vod: &VodDbModel,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, StepError>;
}
