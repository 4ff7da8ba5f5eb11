//! VOD database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// VOD database model.
/// One archived stream segment and its position in the processing lifecycle.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct VodDbModel {
    pub id: i64,
    pub channel: String,
    pub twitch_vod_id: String,
    pub title: String,
    pub description: String,
    /// Stream date, Unix epoch milliseconds
    pub date: i64,
    pub duration_secs: Option<i64>,
    /// Higher is processed first
    pub priority: i64,
    /// Lifecycle stage, see [`DownloadState`]
    pub download_state: String,
    /// Local media file while a copy (partial or complete) exists
    pub downloaded_path: Option<String>,
    pub processed: bool,
    pub youtube_url: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: i64,
    /// Also the optimistic-concurrency version for state transitions
    pub updated_at: i64,
}

impl VodDbModel {
    /// Parsed lifecycle state. Unknown values are treated as `None`.
    pub fn state(&self) -> Option<DownloadState> {
        DownloadState::parse(&self.download_state)
    }
}

/// A VOD discovered in the upstream catalog, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVod {
    pub channel: String,
    pub twitch_vod_id: String,
    pub title: String,
    pub description: String,
    pub date: i64,
    pub duration_secs: Option<i64>,
    pub priority: i64,
}

impl NewVod {
    pub fn new(channel: impl Into<String>, twitch_vod_id: impl Into<String>, date: i64) -> Self {
        Self {
            channel: channel.into(),
            twitch_vod_id: twitch_vod_id.into(),
            title: String::new(),
            description: String::new(),
            date,
            duration_secs: None,
            priority: 0,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_duration(mut self, duration_secs: i64) -> Self {
        self.duration_secs = Some(duration_secs);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Download lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    /// Discovered, nothing local yet.
    Pending,
    /// Download in progress; `downloaded_path` points at the partial artifact.
    Downloading,
    /// Source media fully downloaded.
    Downloaded,
    /// Transcode in progress; input is `downloaded_path`.
    Transcoding,
    /// Transcoded file ready and upload in progress or pending retry.
    Uploading,
    /// Terminal success.
    Uploaded,
    /// Terminal failure, not retried automatically.
    Failed,
}

impl DownloadState {
    pub const ALL: [DownloadState; 7] = [
        Self::Pending,
        Self::Downloading,
        Self::Downloaded,
        Self::Transcoding,
        Self::Uploading,
        Self::Uploaded,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Transcoding => "transcoding",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Uploaded | Self::Failed)
    }

    /// States in which a worker may be touching the local media file.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Downloading | Self::Transcoding | Self::Uploading)
    }

    /// Allowed lifecycle edges, including the rollbacks used for transient
    /// failures and crash recovery.
    pub fn can_transition_to(&self, next: DownloadState) -> bool {
        use DownloadState::*;
        match (self, next) {
            (Pending, Downloading)
            | (Downloading, Downloaded)
            | (Downloaded, Transcoding)
            | (Transcoding, Uploading)
            | (Uploading, Uploaded) => true,
            // Rollbacks
            (Downloading, Pending)
            | (Downloaded, Pending)
            | (Transcoding, Downloaded)
            | (Transcoding, Pending)
            | (Uploading, Pending) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
