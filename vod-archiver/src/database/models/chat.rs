//! Chat message database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Chat message database model. Rows are append-only.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ChatMessageDbModel {
    pub id: i64,
    pub channel: String,
    /// Foreign key to `vods.id`
    pub vod_id: i64,
    /// Platform message ID, unique per channel
    pub message_id: String,
    pub user_id: String,
    pub username: String,
    pub content: String,
    /// Unix epoch milliseconds as reported by the platform
    pub sent_at: i64,
    pub created_at: i64,
}

/// A chat message bound to a VOD, ready for insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChatMessage {
    pub channel: String,
    pub vod_id: i64,
    pub message_id: String,
    pub user_id: String,
    pub username: String,
    pub content: String,
    pub sent_at: i64,
}
