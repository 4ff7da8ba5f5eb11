//! Chat source contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One chat line as received from the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Platform message id, unique per channel.
    pub message_id: String,
    pub user_id: String,
    /// Display name, falling back to the login.
    pub username: String,
    pub content: String,
    /// Unix epoch milliseconds.
    pub sent_at: i64,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Chat connection failed: {0}")]
    Connect(String),

    #[error("Chat protocol error: {0}")]
    Protocol(String),

    /// The server asked us to reconnect or dropped the connection.
    #[error("Chat connection closed: {0}")]
    Closed(String),
}

/// A live connection yielding chat messages.
#[async_trait]
pub trait ChatStream: Send {
    /// Next chat message. `Ok(None)` means the connection ended cleanly.
    ///
    /// Must be cancel-safe: dropping the future loses no message that was
    /// already read off the connection.
    async fn next_message(&mut self) -> Result<Option<ChatMessage>, ChatError>;
}

/// Opens chat connections for a channel.
#[async_trait]
pub trait ChatSource: Send + Sync {
    async fn connect(&self, channel: &str) -> Result<Box<dyn ChatStream>, ChatError>;
}
