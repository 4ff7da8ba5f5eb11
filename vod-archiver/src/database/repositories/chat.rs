//! Chat message repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{ChatMessageDbModel, NewChatMessage};
use crate::database::retry_on_sqlite_busy;
use crate::database::time::now_ms;

/// Chat message repository trait. There is deliberately no update operation.
#[async_trait]
pub trait ChatRepository: Send + Sync {
    /// Append a batch in one transaction, skipping already-seen message IDs.
    /// Returns the number of rows inserted.
    async fn append_batch(&self, messages: &[NewChatMessage]) -> Result<u64>;
    async fn list_for_vod(&self, channel: &str, vod_id: i64, limit: i64) -> Result<Vec<ChatMessageDbModel>>;
    async fn count_for_vod(&self, channel: &str, vod_id: i64) -> Result<i64>;
}

/// SQLx implementation of ChatRepository.
pub struct SqlxChatRepository {
    pool: SqlitePool,
}

impl SqlxChatRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatRepository for SqlxChatRepository {
    async fn append_batch(&self, messages: &[NewChatMessage]) -> Result<u64> {
        if messages.is_empty() {
            return Ok(0);
        }

        retry_on_sqlite_busy("chat_append_batch", || async {
            let now = now_ms();
            let mut tx = self.pool.begin().await?;
            let mut inserted = 0u64;
            for msg in messages {
                let result = sqlx::query(
                    r#"
                    INSERT INTO chat_messages (channel, vod_id, message_id, user_id, username, content, sent_at, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT (channel, message_id) DO NOTHING
                    "#,
                )
                .bind(&msg.channel)
                .bind(msg.vod_id)
                .bind(&msg.message_id)
                .bind(&msg.user_id)
                .bind(&msg.username)
                .bind(&msg.content)
                .bind(msg.sent_at)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                inserted += result.rows_affected();
            }
            tx.commit().await?;
            Ok(inserted)
        })
        .await
    }

    async fn list_for_vod(&self, channel: &str, vod_id: i64, limit: i64) -> Result<Vec<ChatMessageDbModel>> {
        let rows = sqlx::query_as::<_, ChatMessageDbModel>(
            "SELECT * FROM chat_messages WHERE channel = ? AND vod_id = ? ORDER BY sent_at, id LIMIT ?",
        )
        .bind(channel)
        .bind(vod_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count_for_vod(&self, channel: &str, vod_id: i64) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM chat_messages WHERE channel = ? AND vod_id = ?")
                .bind(channel)
                .bind(vod_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
