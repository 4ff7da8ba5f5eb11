//! OAuth token repository.
//!
//! Stores opaque encrypted rows; all cryptography lives in [`crate::vault`].

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::OAuthTokenDbModel;
use crate::database::retry_on_sqlite_busy;
use crate::database::time::next_version;

/// OAuth token repository trait.
#[async_trait]
pub trait TokenRepository: Send + Sync {
    async fn get_token(&self, provider: &str, channel: &str) -> Result<Option<OAuthTokenDbModel>>;
    /// Insert or replace the whole row.
    async fn upsert_token(&self, token: &OAuthTokenDbModel) -> Result<()>;
    /// Swap only the wrapped data key, guarded by the observed `updated_at`.
    async fn update_wrapped_key(
        &self,
        provider: &str,
        channel: &str,
        wrapped_key: &[u8],
        kek_id: &str,
        expected_updated_at: i64,
    ) -> Result<bool>;
    async fn delete_token(&self, provider: &str, channel: &str) -> Result<bool>;
}

/// SQLx implementation of TokenRepository.
pub struct SqlxTokenRepository {
    pool: SqlitePool,
}

impl SqlxTokenRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenRepository for SqlxTokenRepository {
    async fn get_token(&self, provider: &str, channel: &str) -> Result<Option<OAuthTokenDbModel>> {
        let row = sqlx::query_as::<_, OAuthTokenDbModel>(
            "SELECT * FROM oauth_tokens WHERE provider = ? AND channel = ?",
        )
        .bind(provider)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert_token(&self, token: &OAuthTokenDbModel) -> Result<()> {
        retry_on_sqlite_busy("token_upsert", || async {
            sqlx::query(
                r#"
                INSERT INTO oauth_tokens (provider, channel, format_version, wrapped_key, kek_id, ciphertext, expires_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (provider, channel) DO UPDATE SET
                    format_version = excluded.format_version,
                    wrapped_key = excluded.wrapped_key,
                    kek_id = excluded.kek_id,
                    ciphertext = excluded.ciphertext,
                    expires_at = excluded.expires_at,
                    updated_at = MAX(excluded.updated_at, oauth_tokens.updated_at + 1)
                "#,
            )
            .bind(&token.provider)
            .bind(&token.channel)
            .bind(token.format_version)
            .bind(&token.wrapped_key)
            .bind(&token.kek_id)
            .bind(&token.ciphertext)
            .bind(token.expires_at)
            .bind(token.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn update_wrapped_key(
        &self,
        provider: &str,
        channel: &str,
        wrapped_key: &[u8],
        kek_id: &str,
        expected_updated_at: i64,
    ) -> Result<bool> {
        retry_on_sqlite_busy("token_update_wrapped_key", || async {
            let result = sqlx::query(
                r#"
                UPDATE oauth_tokens SET wrapped_key = ?, kek_id = ?, updated_at = ?
                WHERE provider = ? AND channel = ? AND format_version = 2 AND updated_at = ?
                "#,
            )
            .bind(wrapped_key)
            .bind(kek_id)
            .bind(next_version(expected_updated_at))
            .bind(provider)
            .bind(channel)
            .bind(expected_updated_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn delete_token(&self, provider: &str, channel: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM oauth_tokens WHERE provider = ? AND channel = ?")
            .bind(provider)
            .bind(channel)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
