//! Key/value repository.
//!
//! The `kv` table is the only mutable state shared between job tasks. Writers
//! that need exclusivity use [`KvRepository::compare_and_swap`], keyed on the
//! `updated_at` value they read.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::KvEntryDbModel;
use crate::database::retry_on_sqlite_busy;
use crate::database::time::{next_version, now_ms};

/// Key/value repository trait.
#[async_trait]
pub trait KvRepository: Send + Sync {
    async fn get(&self, channel: &str, key: &str) -> Result<Option<KvEntryDbModel>>;

    /// Create the row if it does not exist. Returns its version when created.
    async fn insert_if_absent(&self, channel: &str, key: &str, value: &str) -> Result<Option<i64>>;

    /// Replace the value only if the row still carries `expected_updated_at`.
    /// Returns the new version on success, `None` when another writer got there first.
    async fn compare_and_swap(
        &self,
        channel: &str,
        key: &str,
        value: &str,
        expected_updated_at: i64,
    ) -> Result<Option<i64>>;

    /// Unconditional upsert for single-owner keys. Returns the new version.
    async fn put(&self, channel: &str, key: &str, value: &str) -> Result<i64>;

    /// Explicit reset. Returns whether a row was removed.
    async fn delete(&self, channel: &str, key: &str) -> Result<bool>;
}

/// SQLx implementation of KvRepository.
pub struct SqlxKvRepository {
    pool: SqlitePool,
}

impl SqlxKvRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KvRepository for SqlxKvRepository {
    async fn get(&self, channel: &str, key: &str) -> Result<Option<KvEntryDbModel>> {
        let entry = sqlx::query_as::<_, KvEntryDbModel>(
            "SELECT channel, key, value, updated_at FROM kv WHERE channel = ? AND key = ?",
        )
        .bind(channel)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn insert_if_absent(&self, channel: &str, key: &str, value: &str) -> Result<Option<i64>> {
        retry_on_sqlite_busy("kv_insert_if_absent", || async {
            let version = now_ms();
            let result = sqlx::query(
                "INSERT INTO kv (channel, key, value, updated_at) VALUES (?, ?, ?, ?) ON CONFLICT (channel, key) DO NOTHING",
            )
            .bind(channel)
            .bind(key)
            .bind(value)
            .bind(version)
            .execute(&self.pool)
            .await?;
            Ok((result.rows_affected() == 1).then_some(version))
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        channel: &str,
        key: &str,
        value: &str,
        expected_updated_at: i64,
    ) -> Result<Option<i64>> {
        retry_on_sqlite_busy("kv_compare_and_swap", || async {
            let version = next_version(expected_updated_at);
            let result = sqlx::query(
                "UPDATE kv SET value = ?, updated_at = ? WHERE channel = ? AND key = ? AND updated_at = ?",
            )
            .bind(value)
            .bind(version)
            .bind(channel)
            .bind(key)
            .bind(expected_updated_at)
            .execute(&self.pool)
            .await?;
            Ok((result.rows_affected() == 1).then_some(version))
        })
        .await
    }

    async fn put(&self, channel: &str, key: &str, value: &str) -> Result<i64> {
        retry_on_sqlite_busy("kv_put", || async {
            let (version,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO kv (channel, key, value, updated_at) VALUES (?, ?, ?, ?)
                ON CONFLICT (channel, key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = MAX(excluded.updated_at, kv.updated_at + 1)
                RETURNING updated_at
                "#,
            )
            .bind(channel)
            .bind(key)
            .bind(value)
            .bind(now_ms())
            .fetch_one(&self.pool)
            .await?;
            Ok(version)
        })
        .await
    }

    async fn delete(&self, channel: &str, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv WHERE channel = ? AND key = ?")
            .bind(channel)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
