//! VOD repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{DownloadState, NewVod, VodDbModel};
use crate::database::retry_on_sqlite_busy;
use crate::database::time::{next_version, now_ms};
use crate::{Error, Result};

/// How a state transition treats `downloaded_path`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathUpdate<'a> {
    Keep,
    Set(&'a str),
    Clear,
}

/// A conditional lifecycle transition.
///
/// Applied as one row update guarded by both the expected state and the
/// expected `updated_at`, so a worker that lost ownership of the VOD (another
/// task or process advanced it first) observes zero affected rows.
#[derive(Debug, Clone)]
pub struct StateTransition<'a> {
    pub id: i64,
    pub from: DownloadState,
    pub to: DownloadState,
    pub expected_updated_at: i64,
    pub path: PathUpdate<'a>,
    pub youtube_url: Option<&'a str>,
    pub failure_reason: Option<&'a str>,
}

impl<'a> StateTransition<'a> {
    pub fn new(vod: &VodDbModel, from: DownloadState, to: DownloadState) -> Self {
        Self {
            id: vod.id,
            from,
            to,
            expected_updated_at: vod.updated_at,
            path: PathUpdate::Keep,
            youtube_url: None,
            failure_reason: None,
        }
    }

    pub fn with_path(mut self, path: PathUpdate<'a>) -> Self {
        self.path = path;
        self
    }

    pub fn with_youtube_url(mut self, url: &'a str) -> Self {
        self.youtube_url = Some(url);
        self
    }

    pub fn with_failure_reason(mut self, reason: &'a str) -> Self {
        self.failure_reason = Some(reason);
        self
    }
}

/// VOD repository trait.
#[async_trait]
pub trait VodRepository: Send + Sync {
    /// Insert unless `(channel, twitch_vod_id)` exists. Returns whether a row was created.
    async fn insert_if_absent(&self, vod: &NewVod) -> Result<bool>;
    async fn get_vod(&self, id: i64) -> Result<VodDbModel>;
    async fn find_by_twitch_id(&self, channel: &str, twitch_vod_id: &str) -> Result<Option<VodDbModel>>;
    async fn count_for_channel(&self, channel: &str) -> Result<i64>;

    /// Highest priority, then earliest date, among non-terminal VODs.
    async fn next_actionable(&self, channel: &str) -> Result<Option<VodDbModel>>;
    async fn list_in_states(&self, channel: &str, states: &[DownloadState]) -> Result<Vec<VodDbModel>>;
    /// All VODs for a channel, newest first.
    async fn list_by_date_desc(&self, channel: &str) -> Result<Vec<VodDbModel>>;
    /// VODs that may cover `[from_ms, to_ms]`: the newest one started at or
    /// before `from_ms` plus every later one up to `to_ms`, newest first.
    async fn list_covering(&self, channel: &str, from_ms: i64, to_ms: i64) -> Result<Vec<VodDbModel>>;
    /// Grow a VOD's recorded duration, as reported while it is still live.
    /// Leaves `updated_at` alone. Returns whether the row changed.
    async fn extend_duration(&self, channel: &str, twitch_vod_id: &str, duration_secs: i64) -> Result<bool>;

    /// Apply a conditional transition. Returns the new `updated_at` when it won.
    async fn transition(&self, transition: &StateTransition<'_>) -> Result<Option<i64>>;

    /// Bump `updated_at` without changing state, claiming the row for a
    /// step that starts in the current state. Returns the new version when it won.
    async fn touch(&self, id: i64, state: DownloadState, expected_updated_at: i64) -> Result<Option<i64>>;

    /// Clear `downloaded_path` if the row is unchanged since it was observed
    /// and not in an active state. Returns the new `updated_at` when it won.
    async fn clear_downloaded_path(&self, id: i64, expected_path: &str, expected_updated_at: i64) -> Result<Option<i64>>;
    /// Undo [`VodRepository::clear_downloaded_path`] after a failed file removal.
    async fn restore_downloaded_path(&self, id: i64, path: &str, expected_updated_at: i64) -> Result<bool>;
}

/// SQLx implementation of VodRepository.
pub struct SqlxVodRepository {
    pool: SqlitePool,
}

impl SqlxVodRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn active_states_sql() -> String {
    DownloadState::ALL
        .iter()
        .filter(|s| s.is_active())
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl VodRepository for SqlxVodRepository {
    async fn insert_if_absent(&self, vod: &NewVod) -> Result<bool> {
        retry_on_sqlite_busy("vod_insert_if_absent", || async {
            let now = now_ms();
            let result = sqlx::query(
                r#"
                INSERT INTO vods (channel, twitch_vod_id, title, description, date, duration_secs,
                                  priority, download_state, processed, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?)
                ON CONFLICT (channel, twitch_vod_id) DO NOTHING
                "#,
            )
            .bind(&vod.channel)
            .bind(&vod.twitch_vod_id)
            .bind(&vod.title)
            .bind(&vod.description)
            .bind(vod.date)
            .bind(vod.duration_secs)
            .bind(vod.priority)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn get_vod(&self, id: i64) -> Result<VodDbModel> {
        sqlx::query_as::<_, VodDbModel>("SELECT * FROM vods WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Vod", id.to_string()))
    }

    async fn find_by_twitch_id(&self, channel: &str, twitch_vod_id: &str) -> Result<Option<VodDbModel>> {
        let vod = sqlx::query_as::<_, VodDbModel>(
            "SELECT * FROM vods WHERE channel = ? AND twitch_vod_id = ?",
        )
        .bind(channel)
        .bind(twitch_vod_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(vod)
    }

    async fn count_for_channel(&self, channel: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM vods WHERE channel = ?")
            .bind(channel)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn next_actionable(&self, channel: &str) -> Result<Option<VodDbModel>> {
        let vod = sqlx::query_as::<_, VodDbModel>(
            r#"
            SELECT * FROM vods
            WHERE channel = ? AND processed = 0
              AND download_state NOT IN ('uploaded', 'failed')
            ORDER BY priority DESC, date ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?;
        Ok(vod)
    }

    async fn list_in_states(&self, channel: &str, states: &[DownloadState]) -> Result<Vec<VodDbModel>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; states.len()].join(", ");
        let sql = format!(
            "SELECT * FROM vods WHERE channel = ? AND download_state IN ({}) ORDER BY id",
            placeholders
        );
        let mut query = sqlx::query_as::<_, VodDbModel>(&sql).bind(channel);
        for state in states {
            query = query.bind(state.as_str());
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn list_by_date_desc(&self, channel: &str) -> Result<Vec<VodDbModel>> {
        let vods = sqlx::query_as::<_, VodDbModel>(
            "SELECT * FROM vods WHERE channel = ? ORDER BY date DESC, id DESC",
        )
        .bind(channel)
        .fetch_all(&self.pool)
        .await?;
        Ok(vods)
    }

    async fn list_covering(&self, channel: &str, from_ms: i64, to_ms: i64) -> Result<Vec<VodDbModel>> {
        let vods = sqlx::query_as::<_, VodDbModel>(
            r#"
            SELECT * FROM vods
            WHERE channel = ? AND date <= ?
              AND date >= COALESCE((SELECT MAX(date) FROM vods WHERE channel = ? AND date <= ?), ?)
            ORDER BY date DESC, id DESC
            "#,
        )
        .bind(channel)
        .bind(to_ms)
        .bind(channel)
        .bind(from_ms)
        .bind(from_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(vods)
    }

    async fn extend_duration(&self, channel: &str, twitch_vod_id: &str, duration_secs: i64) -> Result<bool> {
        retry_on_sqlite_busy("vod_extend_duration", || async {
            let result = sqlx::query(
                r#"
                UPDATE vods SET duration_secs = ?
                WHERE channel = ? AND twitch_vod_id = ?
                  AND (duration_secs IS NULL OR duration_secs < ?)
                "#,
            )
            .bind(duration_secs)
            .bind(channel)
            .bind(twitch_vod_id)
            .bind(duration_secs)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn transition(&self, t: &StateTransition<'_>) -> Result<Option<i64>> {
        if !t.from.can_transition_to(t.to) {
            return Err(Error::InvalidStateTransition {
                from: t.from.to_string(),
                to: t.to.to_string(),
            });
        }

        let (path_mode, path_value) = match t.path {
            PathUpdate::Keep => (0i64, None),
            PathUpdate::Set(path) => (1, Some(path)),
            PathUpdate::Clear => (2, None),
        };
        let processed = t.to == DownloadState::Uploaded;
        let failure_reason = (t.to == DownloadState::Failed).then_some(t.failure_reason).flatten();

        retry_on_sqlite_busy("vod_transition", || async {
            let version = next_version(t.expected_updated_at);
            let result = sqlx::query(
                r#"
                UPDATE vods SET
                    download_state = ?,
                    downloaded_path = CASE ? WHEN 0 THEN downloaded_path WHEN 1 THEN ? ELSE NULL END,
                    processed = ?,
                    youtube_url = COALESCE(?, youtube_url),
                    failure_reason = ?,
                    updated_at = ?
                WHERE id = ? AND download_state = ? AND updated_at = ?
                "#,
            )
            .bind(t.to.as_str())
            .bind(path_mode)
            .bind(path_value)
            .bind(processed)
            .bind(t.youtube_url)
            .bind(failure_reason)
            .bind(version)
            .bind(t.id)
            .bind(t.from.as_str())
            .bind(t.expected_updated_at)
            .execute(&self.pool)
            .await?;
            Ok((result.rows_affected() == 1).then_some(version))
        })
        .await
    }

    async fn touch(&self, id: i64, state: DownloadState, expected_updated_at: i64) -> Result<Option<i64>> {
        retry_on_sqlite_busy("vod_touch", || async {
            let version = next_version(expected_updated_at);
            let result = sqlx::query(
                "UPDATE vods SET updated_at = ? WHERE id = ? AND download_state = ? AND updated_at = ?",
            )
            .bind(version)
            .bind(id)
            .bind(state.as_str())
            .bind(expected_updated_at)
            .execute(&self.pool)
            .await?;
            Ok((result.rows_affected() == 1).then_some(version))
        })
        .await
    }

    async fn clear_downloaded_path(&self, id: i64, expected_path: &str, expected_updated_at: i64) -> Result<Option<i64>> {
        let sql = format!(
            r#"
            UPDATE vods SET downloaded_path = NULL, updated_at = ?
            WHERE id = ? AND downloaded_path = ? AND updated_at = ?
              AND download_state NOT IN ({})
            "#,
            active_states_sql()
        );
        retry_on_sqlite_busy("vod_clear_path", || async {
            let version = next_version(expected_updated_at);
            let result = sqlx::query(&sql)
                .bind(version)
                .bind(id)
                .bind(expected_path)
                .bind(expected_updated_at)
                .execute(&self.pool)
                .await?;
            Ok((result.rows_affected() == 1).then_some(version))
        })
        .await
    }

    async fn restore_downloaded_path(&self, id: i64, path: &str, expected_updated_at: i64) -> Result<bool> {
        retry_on_sqlite_busy("vod_restore_path", || async {
            let result = sqlx::query(
                r#"
                UPDATE vods SET downloaded_path = ?, updated_at = ?
                WHERE id = ? AND downloaded_path IS NULL AND updated_at = ?
                "#,
            )
            .bind(path)
            .bind(next_version(expected_updated_at))
            .bind(id)
            .bind(expected_updated_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }
}
