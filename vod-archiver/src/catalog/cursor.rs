//! Persisted history backfill position.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;
use crate::database::repositories::KvRepository;
use crate::database::time::now_ms;

/// `kv` key holding the cursor.
pub const BACKFILL_CURSOR_KEY: &str = "backfill_cursor";

/// Where history paging resumes. Only advanced, never reset by a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillCursor {
    #[serde(default)]
    pub cursor: Option<String>,
    /// The upstream reported no older pages (or the age cap was reached).
    #[serde(default)]
    pub exhausted: bool,
    #[serde(default)]
    pub last_run_at: Option<i64>,
}

/// Reads and writes [`BackfillCursor`] for one channel.
pub struct CursorStore {
    channel: String,
    kv: Arc<dyn KvRepository>,
}

impl CursorStore {
    pub fn new(channel: impl Into<String>, kv: Arc<dyn KvRepository>) -> Self {
        Self {
            channel: channel.into(),
            kv,
        }
    }

    /// `None` when history paging has never started.
    pub async fn load(&self) -> Result<Option<BackfillCursor>> {
        let Some(entry) = self.kv.get(&self.channel, BACKFILL_CURSOR_KEY).await? else {
            return Ok(None);
        };
        match entry.decode() {
            Ok(cursor) => Ok(Some(cursor)),
            Err(e) => {
                // Restarting history paging is safe: inserts are idempotent
                warn!(channel = %self.channel, error = %e, "Unreadable backfill cursor, restarting history");
                Ok(None)
            }
        }
    }

    pub async fn save(&self, cursor: &BackfillCursor) -> Result<()> {
        let stamped = BackfillCursor {
            last_run_at: Some(now_ms()),
            ..cursor.clone()
        };
        self.kv
            .put(&self.channel, BACKFILL_CURSOR_KEY, &serde_json::to_string(&stamped)?)
            .await?;
        Ok(())
    }
}
