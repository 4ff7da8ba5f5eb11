//! Retry helpers for contended SQLite writes.
//!
//! Every job task writes through the same database file, so short bursts of
//! `SQLITE_BUSY` / `SQLITE_LOCKED` are expected. Conditional updates are
//! idempotent and can be replayed safely.

use std::borrow::Cow;
use std::future::Future;

use tokio::time::sleep;
use tracing::debug;

use crate::resilience::RetryConfig;
use crate::{Error, Result};

/// Backoff used for busy retries: short, capped, jittered.
fn busy_backoff() -> RetryConfig {
    RetryConfig {
        max_retries: 10,
        initial_delay_ms: 10,
        max_delay_ms: 2_000,
        backoff_multiplier: 2.0,
        use_jitter: true,
    }
}

/// Whether an error is SQLite reporting lock contention.
pub fn is_sqlite_busy_error(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let sqlx::Error::Database(db_err) = sqlx_err else {
        let msg = sqlx_err.to_string().to_ascii_lowercase();
        return msg.contains("database is locked") || msg.contains("database is busy");
    };

    // 5 = SQLITE_BUSY, 6 = SQLITE_LOCKED (extended codes keep the low byte)
    let code = db_err.code().map(Cow::into_owned);
    if let Some(code) = code.as_deref().and_then(|c| c.parse::<i64>().ok())
        && matches!(code & 0xff, 5 | 6)
    {
        return true;
    }

    let msg = db_err.message().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

/// Run `op`, replaying it while SQLite reports busy/locked.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let backoff = busy_backoff();
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_sqlite_busy_error(&err) && backoff.should_retry(attempt) => {
                attempt += 1;
                let delay = backoff.delay_for_attempt(attempt);
                debug!(
                    op = op_name,
                    attempt,
                    max = backoff.max_retries,
                    "SQLite busy, retrying in {:?}",
                    delay
                );
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
