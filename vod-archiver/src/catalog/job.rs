//! Catalog backfill job.
//!
//! Each run does a head scan for new uploads, then resumes history paging
//! from the persisted cursor. Rows are only ever inserted if absent, so runs
//! can overlap or repeat without duplicating VODs.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{CatalogClient, CatalogError, CatalogPage, CatalogVideo};
use super::cursor::{BackfillCursor, CursorStore};
use crate::config::CatalogConfig;
use crate::database::models::NewVod;
use crate::database::repositories::{KvRepository, VodRepository};
use crate::database::time::now_ms;
use crate::metrics::{ChannelMetrics, Counter};
use crate::resilience::CircuitBreaker;

/// Outcome of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub pages_fetched: u32,
    pub inserted: u64,
    /// Items already present or excluded by a cap.
    pub skipped: u64,
    /// History paging has reached the end of the listing.
    pub history_exhausted: bool,
    /// The breaker was open; no upstream call was made.
    pub breaker_denied: bool,
}

/// Why a page loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageOutcome {
    /// Keep paging.
    Continue,
    /// Every item on the page was already known.
    NothingNew,
    /// `max_vods` reached, or the caller's insert budget ran out mid-page.
    CapReached,
    /// Items are older than `max_age_days`; nothing older is wanted.
    TooOld,
}

/// Per-channel catalog backfill.
pub struct CatalogBackfillJob {
    channel: String,
    config: CatalogConfig,
    client: Arc<dyn CatalogClient>,
    vods: Arc<dyn VodRepository>,
    cursor: CursorStore,
    breaker: Arc<CircuitBreaker>,
    metrics: ChannelMetrics,
    /// Serializes scheduled runs with admin-triggered ones.
    run_lock: Mutex<()>,
}

impl CatalogBackfillJob {
    pub fn new(
        channel: impl Into<String>,
        config: CatalogConfig,
        client: Arc<dyn CatalogClient>,
        vods: Arc<dyn VodRepository>,
        kv: Arc<dyn KvRepository>,
        breaker: Arc<CircuitBreaker>,
        metrics: ChannelMetrics,
    ) -> Self {
        let channel = channel.into();
        Self {
            cursor: CursorStore::new(channel.clone(), kv),
            channel,
            config,
            client,
            vods,
            breaker,
            metrics,
            run_lock: Mutex::new(()),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Run on the configured interval until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(channel = %self.channel, "Catalog job shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(channel = %self.channel, error = %e, "Catalog run failed");
                    }
                }
            }
        }
    }

    /// One scheduled run: head scan, then history backfill.
    pub async fn run_once(&self) -> Result<BackfillReport, CatalogError> {
        let _guard = self.run_lock.lock().await;
        self.guarded(None, true).await
    }

    /// Admin trigger: a full run right now.
    pub async fn trigger_scan(&self) -> Result<BackfillReport, CatalogError> {
        self.run_once().await
    }

    /// Admin trigger: a history pass inserting at most `max_items` rows.
    pub async fn trigger_backfill(&self, max_items: u64) -> Result<BackfillReport, CatalogError> {
        let _guard = self.run_lock.lock().await;
        self.guarded(Some(max_items), false).await
    }

    async fn guarded(&self, budget: Option<u64>, head_scan: bool) -> Result<BackfillReport, CatalogError> {
        if !self.breaker.allow().await {
            self.metrics.incr(Counter::BreakerDenied);
            debug!(channel = %self.channel, "Catalog run skipped, breaker open");
            return Ok(BackfillReport {
                breaker_denied: true,
                ..Default::default()
            });
        }

        self.metrics.incr(Counter::CatalogRuns);
        let mut report = BackfillReport::default();
        let result = self.run_passes(&mut report, budget, head_scan).await;

        self.metrics.add(Counter::CatalogPagesFetched, u64::from(report.pages_fetched));
        self.metrics.add(Counter::CatalogVodsInserted, report.inserted);

        match result {
            Ok(()) => {
                self.breaker.record_success().await;
                info!(
                    channel = %self.channel,
                    pages = report.pages_fetched,
                    inserted = report.inserted,
                    skipped = report.skipped,
                    exhausted = report.history_exhausted,
                    "Catalog run complete"
                );
                Ok(report)
            }
            Err(e) => {
                self.metrics.incr(Counter::CatalogErrors);
                if e.is_upstream() {
                    self.breaker.record_failure().await;
                } else {
                    // No upstream verdict; a half-open trial goes back
                    self.breaker.release_trial().await;
                }
                Err(e)
            }
        }
    }

    async fn run_passes(
        &self,
        report: &mut BackfillReport,
        budget: Option<u64>,
        head_scan: bool,
    ) -> Result<(), CatalogError> {
        let state = self.cursor.load().await?;

        // Before history paging has started, the history pass begins at the
        // newest page and covers the head too.
        if head_scan && state.is_some() {
            self.head_scan(report).await?;
        }

        let state = state.unwrap_or_default();
        report.history_exhausted = state.exhausted;
        if !state.exhausted {
            self.history_pass(state, report, budget).await?;
        }
        Ok(())
    }

    async fn head_scan(&self, report: &mut BackfillReport) -> Result<(), CatalogError> {
        let mut cursor: Option<String> = None;
        loop {
            let page = self.fetch(cursor.as_deref(), report).await?;
            let outcome = self.ingest(&page.videos, report, &mut None).await?;
            if outcome != PageOutcome::Continue {
                debug!(channel = %self.channel, ?outcome, "Head scan stopped");
                return Ok(());
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(()),
            }
        }
    }

    async fn history_pass(
        &self,
        mut state: BackfillCursor,
        report: &mut BackfillReport,
        budget: Option<u64>,
    ) -> Result<(), CatalogError> {
        let mut remaining = budget;
        loop {
            if remaining == Some(0) {
                return Ok(());
            }
            let page = self.fetch(state.cursor.as_deref(), report).await?;
            let outcome = self.ingest(&page.videos, report, &mut remaining).await?;

            match outcome {
                // Leave the cursor on this page so its remaining items are
                // picked up next time.
                PageOutcome::CapReached => {
                    self.cursor.save(&state).await?;
                    return Ok(());
                }
                PageOutcome::TooOld => {
                    state.exhausted = true;
                }
                PageOutcome::Continue | PageOutcome::NothingNew => match page.next_cursor {
                    Some(next) => state.cursor = Some(next),
                    None => state.exhausted = true,
                },
            }

            self.cursor.save(&state).await?;
            if state.exhausted {
                report.history_exhausted = true;
                info!(channel = %self.channel, "History backfill exhausted");
                return Ok(());
            }
        }
    }

    async fn fetch(
        &self,
        cursor: Option<&str>,
        report: &mut BackfillReport,
    ) -> Result<CatalogPage, CatalogError> {
        let page = self
            .client
            .list_videos(&self.channel, cursor, self.config.page_size)
            .await?;
        report.pages_fetched += 1;
        debug!(
            channel = %self.channel,
            cursor = cursor.unwrap_or("<head>"),
            items = page.videos.len(),
            "Fetched catalog page"
        );
        Ok(page)
    }

    /// Insert a page's items, honoring the caps.
    async fn ingest(
        &self,
        videos: &[CatalogVideo],
        report: &mut BackfillReport,
        budget: &mut Option<u64>,
    ) -> Result<PageOutcome, CatalogError> {
        let age_cutoff = self
            .config
            .max_age_days
            .map(|days| now_ms() - i64::from(days) * 24 * 60 * 60 * 1000);
        let mut count = match self.config.max_vods {
            Some(_) => self.vods.count_for_channel(&self.channel).await? as u64,
            None => 0,
        };

        let mut new_rows = 0u64;
        for (index, video) in videos.iter().enumerate() {
            if age_cutoff.is_some_and(|cutoff| video.created_at < cutoff) {
                report.skipped += (videos.len() - index) as u64;
                return Ok(PageOutcome::TooOld);
            }
            if self.config.max_vods.is_some_and(|max| count >= max) || *budget == Some(0) {
                report.skipped += (videos.len() - index) as u64;
                return Ok(PageOutcome::CapReached);
            }

            let vod = NewVod {
                channel: self.channel.clone(),
                twitch_vod_id: video.id.clone(),
                title: video.title.clone(),
                description: video.description.clone(),
                date: video.created_at,
                duration_secs: video.duration_secs,
                priority: 0,
            };
            if self.vods.insert_if_absent(&vod).await? {
                new_rows += 1;
                count += 1;
                report.inserted += 1;
                if let Some(left) = budget.as_mut() {
                    *left -= 1;
                }
                debug!(channel = %self.channel, vod = %video.id, "Discovered VOD");
            } else {
                report.skipped += 1;
                // A live VOD keeps growing between scans
                if let Some(duration) = video.duration_secs
                    && self.vods.extend_duration(&self.channel, &video.id, duration).await?
                {
                    debug!(channel = %self.channel, vod = %video.id, duration, "Extended VOD duration");
                }
            }
        }

        if new_rows == 0 {
            Ok(PageOutcome::NothingNew)
        } else {
            Ok(PageOutcome::Continue)
        }
    }
}
