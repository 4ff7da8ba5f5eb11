//! Retention job: frees local media of VODs outside the retained set.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::policy::{Decision, RetentionPolicy};
use crate::Result;
use crate::config::RetentionConfig;
use crate::database::models::VodDbModel;
use crate::database::repositories::VodRepository;
use crate::database::time::now_ms;
use crate::metrics::{ChannelMetrics, Counter};
use crate::utils::fs;

/// Outcome of one retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub cleaned: u64,
    /// Outside the retained set but protected, or lost to a concurrent update.
    pub skipped: u64,
    pub errored: u64,
    /// Local files kept by policy.
    pub retained: u64,
    pub bytes_freed: u64,
    /// Dry-run only.
    pub would_clean: u64,
    pub would_free_bytes: u64,
    pub dry_run: bool,
}

enum Cleanup {
    Cleaned(u64),
    /// The row changed after it was listed.
    Lost,
}

pub struct RetentionJob {
    channel: String,
    config: RetentionConfig,
    policy: RetentionPolicy,
    vods: Arc<dyn VodRepository>,
    metrics: ChannelMetrics,
    run_lock: Mutex<()>,
}

impl RetentionJob {
    pub fn new(
        channel: impl Into<String>,
        config: RetentionConfig,
        vods: Arc<dyn VodRepository>,
        metrics: ChannelMetrics,
    ) -> Self {
        Self {
            channel: channel.into(),
            policy: RetentionPolicy::from(&config),
            config,
            vods,
            metrics,
            run_lock: Mutex::new(()),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_active(&self) -> bool {
        self.policy.is_active()
    }

    /// Run on the configured interval until cancelled. Returns immediately
    /// if no threshold is configured.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.is_active() {
            info!(channel = %self.channel, "No retention thresholds configured, retention disabled");
            return;
        }

        let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(channel = %self.channel, "Retention job shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(channel = %self.channel, error = %e, "Retention run failed");
                    }
                }
            }
        }
    }

    /// Evaluate every VOD of the channel once.
    pub async fn run_once(&self) -> Result<RetentionReport> {
        let _guard = self.run_lock.lock().await;
        let mut report = RetentionReport {
            dry_run: self.config.dry_run,
            ..Default::default()
        };
        if !self.is_active() {
            return Ok(report);
        }

        let now = now_ms();
        let vods = self.vods.list_by_date_desc(&self.channel).await?;

        for (vod, decision) in self.policy.evaluate(&vods, now) {
            match decision {
                Decision::NoFile => {}
                Decision::Retain => report.retained += 1,
                Decision::Skip(reason) => {
                    debug!(channel = %self.channel, vod_id = vod.id, ?reason, "Retention skipped VOD");
                    report.skipped += 1;
                }
                Decision::Delete if self.config.dry_run => {
                    let bytes = self.local_size(vod).await;
                    info!(
                        channel = %self.channel,
                        vod_id = vod.id,
                        path = vod.downloaded_path.as_deref().unwrap_or_default(),
                        bytes,
                        "Dry run: would delete local media"
                    );
                    report.would_clean += 1;
                    report.would_free_bytes += bytes;
                }
                Decision::Delete => match self.clean(vod).await {
                    Ok(Cleanup::Cleaned(bytes)) => {
                        report.cleaned += 1;
                        report.bytes_freed += bytes;
                    }
                    Ok(Cleanup::Lost) => report.skipped += 1,
                    Err(e) => {
                        warn!(channel = %self.channel, vod_id = vod.id, error = %e, "Failed to delete local media");
                        report.errored += 1;
                    }
                },
            }
        }

        self.metrics.add(Counter::RetentionCleaned, report.cleaned);
        self.metrics.add(Counter::RetentionBytesFreed, report.bytes_freed);
        self.metrics.add(Counter::RetentionErrors, report.errored);

        if report.cleaned + report.errored + report.would_clean > 0 {
            info!(
                channel = %self.channel,
                cleaned = report.cleaned,
                skipped = report.skipped,
                errored = report.errored,
                bytes_freed = report.bytes_freed,
                would_clean = report.would_clean,
                dry_run = report.dry_run,
                "Retention run complete"
            );
        }
        Ok(report)
    }

    async fn local_size(&self, vod: &VodDbModel) -> u64 {
        match vod.downloaded_path.as_deref() {
            Some(path) => fs::file_size(Path::new(path)).await.unwrap_or(0),
            None => 0,
        }
    }

    /// Clear the path under the observed version, then remove the file. A
    /// failed removal puts the path back so the file stays tracked.
    async fn clean(&self, vod: &VodDbModel) -> Result<Cleanup> {
        let Some(path) = vod.downloaded_path.as_deref() else {
            return Ok(Cleanup::Lost);
        };
        let bytes = self.local_size(vod).await;

        let Some(version) = self
            .vods
            .clear_downloaded_path(vod.id, path, vod.updated_at)
            .await?
        else {
            debug!(channel = %self.channel, vod_id = vod.id, "VOD changed before cleanup, skipping");
            return Ok(Cleanup::Lost);
        };

        match fs::remove_file_if_exists(Path::new(path)).await {
            Ok(removed) => {
                debug!(channel = %self.channel, vod_id = vod.id, path, bytes, "Deleted local media");
                Ok(Cleanup::Cleaned(if removed { bytes } else { 0 }))
            }
            Err(e) => {
                if !self.vods.restore_downloaded_path(vod.id, path, version).await? {
                    warn!(channel = %self.channel, vod_id = vod.id, path, "Could not restore path after failed delete");
                }
                Err(e)
            }
        }
    }
}
