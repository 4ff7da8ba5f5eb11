//! Per-channel processing job.
//!
//! Each tick picks the most urgent unfinished VOD and advances it through
//! download, transcode and upload. Every state change is a compare-and-set
//! on the row's `updated_at`, so a tick that loses a race to another worker
//! backs off instead of clobbering the winner's update.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::layout::MediaLayout;
use super::recovery::{RecoveryReport, StartupRecovery};
use super::steps::{Downloader, StepError, Transcoder, Uploader};
use crate::database::models::{DownloadState, VodDbModel};
use crate::database::repositories::{PathUpdate, StateTransition, VodRepository};
use crate::metrics::{ChannelMetrics, Counter};
use crate::resilience::CircuitBreaker;
use crate::utils::fs;
use crate::{Error, Result};

/// What a tick did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// No unfinished VOD.
    Idle,
    /// The VOD reached `uploaded`.
    Uploaded { vod_id: i64, url: String },
    /// The breaker refused the upstream call; nothing changed.
    BreakerOpen { vod_id: i64 },
    /// A retryable failure; the VOD sits in a stable state for the next tick.
    TransientFailure { vod_id: i64, state: DownloadState },
    Failed { vod_id: i64, reason: String },
    /// Another worker changed the row first.
    LostRace { vod_id: i64 },
    /// The most urgent VOD is mid-step elsewhere.
    Busy { vod_id: i64 },
    /// Credentials are missing; waits for an operator.
    Blocked { vod_id: i64 },
    Cancelled { vod_id: i64 },
}

enum Step {
    Next(VodDbModel),
    Done(TickOutcome),
}

/// Collaborators for the three processing steps.
#[derive(Clone)]
pub struct Processors {
    pub downloader: Arc<dyn Downloader>,
    pub transcoder: Arc<dyn Transcoder>,
    pub uploader: Arc<dyn Uploader>,
}

pub struct ProcessingJob {
    channel: String,
    vods: Arc<dyn VodRepository>,
    processors: Processors,
    breaker: Arc<CircuitBreaker>,
    layout: MediaLayout,
    metrics: ChannelMetrics,
    interval: Duration,
    /// Rows this process left mid-step: interrupted downloads found at
    /// startup and steps abandoned on a storage error. Their active state
    /// is ours to pick up again rather than another worker's.
    reclaimable: Mutex<HashSet<i64>>,
    tick_lock: tokio::sync::Mutex<()>,
}

impl ProcessingJob {
    pub fn new(
        channel: impl Into<String>,
        vods: Arc<dyn VodRepository>,
        processors: Processors,
        breaker: Arc<CircuitBreaker>,
        layout: MediaLayout,
        metrics: ChannelMetrics,
        interval: Duration,
    ) -> Self {
        Self {
            channel: channel.into(),
            vods,
            processors,
            breaker,
            layout,
            metrics,
            interval,
            reclaimable: Mutex::new(HashSet::new()),
            tick_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Roll back rows a previous process left mid-step.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let recovery = StartupRecovery::new(
            Arc::clone(&self.vods),
            Arc::clone(&self.processors.downloader),
            self.layout.clone(),
        );
        let report = recovery.run(&self.channel).await?;
        self.metrics
            .add(Counter::RecoveredOnStartup, u64::from(report.rolled_back) + report.resumable.len() as u64);
        self.reclaimable.lock().extend(report.resumable.iter().copied());
        Ok(report)
    }

    /// Run on the configured interval until cancelled. A step in flight
    /// sees the same token and rolls its VOD back before the loop exits.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(e) = self.recover().await {
            warn!(channel = %self.channel, error = %e, "Startup recovery failed");
        }

        let mut ticker = interval(self.interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(channel = %self.channel, "Processing job shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.tick(&cancel).await {
                        Ok(TickOutcome::Idle) => {}
                        Ok(outcome) => debug!(channel = %self.channel, ?outcome, "Processing tick"),
                        Err(e) => warn!(channel = %self.channel, error = %e, "Processing tick failed"),
                    }
                }
            }
        }
    }

    /// Advance the most urgent unfinished VOD as far as it will go.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickOutcome> {
        let _guard = self.tick_lock.lock().await;
        let Some(mut vod) = self.vods.next_actionable(&self.channel).await? else {
            return Ok(TickOutcome::Idle);
        };

        loop {
            let state = vod.state().ok_or_else(|| {
                Error::validation(format!("VOD {} has unknown state {:?}", vod.id, vod.download_state))
            })?;

            let vod_id = vod.id;
            let reclaim = matches!(state, DownloadState::Downloading | DownloadState::Transcoding)
                && self.reclaimable.lock().remove(&vod_id);
            let step = match self.advance(vod, state, reclaim, cancel).await {
                Ok(step) => step,
                Err(e) => {
                    // The row may be left mid-step; the next tick takes it back
                    self.reclaimable.lock().insert(vod_id);
                    return Err(e);
                }
            };

            match step {
                Step::Next(next) => vod = next,
                Step::Done(outcome) => return Ok(outcome),
            }
        }
    }

    async fn advance(
        &self,
        vod: VodDbModel,
        state: DownloadState,
        reclaim: bool,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        match state {
            DownloadState::Pending => self.download(vod, false, cancel).await,
            DownloadState::Downloading if reclaim => self.download(vod, true, cancel).await,
            DownloadState::Transcoding if reclaim => self.abandon_transcode(vod).await,
            DownloadState::Downloading | DownloadState::Transcoding => {
                Ok(Step::Done(TickOutcome::Busy { vod_id: vod.id }))
            }
            DownloadState::Downloaded => self.transcode(vod, cancel).await,
            DownloadState::Uploading => self.upload(vod, cancel).await,
            DownloadState::Uploaded | DownloadState::Failed => Ok(Step::Done(TickOutcome::Idle)),
        }
    }

    async fn download(&self, vod: VodDbModel, resume: bool, cancel: &CancellationToken) -> Result<Step> {
        if !self.breaker.allow().await {
            if resume {
                self.reclaimable.lock().insert(vod.id);
            }
            return Ok(self.breaker_open(vod.id));
        }
        let result = self.download_allowed(vod, resume, cancel).await;
        self.settle_trial(&result).await;
        result
    }

    async fn download_allowed(&self, vod: VodDbModel, resume: bool, cancel: &CancellationToken) -> Result<Step> {
        let target = self.layout.source_path(&vod);
        let claimed = if resume {
            self.vods
                .touch(vod.id, DownloadState::Downloading, vod.updated_at)
                .await?
        } else {
            let path = target.to_string_lossy();
            self.apply(
                StateTransition::new(&vod, DownloadState::Pending, DownloadState::Downloading)
                    .with_path(PathUpdate::Set(&path)),
            )
            .await?
        };
        if claimed.is_none() {
            return Ok(self.lost_race(vod.id));
        }

        let vod = self.vods.get_vod(vod.id).await?;
        fs::ensure_parent_dir(&target).await?;
        info!(channel = %self.channel, vod_id = vod.id, twitch_vod_id = %vod.twitch_vod_id, resume, "Downloading VOD");

        match self.processors.downloader.download(&vod, &target, cancel).await {
            Ok(()) => {
                self.breaker.record_success().await;
                if self
                    .apply(StateTransition::new(&vod, DownloadState::Downloading, DownloadState::Downloaded))
                    .await?
                    .is_none()
                {
                    return Ok(self.lost_race(vod.id));
                }
                self.metrics.incr(Counter::VodsDownloaded);
                Ok(Step::Next(self.vods.get_vod(vod.id).await?))
            }
            Err(StepError::Permanent(reason)) => {
                // The upstream answered
                self.breaker.record_success().await;
                let outcome = self
                    .fail(&vod, DownloadState::Downloading, &reason, PathUpdate::Clear)
                    .await?;
                fs::remove_file_if_exists(&target).await?;
                Ok(outcome)
            }
            Err(e) => {
                if e.is_upstream_failure() {
                    self.breaker.record_failure().await;
                }
                // Keep a partial file so the next attempt continues it
                let path = if fs::is_file(&target).await {
                    PathUpdate::Keep
                } else {
                    PathUpdate::Clear
                };
                self.apply(
                    StateTransition::new(&vod, DownloadState::Downloading, DownloadState::Pending).with_path(path),
                )
                .await?;
                Ok(self.retry_later(&vod, DownloadState::Pending, &e))
            }
        }
    }

    async fn transcode(&self, vod: VodDbModel, cancel: &CancellationToken) -> Result<Step> {
        let Some(input) = self.local_file(&vod).await else {
            return self.restart_missing(&vod, DownloadState::Downloaded).await;
        };
        let output = self.layout.output_path(&vod);

        if self
            .apply(StateTransition::new(&vod, DownloadState::Downloaded, DownloadState::Transcoding))
            .await?
            .is_none()
        {
            return Ok(self.lost_race(vod.id));
        }
        let vod = self.vods.get_vod(vod.id).await?;
        info!(channel = %self.channel, vod_id = vod.id, "Transcoding VOD");

        match self
            .processors
            .transcoder
            .transcode(&vod, &input, &output, cancel)
            .await
        {
            Ok(()) => {
                let output_str = output.to_string_lossy();
                if self
                    .apply(
                        StateTransition::new(&vod, DownloadState::Transcoding, DownloadState::Uploading)
                            .with_path(PathUpdate::Set(&output_str)),
                    )
                    .await?
                    .is_none()
                {
                    return Ok(self.lost_race(vod.id));
                }
                if input != output {
                    fs::remove_file_if_exists(&input).await?;
                }
                self.metrics.incr(Counter::VodsTranscoded);
                Ok(Step::Next(self.vods.get_vod(vod.id).await?))
            }
            Err(StepError::Permanent(reason)) => {
                fs::remove_file_if_exists(&output).await?;
                self.fail(&vod, DownloadState::Transcoding, &reason, PathUpdate::Keep)
                    .await
            }
            Err(e) => {
                if input != output {
                    fs::remove_file_if_exists(&output).await?;
                }
                self.apply(StateTransition::new(&vod, DownloadState::Transcoding, DownloadState::Downloaded))
                    .await?;
                Ok(self.retry_later(&vod, DownloadState::Downloaded, &e))
            }
        }
    }

    async fn upload(&self, vod: VodDbModel, cancel: &CancellationToken) -> Result<Step> {
        let Some(input) = self.local_file(&vod).await else {
            return self.restart_missing(&vod, DownloadState::Uploading).await;
        };
        if !self.breaker.allow().await {
            return Ok(self.breaker_open(vod.id));
        }
        let result = self.upload_allowed(vod, &input, cancel).await;
        self.settle_trial(&result).await;
        result
    }

    async fn upload_allowed(&self, vod: VodDbModel, input: &Path, cancel: &CancellationToken) -> Result<Step> {
        if self
            .vods
            .touch(vod.id, DownloadState::Uploading, vod.updated_at)
            .await?
            .is_none()
        {
            return Ok(self.lost_race(vod.id));
        }
        let vod = self.vods.get_vod(vod.id).await?;
        info!(channel = %self.channel, vod_id = vod.id, "Uploading VOD");

        match self.processors.uploader.upload(&vod, input, cancel).await {
            Ok(url) => {
                self.breaker.record_success().await;
                if self
                    .apply(
                        StateTransition::new(&vod, DownloadState::Uploading, DownloadState::Uploaded)
                            .with_youtube_url(&url),
                    )
                    .await?
                    .is_none()
                {
                    return Ok(self.lost_race(vod.id));
                }
                self.metrics.incr(Counter::VodsUploaded);
                info!(channel = %self.channel, vod_id = vod.id, %url, "VOD uploaded");
                Ok(Step::Done(TickOutcome::Uploaded { vod_id: vod.id, url }))
            }
            Err(StepError::Permanent(reason)) => {
                self.breaker.record_success().await;
                self.fail(&vod, DownloadState::Uploading, &reason, PathUpdate::Keep)
                    .await
            }
            // The row stays `uploading`; the artifact is kept for the retry
            Err(e) => {
                if e.is_upstream_failure() {
                    self.breaker.record_failure().await;
                }
                Ok(self.retry_later(&vod, DownloadState::Uploading, &e))
            }
        }
    }

    /// Roll back a transcode this process abandoned and run it again.
    async fn abandon_transcode(&self, vod: VodDbModel) -> Result<Step> {
        let output = self.layout.output_path(&vod);
        if vod.downloaded_path.as_deref().map(Path::new) != Some(output.as_path()) {
            fs::remove_file_if_exists(&output).await?;
        }
        info!(channel = %self.channel, vod_id = vod.id, "Rolling back abandoned transcode");
        match self
            .apply(StateTransition::new(&vod, DownloadState::Transcoding, DownloadState::Downloaded))
            .await?
        {
            Some(_) => Ok(Step::Next(self.vods.get_vod(vod.id).await?)),
            None => Ok(self.lost_race(vod.id)),
        }
    }

    /// Hand back a half-open trial when the allowed call ended without an
    /// upstream verdict. Outcomes that recorded one leave the breaker
    /// closed or open, where releasing is a no-op.
    async fn settle_trial(&self, result: &Result<Step>) {
        let settled = matches!(
            result,
            Ok(Step::Next(_))
                | Ok(Step::Done(
                    TickOutcome::Uploaded { .. }
                        | TickOutcome::Failed { .. }
                        | TickOutcome::TransientFailure { .. }
                ))
        );
        if !settled {
            self.breaker.release_trial().await;
        }
    }

    /// `downloaded_path` if the file is still on disk.
    async fn local_file(&self, vod: &VodDbModel) -> Option<PathBuf> {
        let path = PathBuf::from(vod.downloaded_path.as_deref()?);
        fs::is_file(&path).await.then_some(path)
    }

    async fn restart_missing(&self, vod: &VodDbModel, from: DownloadState) -> Result<Step> {
        warn!(channel = %self.channel, vod_id = vod.id, state = %from, "Local media missing, restarting from download");
        let restarted = self
            .apply(StateTransition::new(vod, from, DownloadState::Pending).with_path(PathUpdate::Clear))
            .await?;
        Ok(Step::Done(match restarted {
            Some(_) => {
                self.metrics.incr(Counter::TransientFailures);
                TickOutcome::TransientFailure {
                    vod_id: vod.id,
                    state: DownloadState::Pending,
                }
            }
            None => TickOutcome::LostRace { vod_id: vod.id },
        }))
    }

    async fn fail(
        &self,
        vod: &VodDbModel,
        from: DownloadState,
        reason: &str,
        path: PathUpdate<'_>,
    ) -> Result<Step> {
        warn!(channel = %self.channel, vod_id = vod.id, state = %from, reason, "VOD failed permanently");
        let failed = self
            .apply(
                StateTransition::new(vod, from, DownloadState::Failed)
                    .with_failure_reason(reason)
                    .with_path(path),
            )
            .await?;
        if failed.is_none() {
            return Ok(self.lost_race(vod.id));
        }
        self.metrics.incr(Counter::VodsFailed);
        Ok(Step::Done(TickOutcome::Failed {
            vod_id: vod.id,
            reason: reason.to_string(),
        }))
    }

    fn retry_later(&self, vod: &VodDbModel, state: DownloadState, error: &StepError) -> Step {
        let vod_id = vod.id;
        Step::Done(match error {
            StepError::Cancelled => {
                debug!(channel = %self.channel, vod_id, "Step cancelled");
                TickOutcome::Cancelled { vod_id }
            }
            StepError::Credentials(detail) => {
                warn!(channel = %self.channel, vod_id, detail, "Step blocked on credentials");
                TickOutcome::Blocked { vod_id }
            }
            e => {
                self.metrics.incr(Counter::TransientFailures);
                warn!(channel = %self.channel, vod_id, %state, error = %e, "Step failed, will retry");
                TickOutcome::TransientFailure { vod_id, state }
            }
        })
    }

    fn breaker_open(&self, vod_id: i64) -> Step {
        self.metrics.incr(Counter::BreakerDenied);
        debug!(channel = %self.channel, vod_id, "Breaker open, skipping step");
        Step::Done(TickOutcome::BreakerOpen { vod_id })
    }

    fn lost_race(&self, vod_id: i64) -> Step {
        Step::Done(TickOutcome::LostRace { vod_id })
    }

    async fn apply(&self, transition: StateTransition<'_>) -> Result<Option<i64>> {
        let version = self.vods.transition(&transition).await?;
        if version.is_none() {
            self.metrics.incr(Counter::LostTransitions);
            debug!(
                channel = %self.channel,
                vod_id = transition.id,
                from = %transition.from,
                to = %transition.to,
                "Transition lost to a concurrent update"
            );
        }
        Ok(version)
    }
}
