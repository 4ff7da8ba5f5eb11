//! Startup recovery of VODs left mid-step by a crash or restart.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::layout::MediaLayout;
use super::steps::Downloader;
use crate::Result;
use crate::database::models::{DownloadState, VodDbModel};
use crate::database::repositories::{PathUpdate, StateTransition, VodRepository};
use crate::utils::fs;

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Interrupted downloads whose partial file can be continued; they stay
    /// `downloading`.
    pub resumable: Vec<i64>,
    pub rolled_back: u32,
    /// Rows another worker changed while recovery looked at them.
    pub skipped: u32,
}

/// Rolls interrupted rows back to their last stable state.
pub struct StartupRecovery {
    vods: Arc<dyn VodRepository>,
    downloader: Arc<dyn Downloader>,
    layout: MediaLayout,
}

async fn existing(path: Option<&str>) -> Option<&str> {
    let path = path?;
    fs::is_file(Path::new(path)).await.then_some(path)
}

impl StartupRecovery {
    pub fn new(vods: Arc<dyn VodRepository>, downloader: Arc<dyn Downloader>, layout: MediaLayout) -> Self {
        Self {
            vods,
            downloader,
            layout,
        }
    }

    pub async fn run(&self, channel: &str) -> Result<RecoveryReport> {
        let stuck = self
            .vods
            .list_in_states(
                channel,
                &[
                    DownloadState::Downloading,
                    DownloadState::Downloaded,
                    DownloadState::Transcoding,
                    DownloadState::Uploading,
                ],
            )
            .await?;

        let mut report = RecoveryReport::default();
        for vod in stuck {
            let Some(state) = vod.state() else {
                continue;
            };
            match state {
                DownloadState::Downloading => self.recover_download(&vod, &mut report).await?,
                DownloadState::Transcoding => self.recover_transcode(&vod, &mut report).await?,
                DownloadState::Downloaded | DownloadState::Uploading => {
                    if existing(vod.downloaded_path.as_deref()).await.is_none() {
                        warn!(channel, vod_id = vod.id, %state, "Local file vanished, restarting VOD");
                        self.roll_back(&vod, state, DownloadState::Pending, PathUpdate::Clear, &mut report)
                            .await?;
                    }
                }
                _ => {}
            }
        }

        if report.rolled_back > 0 || !report.resumable.is_empty() {
            info!(
                channel,
                rolled_back = report.rolled_back,
                resumable = report.resumable.len(),
                "Startup recovery complete"
            );
        }
        Ok(report)
    }

    async fn recover_download(&self, vod: &VodDbModel, report: &mut RecoveryReport) -> Result<()> {
        if let Some(partial) = existing(vod.downloaded_path.as_deref()).await
            && self.downloader.can_resume(vod, Path::new(partial)).await
        {
            debug!(vod_id = vod.id, partial, "Interrupted download is resumable");
            report.resumable.push(vod.id);
            return Ok(());
        }

        if self
            .roll_back(vod, DownloadState::Downloading, DownloadState::Pending, PathUpdate::Clear, report)
            .await?
            && let Some(partial) = vod.downloaded_path.as_deref()
        {
            fs::remove_file_if_exists(Path::new(partial)).await?;
        }
        Ok(())
    }

    async fn recover_transcode(&self, vod: &VodDbModel, report: &mut RecoveryReport) -> Result<()> {
        let output = self.layout.output_path(vod);
        let input = existing(vod.downloaded_path.as_deref()).await;
        if input.is_none_or(|i| Path::new(i) != output) {
            fs::remove_file_if_exists(&output).await?;
        }

        match input {
            Some(_) => {
                self.roll_back(vod, DownloadState::Transcoding, DownloadState::Downloaded, PathUpdate::Keep, report)
                    .await?;
            }
            None => {
                self.roll_back(vod, DownloadState::Transcoding, DownloadState::Pending, PathUpdate::Clear, report)
                    .await?;
            }
        }
        Ok(())
    }

    async fn roll_back(
        &self,
        vod: &VodDbModel,
        from: DownloadState,
        to: DownloadState,
        path: PathUpdate<'_>,
        report: &mut RecoveryReport,
    ) -> Result<bool> {
        let transition = StateTransition::new(vod, from, to).with_path(path);
        if self.vods.transition(&transition).await?.is_some() {
            debug!(vod_id = vod.id, %from, %to, "Rolled back interrupted VOD");
            report.rolled_back += 1;
            Ok(true)
        } else {
            debug!(vod_id = vod.id, "VOD changed during recovery, skipping");
            report.skipped += 1;
            Ok(false)
        }
    }
}
