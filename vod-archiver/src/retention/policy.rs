//! Retention decisions.
//!
//! Pure functions over a channel's VOD rows; the job applies the result.

use std::collections::HashSet;

use serde::Serialize;

use crate::config::RetentionConfig;
use crate::database::models::{DownloadState, VodDbModel};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Why a VOD with a local file is left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A processing step may be using the file.
    ActiveState,
    /// The row changed inside the safety window.
    RecentlyUpdated,
    /// Not uploaded yet.
    NotArchived,
    /// The state column holds something unrecognized.
    UnknownState,
}

/// What retention does with one VOD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    /// No local file; nothing to do.
    NoFile,
    /// Inside the retained set.
    Retain,
    /// Outside the retained set but protected.
    Skip(SkipReason),
    Delete,
}

/// Retention thresholds in effect for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_days: Option<u32>,
    pub keep_count: Option<u32>,
    pub safety_window_ms: i64,
    pub require_archived: bool,
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            keep_days: config.keep_days,
            keep_count: config.keep_count,
            safety_window_ms: i64::try_from(config.safety_window_secs.saturating_mul(1000)).unwrap_or(i64::MAX),
            require_archived: config.require_archived,
        }
    }
}

impl RetentionPolicy {
    /// With neither threshold configured retention does nothing.
    pub fn is_active(&self) -> bool {
        self.keep_days.is_some() || self.keep_count.is_some()
    }

    /// Ids kept by either threshold.
    ///
    /// `vods` must be the channel's complete list ordered newest first, as
    /// `keep_count` ranks across all of them.
    pub fn retained_ids(&self, vods: &[VodDbModel], now: i64) -> HashSet<i64> {
        let mut retained = HashSet::new();
        if let Some(count) = self.keep_count {
            retained.extend(vods.iter().take(count as usize).map(|v| v.id));
        }
        if let Some(days) = self.keep_days {
            let cutoff = now.saturating_sub(i64::from(days).saturating_mul(DAY_MS));
            retained.extend(vods.iter().filter(|v| v.date >= cutoff).map(|v| v.id));
        }
        retained
    }

    /// Decide one VOD that is outside the retained set.
    pub fn check_deletable(&self, vod: &VodDbModel, now: i64) -> Decision {
        if vod.downloaded_path.is_none() {
            return Decision::NoFile;
        }
        let Some(state) = vod.state() else {
            return Decision::Skip(SkipReason::UnknownState);
        };
        if state.is_active() {
            return Decision::Skip(SkipReason::ActiveState);
        }
        if now.saturating_sub(vod.updated_at) < self.safety_window_ms {
            return Decision::Skip(SkipReason::RecentlyUpdated);
        }
        // A failed VOD will never be archived; its leftover media is fair game
        let finished = (vod.processed && state == DownloadState::Uploaded) || state == DownloadState::Failed;
        if self.require_archived && !finished {
            return Decision::Skip(SkipReason::NotArchived);
        }
        Decision::Delete
    }

    /// Decisions for every VOD, in input order.
    pub fn evaluate<'a>(&self, vods: &'a [VodDbModel], now: i64) -> Vec<(&'a VodDbModel, Decision)> {
        if !self.is_active() {
            return vods.iter().map(|v| (v, Decision::Retain)).collect();
        }
        let retained = self.retained_ids(vods, now);
        vods.iter()
            .map(|vod| {
                let decision = if vod.downloaded_path.is_none() {
                    Decision::NoFile
                } else if retained.contains(&vod.id) {
                    Decision::Retain
                } else {
                    self.check_deletable(vod, now)
                };
                (vod, decision)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn vod(id: i64, age_days: i64, state: DownloadState) -> VodDbModel {
        VodDbModel {
            id,
            channel: "chan".to_string(),
            twitch_vod_id: id.to_string(),
            title: String::new(),
            description: String::new(),
            date: NOW - age_days * DAY_MS,
            duration_secs: None,
            priority: 0,
            download_state: state.as_str().to_string(),
            downloaded_path: Some(format!("/data/{id}.mp4")),
            processed: state == DownloadState::Uploaded,
            youtube_url: None,
            failure_reason: None,
            created_at: 0,
            updated_at: NOW - 10 * DAY_MS,
        }
    }

    fn policy(keep_days: Option<u32>, keep_count: Option<u32>) -> RetentionPolicy {
        RetentionPolicy {
            keep_days,
            keep_count,
            safety_window_ms: 60 * 60 * 1000,
            require_archived: true,
        }
    }

    #[test]
    fn test_union_of_thresholds() {
        // Newest first: 1 and 2 are recent, 3..=5 are old
        let vods: Vec<_> = [(1, 1), (2, 5), (3, 40), (4, 50), (5, 60)]
            .into_iter()
            .map(|(id, age)| vod(id, age, DownloadState::Uploaded))
            .collect();

        let retained = policy(Some(30), Some(3)).retained_ids(&vods, NOW);
        assert_eq!(retained, HashSet::from([1, 2, 3]));

        // keep_count alone would drop 2; keep_days keeps it
        let retained = policy(Some(30), Some(1)).retained_ids(&vods, NOW);
        assert_eq!(retained, HashSet::from([1, 2]));
    }

    #[test]
    fn test_inactive_policy_retains_everything() {
        let vods = vec![vod(1, 400, DownloadState::Uploaded)];
        let decisions = policy(None, None).evaluate(&vods, NOW);
        assert_eq!(decisions[0].1, Decision::Retain);
    }

    #[test]
    fn test_protections() {
        let p = policy(Some(1), None);

        let active = vod(1, 90, DownloadState::Uploading);
        assert_eq!(p.check_deletable(&active, NOW), Decision::Skip(SkipReason::ActiveState));

        let mut recent = vod(2, 90, DownloadState::Uploaded);
        recent.updated_at = NOW - 60 * 1000;
        assert_eq!(p.check_deletable(&recent, NOW), Decision::Skip(SkipReason::RecentlyUpdated));

        let downloaded = vod(3, 90, DownloadState::Downloaded);
        assert_eq!(p.check_deletable(&downloaded, NOW), Decision::Skip(SkipReason::NotArchived));

        let relaxed = RetentionPolicy {
            require_archived: false,
            ..p.clone()
        };
        assert_eq!(relaxed.check_deletable(&downloaded, NOW), Decision::Delete);

        let done = vod(4, 90, DownloadState::Uploaded);
        assert_eq!(p.check_deletable(&done, NOW), Decision::Delete);

        let failed = vod(5, 90, DownloadState::Failed);
        assert_eq!(p.check_deletable(&failed, NOW), Decision::Delete);
    }

    #[test]
    fn test_vods_without_files_are_ignored() {
        let mut cleaned = vod(1, 90, DownloadState::Uploaded);
        cleaned.downloaded_path = None;
        let vods = vec![cleaned];
        assert_eq!(policy(Some(1), None).evaluate(&vods, NOW)[0].1, Decision::NoFile);
    }
}
