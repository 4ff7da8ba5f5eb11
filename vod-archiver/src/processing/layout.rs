//! On-disk locations of a VOD's media files.

use std::path::{Path, PathBuf};

use crate::database::models::VodDbModel;

/// Media files live under `<work_dir>/<channel>/`.
#[derive(Debug, Clone)]
pub struct MediaLayout {
    work_dir: PathBuf,
}

impl MediaLayout {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn channel_dir(&self, channel: &str) -> PathBuf {
        self.work_dir.join(sanitize(channel))
    }

    /// Download target, also holding the partial file while downloading.
    pub fn source_path(&self, vod: &VodDbModel) -> PathBuf {
        self.channel_dir(&vod.channel)
            .join(format!("{}.source.mp4", sanitize(&vod.twitch_vod_id)))
    }

    /// Transcoded artifact handed to the uploader.
    pub fn output_path(&self, vod: &VodDbModel) -> PathBuf {
        self.channel_dir(&vod.channel)
            .join(format!("{}.mp4", sanitize(&vod.twitch_vod_id)))
    }
}

/// Keep upstream ids from escaping the channel directory.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "_".to_string() } else { cleaned }
}
