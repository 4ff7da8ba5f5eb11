//! ffmpeg transcoder.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::command::run_command;
use super::steps::{StepError, Transcoder};
use crate::database::models::VodDbModel;
use crate::utils::fs;

/// Runs `ffmpeg -i <input> <args> <output>`; the default args remux with
/// `-c copy -movflags +faststart`.
pub struct FfmpegTranscoder {
    ffmpeg_path: String,
    args: Vec<String>,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_path: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            args,
            timeout,
        }
    }

    pub fn build_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-nostats".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.display().to_string(),
        ];
        args.extend(self.args.iter().cloned());
        args.push(output.display().to_string());
        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        _vod: &VodDbModel,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        if !fs::is_file(input).await {
            return Err(StepError::Permanent(format!("input {} does not exist", input.display())));
        }
        fs::ensure_parent_dir(output)
            .await
            .map_err(|e| StepError::Transient(e.to_string()))?;

        // ffmpeg exits 1 for both corrupt input and IO trouble; treat as transient
        run_command(&self.ffmpeg_path, &self.build_args(input, output), &[], self.timeout, &[], cancel).await?;

        if !fs::is_file(output).await {
            return Err(StepError::Transient(format!(
                "ffmpeg finished but {} is missing",
                output.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args() {
        let t = FfmpegTranscoder::new(
            "ffmpeg",
            vec!["-c".into(), "copy".into(), "-movflags".into(), "+faststart".into()],
            Duration::from_secs(1),
        );
        let args = t.build_args(Path::new("/in.ts"), Path::new("/out.mp4"));
        assert_eq!(
            args,
            vec![
                "-y", "-hide_banner", "-nostats", "-loglevel", "error", "-i", "/in.ts", "-c", "copy",
                "-movflags", "+faststart", "/out.mp4"
            ]
        );
    }
}
