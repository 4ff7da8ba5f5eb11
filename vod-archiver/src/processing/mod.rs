//! VOD processing: download, transcode and upload.

pub mod command;
pub mod ffmpeg;
pub mod job;
pub mod layout;
pub mod recovery;
pub mod steps;

pub use command::{CommandDownloader, CommandUploader};
pub use ffmpeg::FfmpegTranscoder;
pub use job::{ProcessingJob, Processors, TickOutcome};
pub use layout::MediaLayout;
pub use recovery::{RecoveryReport, StartupRecovery};
pub use steps::{Downloader, StepError, Transcoder, Uploader};
