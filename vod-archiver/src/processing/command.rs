//! External program steps: downloader and uploader driven by a command line.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::steps::{Downloader, StepError, Uploader};
use crate::config::CommandConfig;
use crate::database::models::VodDbModel;
use crate::utils::fs;
use crate::vault::TokenVault;

/// Environment variable carrying the upload access token to the upload program.
pub const ACCESS_TOKEN_ENV: &str = "VOD_ARCHIVER_ACCESS_TOKEN";

/// Public page of a Twitch VOD.
pub fn twitch_vod_url(vod: &VodDbModel) -> String {
    format!("https://www.twitch.tv/videos/{}", vod.twitch_vod_id)
}

/// Replace `{name}` placeholders in each argument.
pub fn substitute_args(args: &[String], vars: &HashMap<&str, String>) -> Vec<String> {
    args.iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{}}}", name), value)
            })
        })
        .collect()
}

fn vod_vars(vod: &VodDbModel) -> HashMap<&'static str, String> {
    HashMap::from([
        ("vod_id", vod.twitch_vod_id.clone()),
        ("channel", vod.channel.clone()),
        ("title", vod.title.clone()),
        ("description", vod.description.clone()),
        ("url", twitch_vod_url(vod)),
    ])
}

/// Captured result of a finished program.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: Vec<String>,
}

/// Run a program to completion, bounded by `timeout` and `cancel`.
///
/// The child is killed when either fires. Non-zero exits listed in
/// `permanent_exit_codes` are permanent failures; all others are transient.
pub async fn run_command(
    program: &str,
    args: &[String],
    env: &[(&str, &str)],
    timeout: Duration,
    permanent_exit_codes: &[i32],
    cancel: &CancellationToken,
) -> Result<CommandOutput, StepError> {
    let start = Instant::now();
    debug!(program, ?args, "Spawning command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| StepError::Transient(format!("failed to spawn {}: {}", program, e)))?;

    let stdout_handle = child.stdout.take().map(|stdout| {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut collected = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("stdout: {}", line);
                collected.push(line);
            }
            collected
        })
    });

    let stderr_handle = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut last = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.contains("error") || line.contains("Error") {
                    warn!("stderr: {}", line);
                } else {
                    debug!("stderr: {}", line);
                }
                last = line;
            }
            last
        })
    });

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            info!(program, "Command cancelled");
            return Err(StepError::Cancelled);
        }
        result = tokio::time::timeout(timeout, child.wait()) => match result {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(StepError::Transient(format!("failed to wait for {}: {}", program, e)));
            }
            Err(_) => {
                error!(program, "Command timed out after {:?}", timeout);
                let _ = child.kill().await;
                return Err(StepError::Transient(format!("{} timed out after {:?}", program, timeout)));
            }
        },
    };

    let stdout = match stdout_handle {
        Some(h) => h.await.unwrap_or_default(),
        None => Vec::new(),
    };
    let last_stderr = match stderr_handle {
        Some(h) => h.await.unwrap_or_default(),
        None => String::new(),
    };

    if !status.success() {
        let code = status.code().unwrap_or(-1);
        error!(program, code, "Command failed");
        let message = format!("{} exited with code {}: {}", program, code, last_stderr);
        return Err(if permanent_exit_codes.contains(&code) {
            StepError::Permanent(message)
        } else {
            StepError::Transient(message)
        });
    }

    info!(program, "Command completed in {:.2}s", start.elapsed().as_secs_f64());
    Ok(CommandOutput { stdout })
}

/// Downloads with an external program such as yt-dlp.
pub struct CommandDownloader {
    command: CommandConfig,
}

impl CommandDownloader {
    pub fn new(command: CommandConfig) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Downloader for CommandDownloader {
    async fn download(
        &self,
        vod: &VodDbModel,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        fs::ensure_parent_dir(output)
            .await
            .map_err(|e| StepError::Transient(e.to_string()))?;

        let mut vars = vod_vars(vod);
        vars.insert("output", output.display().to_string());
        let args = substitute_args(&self.command.args, &vars);

        run_command(
            &self.command.program,
            &args,
            &[],
            Duration::from_secs(self.command.timeout_secs),
            &self.command.permanent_exit_codes,
            cancel,
        )
        .await?;

        if !fs::is_file(output).await {
            return Err(StepError::Transient(format!(
                "download finished but {} is missing",
                output.display()
            )));
        }
        Ok(())
    }

    async fn can_resume(&self, _vod: &VodDbModel, partial: &Path) -> bool {
        fs::file_size(partial).await.is_some_and(|size| size > 0)
    }
}

/// Uploads with an external program. The access token is read from the
/// vault and handed over in [`ACCESS_TOKEN_ENV`]; the program prints the
/// video URL (or bare ID) as its last line of output.
pub struct CommandUploader {
    command: CommandConfig,
    vault: Arc<TokenVault>,
    token_provider: String,
}

impl CommandUploader {
    pub fn new(command: CommandConfig, vault: Arc<TokenVault>, token_provider: impl Into<String>) -> Self {
        Self {
            command,
            vault,
            token_provider: token_provider.into(),
        }
    }
}

/// Interpret the last non-empty output line as a URL or a YouTube video ID.
pub fn parse_upload_url(stdout: &[String]) -> Option<String> {
    let last = stdout.iter().rev().map(|l| l.trim()).find(|l| !l.is_empty())?;
    if last.starts_with("http://") || last.starts_with("https://") {
        Some(last.to_string())
    } else if !last.contains(char::is_whitespace) {
        Some(format!("https://www.youtube.com/watch?v={}", last))
    } else {
        None
    }
}

#[async_trait]
impl Uploader for CommandUploader {
    async fn upload(
        &self,
        vod: &VodDbModel,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, StepError> {
        let token = match self.vault.load(&vod.channel, &self.token_provider).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                return Err(StepError::Credentials(format!(
                    "no {} token stored for {}",
                    self.token_provider, vod.channel
                )));
            }
            Err(e) => return Err(StepError::Credentials(e.to_string())),
        };

        let mut vars = vod_vars(vod);
        vars.insert("input", input.display().to_string());
        let args = substitute_args(&self.command.args, &vars);

        let output = run_command(
            &self.command.program,
            &args,
            &[(ACCESS_TOKEN_ENV, token.access_token.as_str())],
            Duration::from_secs(self.command.timeout_secs),
            &self.command.permanent_exit_codes,
            cancel,
        )
        .await?;

        parse_upload_url(&output.stdout)
            .ok_or_else(|| StepError::Transient("upload program printed no video URL".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_args() {
        let vars = HashMap::from([("output", "/tmp/a.mp4".to_string()), ("url", "u".to_string())]);
        let args = vec!["-o".to_string(), "{output}".to_string(), "{url}".to_string(), "{unknown}".to_string()];
        assert_eq!(substitute_args(&args, &vars), vec!["-o", "/tmp/a.mp4", "u", "{unknown}"]);
    }

    #[test]
    fn test_parse_upload_url() {
        let lines = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            parse_upload_url(&lines(&["progress", "https://youtu.be/abc", ""])).as_deref(),
            Some("https://youtu.be/abc")
        );
        assert_eq!(
            parse_upload_url(&lines(&["dQw4w9WgXcQ"])).as_deref(),
            Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
        );
        assert_eq!(parse_upload_url(&lines(&["upload failed badly"])), None);
        assert_eq!(parse_upload_url(&[]), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_classification() {
        let cancel = CancellationToken::new();
        let sh = |script: &str| vec!["-c".to_string(), script.to_string()];

        let ok = run_command("sh", &sh("echo hello"), &[], Duration::from_secs(5), &[], &cancel)
            .await
            .unwrap();
        assert_eq!(ok.stdout, vec!["hello"]);

        let transient = run_command("sh", &sh("exit 3"), &[], Duration::from_secs(5), &[], &cancel).await;
        assert!(matches!(transient, Err(StepError::Transient(_))));

        let permanent = run_command("sh", &sh("exit 3"), &[], Duration::from_secs(5), &[3], &cancel).await;
        assert!(matches!(permanent, Err(StepError::Permanent(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_and_cancel() {
        let cancel = CancellationToken::new();
        let sleep = vec!["-c".to_string(), "sleep 5".to_string()];
        let timed_out = run_command("sh", &sleep, &[], Duration::from_millis(100), &[], &cancel).await;
        assert!(matches!(timed_out, Err(StepError::Transient(_))));

        cancel.cancel();
        let cancelled = run_command("sh", &sleep, &[], Duration::from_secs(5), &[], &cancel).await;
        assert_eq!(cancelled.unwrap_err(), StepError::Cancelled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_is_passed() {
        let cancel = CancellationToken::new();
        let args = vec!["-c".to_string(), format!("echo ${}", ACCESS_TOKEN_ENV)];
        let out = run_command("sh", &args, &[(ACCESS_TOKEN_ENV, "tok")], Duration::from_secs(5), &[], &cancel)
            .await
            .unwrap();
        assert_eq!(out.stdout, vec!["tok"]);
    }
}
