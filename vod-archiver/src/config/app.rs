//! Application configuration sections.
//!
//! Every field has a default so a config file only needs to list channels.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_database_url() -> String {
    "sqlite:vod-archiver.db?mode=rwc".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            log_dir: default_log_dir(),
            channels: Vec::new(),
            catalog: CatalogConfig::default(),
            processing: ProcessingConfig::default(),
            retention: RetentionConfig::default(),
            breaker: BreakerConfig::default(),
            chat: ChatConfig::default(),
            vault: VaultConfig::default(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

/// A configured channel with optional overrides of the global sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(default)]
    pub overrides: ChannelOverrides,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            overrides: ChannelOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: ChannelOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Per-channel settings; `None` inherits the global value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelOverrides {
    pub catalog_enabled: Option<bool>,
    pub catalog_interval_secs: Option<u64>,
    pub max_vods: Option<u64>,
    pub max_age_days: Option<u32>,
    pub processing_enabled: Option<bool>,
    pub retention_enabled: Option<bool>,
    pub keep_days: Option<u32>,
    pub keep_count: Option<u32>,
    pub safety_window_secs: Option<u64>,
    pub retention_dry_run: Option<bool>,
    pub chat_enabled: Option<bool>,
}

/// Catalog backfill settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_catalog_interval_secs")]
    pub interval_secs: u64,
    /// Stop inserting once the channel has this many VOD rows.
    #[serde(default)]
    pub max_vods: Option<u64>,
    /// Skip VODs older than this.
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_helix_base_url")]
    pub helix_base_url: String,
    #[serde(default)]
    pub client_id: Option<String>,
    /// Vault provider name holding the app access token.
    #[serde(default = "default_catalog_token_provider")]
    pub token_provider: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_catalog_interval_secs() -> u64 {
    6 * 60 * 60
}

fn default_page_size() -> u32 {
    100
}

fn default_helix_base_url() -> String {
    "https://api.twitch.tv/helix".to_string()
}

fn default_catalog_token_provider() -> String {
    "twitch".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_catalog_interval_secs(),
            max_vods: None,
            max_age_days: None,
            page_size: default_page_size(),
            helix_base_url: default_helix_base_url(),
            client_id: None,
            token_provider: default_catalog_token_provider(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// An external program invocation. Arguments may contain `{placeholders}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_step_timeout_secs")]
    pub timeout_secs: u64,
    /// Exit codes meaning the VOD can never succeed; anything else non-zero
    /// is retried.
    #[serde(default)]
    pub permanent_exit_codes: Vec<i32>,
}

fn default_step_timeout_secs() -> u64 {
    6 * 60 * 60
}

fn default_download_command() -> CommandConfig {
    CommandConfig {
        program: "yt-dlp".to_string(),
        args: vec![
            "--no-progress".to_string(),
            "--continue".to_string(),
            "-o".to_string(),
            "{output}".to_string(),
            "{url}".to_string(),
        ],
        timeout_secs: default_step_timeout_secs(),
        permanent_exit_codes: Vec::new(),
    }
}

fn default_upload_command() -> CommandConfig {
    CommandConfig {
        program: "youtube-upload".to_string(),
        args: vec![
            "--title".to_string(),
            "{title}".to_string(),
            "--description".to_string(),
            "{description}".to_string(),
            "{input}".to_string(),
        ],
        timeout_secs: default_step_timeout_secs(),
        permanent_exit_codes: Vec::new(),
    }
}

/// Processing job settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_processing_interval_secs")]
    pub interval_secs: u64,
    /// Root directory for downloaded and transcoded media.
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    #[serde(default = "default_download_command")]
    pub download: CommandConfig,
    #[serde(default = "default_upload_command")]
    pub upload: CommandConfig,
    /// Vault provider name holding the upload credentials.
    #[serde(default = "default_upload_token_provider")]
    pub upload_token_provider: String,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_transcode_args")]
    pub transcode_args: Vec<String>,
    #[serde(default = "default_step_timeout_secs")]
    pub transcode_timeout_secs: u64,
}

fn default_processing_interval_secs() -> u64 {
    60
}

fn default_work_dir() -> String {
    "data".to_string()
}

fn default_upload_token_provider() -> String {
    "youtube".to_string()
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_transcode_args() -> Vec<String> {
    ["-c", "copy", "-movflags", "+faststart"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_processing_interval_secs(),
            work_dir: default_work_dir(),
            download: default_download_command(),
            upload: default_upload_command(),
            upload_token_provider: default_upload_token_provider(),
            ffmpeg_path: default_ffmpeg_path(),
            transcode_args: default_transcode_args(),
            transcode_timeout_secs: default_step_timeout_secs(),
        }
    }
}

/// Retention job settings. The job is inactive unless `keep_days` or
/// `keep_count` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub keep_days: Option<u32>,
    #[serde(default)]
    pub keep_count: Option<u32>,
    /// Minimum age of the last row change before its file may be deleted.
    #[serde(default = "default_safety_window_secs")]
    pub safety_window_secs: u64,
    /// Only delete files of VODs that finished uploading or failed for good.
    #[serde(default = "default_true")]
    pub require_archived: bool,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_retention_interval_secs() -> u64 {
    60 * 60
}

fn default_safety_window_secs() -> u64 {
    60 * 60
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_retention_interval_secs(),
            keep_days: None,
            keep_count: None,
            safety_window_secs: default_safety_window_secs(),
            require_archived: true,
            dry_run: false,
        }
    }
}

impl RetentionConfig {
    pub fn is_active(&self) -> bool {
        self.keep_days.is_some() || self.keep_count.is_some()
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    5 * 60
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Chat recorder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_irc_url")]
    pub irc_url: String,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,
    /// Messages held while no VOD covers them yet.
    #[serde(default = "default_max_pending_messages")]
    pub max_pending_messages: usize,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// How far past a VOD's recorded end a message may still attach to it.
    #[serde(default = "default_attach_slack_secs")]
    pub attach_slack_secs: u64,
}

fn default_irc_url() -> String {
    "wss://irc-ws.chat.twitch.tv:443".to_string()
}

fn default_flush_interval_ms() -> u64 {
    500
}

fn default_flush_batch_size() -> usize {
    100
}

fn default_max_pending_messages() -> usize {
    10_000
}

fn default_reconnect_initial_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    60_000
}

fn default_attach_slack_secs() -> u64 {
    30 * 60
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            irc_url: default_irc_url(),
            flush_interval_ms: default_flush_interval_ms(),
            flush_batch_size: default_flush_batch_size(),
            max_pending_messages: default_max_pending_messages(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            attach_slack_secs: default_attach_slack_secs(),
        }
    }
}

/// Token vault settings. Key material is base64 encoded.
#[derive(Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub active_kek_id: Option<String>,
    #[serde(default)]
    pub keks: HashMap<String, String>,
    #[serde(default)]
    pub legacy_key: Option<String>,
    #[serde(default = "default_data_key_cache_ttl_secs")]
    pub data_key_cache_ttl_secs: u64,
    #[serde(default = "default_kms_timeout_secs")]
    pub kms_timeout_secs: u64,
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: u64,
}

fn default_data_key_cache_ttl_secs() -> u64 {
    300
}

fn default_kms_timeout_secs() -> u64 {
    10
}

fn default_refresh_skew_secs() -> u64 {
    300
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            active_kek_id: None,
            keks: HashMap::new(),
            legacy_key: None,
            data_key_cache_ttl_secs: default_data_key_cache_ttl_secs(),
            kms_timeout_secs: default_kms_timeout_secs(),
            refresh_skew_secs: default_refresh_skew_secs(),
        }
    }
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kek_ids: Vec<_> = self.keks.keys().collect();
        kek_ids.sort();
        f.debug_struct("VaultConfig")
            .field("active_kek_id", &self.active_kek_id)
            .field("kek_ids", &kek_ids)
            .field("legacy_key", &self.legacy_key.as_ref().map(|_| "***"))
            .field("data_key_cache_ttl_secs", &self.data_key_cache_ttl_secs)
            .field("kms_timeout_secs", &self.kms_timeout_secs)
            .field("refresh_skew_secs", &self.refresh_skew_secs)
            .finish()
    }
}
