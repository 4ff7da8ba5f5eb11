//! Service container.
//!
//! Builds repositories, the token vault, upstream clients and every
//! channel's jobs from the loaded configuration, and owns their lifecycle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::{CatalogBackfillJob, CatalogClient, HelixClient};
use crate::chat::{ChatRecorder, ChatSource, TwitchChatSource};
use crate::config::{AppConfig, ResolvedChannelConfig};
use crate::database::repositories::{
    ChatRepository, KvRepository, SqlxChatRepository, SqlxKvRepository, SqlxTokenRepository,
    SqlxVodRepository, TokenRepository, VodRepository,
};
use crate::metrics::MetricsCollector;
use crate::processing::{
    CommandDownloader, CommandUploader, FfmpegTranscoder, MediaLayout, ProcessingJob, Processors,
};
use crate::resilience::CircuitBreaker;
use crate::retention::RetentionJob;
use crate::scheduler::{AdminHandle, ChannelJobs, ChannelSupervisor, ShutdownReport};
use crate::utils::http_client::build_api_client;
use crate::vault::{LocalKms, TokenVault, VaultSettings};
use crate::{Error, Result};

/// Shared repositories.
#[derive(Clone)]
pub struct Repositories {
    pub vods: Arc<dyn VodRepository>,
    pub kv: Arc<dyn KvRepository>,
    pub chat: Arc<dyn ChatRepository>,
    pub tokens: Arc<dyn TokenRepository>,
}

impl Repositories {
    pub fn sqlx(pool: &SqlitePool) -> Self {
        Self {
            vods: Arc::new(SqlxVodRepository::new(pool.clone())),
            kv: Arc::new(SqlxKvRepository::new(pool.clone())),
            chat: Arc::new(SqlxChatRepository::new(pool.clone())),
            tokens: Arc::new(SqlxTokenRepository::new(pool.clone())),
        }
    }
}

/// Upstream collaborators shared by all channels.
#[derive(Clone)]
pub struct Upstreams {
    pub catalog: Arc<dyn CatalogClient>,
    pub processors: Processors,
    pub chat: Arc<dyn ChatSource>,
}

/// Service container holding all application services.
pub struct ServiceContainer {
    pub pool: SqlitePool,
    pub config: AppConfig,
    pub repos: Repositories,
    pub vault: Arc<TokenVault>,
    pub metrics: Arc<MetricsCollector>,
    breakers: BTreeMap<String, Arc<CircuitBreaker>>,
    jobs: BTreeMap<String, ChannelJobs>,
    admin: AdminHandle,
    supervisor: Option<ChannelSupervisor>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Wire everything against the real upstreams.
    pub fn new(pool: SqlitePool, config: AppConfig) -> Result<Self> {
        info!("Initializing service container");
        config.validate()?;

        let repos = Repositories::sqlx(&pool);
        let vault = Arc::new(build_vault(&config, Arc::clone(&repos.tokens))?);

        let http = build_api_client(Duration::from_secs(config.catalog.request_timeout_secs))
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;
        let client_id = config.catalog.client_id.clone().unwrap_or_default();
        if client_id.is_empty() && config.resolve_all().iter().any(|c| c.catalog.enabled) {
            warn!("catalog.client_id is not set; Helix requests will be rejected");
        }

        let processing = &config.processing;
        let upstreams = Upstreams {
            catalog: Arc::new(HelixClient::new(
                http,
                &config.catalog.helix_base_url,
                client_id,
                Arc::clone(&vault),
                &config.catalog.token_provider,
            )),
            processors: Processors {
                downloader: Arc::new(CommandDownloader::new(processing.download.clone())),
                transcoder: Arc::new(FfmpegTranscoder::new(
                    &processing.ffmpeg_path,
                    processing.transcode_args.clone(),
                    Duration::from_secs(processing.transcode_timeout_secs),
                )),
                uploader: Arc::new(CommandUploader::new(
                    processing.upload.clone(),
                    Arc::clone(&vault),
                    &processing.upload_token_provider,
                )),
            },
            chat: Arc::new(TwitchChatSource::new(&config.chat.irc_url)),
        };

        Ok(Self::with_upstreams(pool, config, repos, vault, upstreams))
    }

    /// Wire channel jobs against the given collaborators.
    pub fn with_upstreams(
        pool: SqlitePool,
        config: AppConfig,
        repos: Repositories,
        vault: Arc<TokenVault>,
        upstreams: Upstreams,
    ) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let layout = MediaLayout::new(&config.processing.work_dir);
        let mut breakers = BTreeMap::new();
        let mut jobs = BTreeMap::new();
        let mut catalogs = BTreeMap::new();

        for channel in config.resolve_all() {
            let breaker = Arc::new(CircuitBreaker::new(
                channel.name.clone(),
                Arc::clone(&repos.kv),
                config.breaker.failure_threshold,
                Duration::from_secs(config.breaker.cooldown_secs),
            ));
            let set = build_channel_jobs(&config, &channel, &repos, &upstreams, &breaker, &layout, &metrics);
            if let Some(catalog) = &set.catalog {
                catalogs.insert(channel.name.clone(), Arc::clone(catalog));
            }
            breakers.insert(channel.name.clone(), breaker);
            jobs.insert(channel.name, set);
        }

        info!(channels = jobs.len(), "Service container initialized");
        Self {
            pool,
            config,
            repos,
            vault,
            metrics,
            breakers,
            jobs,
            admin: AdminHandle::new(catalogs),
            supervisor: None,
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn admin(&self) -> AdminHandle {
        self.admin.clone()
    }

    pub fn breaker(&self, channel: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(channel)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_some()
    }

    /// Spawn every channel's jobs. Calling it twice has no effect.
    pub fn start(&mut self) {
        if self.supervisor.is_some() {
            return;
        }
        let jobs = std::mem::take(&mut self.jobs);
        self.supervisor = Some(ChannelSupervisor::start(jobs, &self.cancellation_token));
    }

    /// Stop all jobs and close the pool.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
        let report = match self.supervisor.take() {
            Some(supervisor) => supervisor.shutdown(timeout).await,
            None => ShutdownReport::default(),
        };
        self.cancellation_token.cancel();
        self.vault.purge_cache();
        self.pool.close().await;
        report
    }
}

fn build_vault(config: &AppConfig, tokens: Arc<dyn TokenRepository>) -> Result<TokenVault> {
    let keks = config.vault.decode_keks()?;
    let active = config
        .vault
        .active_kek_id
        .clone()
        .ok_or_else(|| Error::config("vault.active_kek_id is required"))?;

    let mut settings = VaultSettings::new(active);
    if let Some(key) = config.vault.decode_legacy_key()? {
        settings = settings.with_legacy_key(key);
    }
    settings.data_key_cache_ttl = Duration::from_secs(config.vault.data_key_cache_ttl_secs);
    settings.kms_timeout = Duration::from_secs(config.vault.kms_timeout_secs);
    settings.refresh_skew = Duration::from_secs(config.vault.refresh_skew_secs);

    Ok(TokenVault::new(tokens, Arc::new(LocalKms::from_keys(keks)), settings))
}

fn build_channel_jobs(
    config: &AppConfig,
    channel: &ResolvedChannelConfig,
    repos: &Repositories,
    upstreams: &Upstreams,
    breaker: &Arc<CircuitBreaker>,
    layout: &MediaLayout,
    metrics: &Arc<MetricsCollector>,
) -> ChannelJobs {
    let name = &channel.name;
    let channel_metrics = metrics.channel(name.clone());

    ChannelJobs {
        catalog: channel.catalog.enabled.then(|| {
            Arc::new(CatalogBackfillJob::new(
                name.clone(),
                channel.catalog.clone(),
                Arc::clone(&upstreams.catalog),
                Arc::clone(&repos.vods),
                Arc::clone(&repos.kv),
                Arc::clone(breaker),
                channel_metrics.clone(),
            ))
        }),
        processing: channel.processing_enabled.then(|| {
            Arc::new(ProcessingJob::new(
                name.clone(),
                Arc::clone(&repos.vods),
                upstreams.processors.clone(),
                Arc::clone(breaker),
                layout.clone(),
                channel_metrics.clone(),
                Duration::from_secs(config.processing.interval_secs),
            ))
        }),
        retention: channel.retention_enabled.then(|| {
            Arc::new(RetentionJob::new(
                name.clone(),
                channel.retention.clone(),
                Arc::clone(&repos.vods),
                channel_metrics.clone(),
            ))
        }),
        chat: channel.chat_enabled.then(|| {
            Arc::new(ChatRecorder::new(
                name.clone(),
                config.chat.clone(),
                Arc::clone(&upstreams.chat),
                Arc::clone(&repos.chat),
                Arc::clone(&repos.vods),
                channel_metrics.clone(),
            ))
        }),
    }
}
