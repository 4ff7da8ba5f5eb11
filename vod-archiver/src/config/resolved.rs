//! Per-channel configuration: channel overrides merged over global sections.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use super::app::{AppConfig, CatalogConfig, ChannelConfig, RetentionConfig};

/// Fully resolved settings for one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedChannelConfig {
    pub name: String,
    pub catalog: CatalogConfig,
    pub retention: RetentionConfig,
    pub processing_enabled: bool,
    pub retention_enabled: bool,
    pub chat_enabled: bool,
}

impl ResolvedChannelConfig {
    pub fn catalog_interval(&self) -> Duration {
        Duration::from_secs(self.catalog.interval_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention.interval_secs)
    }
}

impl AppConfig {
    /// Merge a channel's overrides over the global sections.
    pub fn resolve(&self, channel: &ChannelConfig) -> ResolvedChannelConfig {
        let o = &channel.overrides;

        let mut catalog = self.catalog.clone();
        catalog.enabled = o.catalog_enabled.unwrap_or(catalog.enabled);
        catalog.interval_secs = o.catalog_interval_secs.unwrap_or(catalog.interval_secs);
        catalog.max_vods = o.max_vods.or(catalog.max_vods);
        catalog.max_age_days = o.max_age_days.or(catalog.max_age_days);

        let mut retention = self.retention.clone();
        retention.keep_days = o.keep_days.or(retention.keep_days);
        retention.keep_count = o.keep_count.or(retention.keep_count);
        retention.safety_window_secs = o.safety_window_secs.unwrap_or(retention.safety_window_secs);
        retention.dry_run = o.retention_dry_run.unwrap_or(retention.dry_run);

        let resolved = ResolvedChannelConfig {
            name: channel.name.trim().to_string(),
            processing_enabled: o.processing_enabled.unwrap_or(self.processing.enabled),
            retention_enabled: o.retention_enabled.unwrap_or(true) && retention.is_active(),
            chat_enabled: o.chat_enabled.unwrap_or(self.chat.enabled),
            catalog,
            retention,
        };

        debug!(
            channel = %resolved.name,
            catalog = resolved.catalog.enabled,
            processing = resolved.processing_enabled,
            retention = resolved.retention_enabled,
            chat = resolved.chat_enabled,
            "Resolved channel config"
        );
        resolved
    }

    pub fn resolve_all(&self) -> Vec<ResolvedChannelConfig> {
        self.channels.iter().map(|c| self.resolve(c)).collect()
    }
}
