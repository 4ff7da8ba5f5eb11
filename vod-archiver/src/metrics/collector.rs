//! Metrics collector implementation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// Counter names recorded by the jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    CatalogRuns,
    CatalogPagesFetched,
    CatalogVodsInserted,
    CatalogErrors,
    BreakerDenied,
    VodsDownloaded,
    VodsTranscoded,
    VodsUploaded,
    VodsFailed,
    TransientFailures,
    LostTransitions,
    RecoveredOnStartup,
    RetentionCleaned,
    RetentionErrors,
    RetentionBytesFreed,
    ChatMessagesStored,
    ChatMessagesDropped,
    ChatReconnects,
}

impl Counter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CatalogRuns => "catalog_runs",
            Self::CatalogPagesFetched => "catalog_pages_fetched",
            Self::CatalogVodsInserted => "catalog_vods_inserted",
            Self::CatalogErrors => "catalog_errors",
            Self::BreakerDenied => "breaker_denied",
            Self::VodsDownloaded => "vods_downloaded",
            Self::VodsTranscoded => "vods_transcoded",
            Self::VodsUploaded => "vods_uploaded",
            Self::VodsFailed => "vods_failed",
            Self::TransientFailures => "transient_failures",
            Self::LostTransitions => "lost_transitions",
            Self::RecoveredOnStartup => "recovered_on_startup",
            Self::RetentionCleaned => "retention_cleaned",
            Self::RetentionErrors => "retention_errors",
            Self::RetentionBytesFreed => "retention_bytes_freed",
            Self::ChatMessagesStored => "chat_messages_stored",
            Self::ChatMessagesDropped => "chat_messages_dropped",
            Self::ChatReconnects => "chat_reconnects",
        }
    }
}

/// Counters keyed by `(channel, counter)`.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: DashMap<(String, Counter), AtomicU64>,
}

/// Point-in-time counter values, grouped by channel.
pub type MetricsSnapshot = BTreeMap<String, BTreeMap<&'static str, u64>>;

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, channel: &str, counter: Counter, value: u64) {
        self.counters
            .entry((channel.to_string(), counter))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self, channel: &str, counter: Counter) -> u64 {
        self.counters
            .get(&(channel.to_string(), counter))
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut out = MetricsSnapshot::new();
        for entry in self.counters.iter() {
            let (channel, counter) = entry.key();
            out.entry(channel.clone())
                .or_default()
                .insert(counter.as_str(), entry.value().load(Ordering::Relaxed));
        }
        out
    }

    /// Handle bound to one channel.
    pub fn channel(self: &Arc<Self>, channel: impl Into<String>) -> ChannelMetrics {
        ChannelMetrics {
            channel: channel.into(),
            collector: Arc::clone(self),
        }
    }
}

/// Channel-scoped view used by job tasks.
#[derive(Debug, Clone)]
pub struct ChannelMetrics {
    channel: String,
    collector: Arc<MetricsCollector>,
}

impl ChannelMetrics {
    pub fn incr(&self, counter: Counter) {
        self.collector.add(&self.channel, counter, 1);
    }

    pub fn add(&self, counter: Counter, value: u64) {
        if value > 0 {
            self.collector.add(&self.channel, counter, value);
        }
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.collector.get(&self.channel, counter)
    }
}
