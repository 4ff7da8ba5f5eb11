//! Per-channel chat recorder.
//!
//! Buffers live messages and flushes them in batches, attaching each to the
//! newest VOD that started at or before the message and has not yet ended.
//! Messages that arrive before their VOD has been cataloged are held back,
//! up to a bound.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::source::{ChatError, ChatMessage, ChatSource, ChatStream};
use crate::Result;
use crate::config::ChatConfig;
use crate::database::models::{NewChatMessage, VodDbModel};
use crate::database::repositories::{ChatRepository, VodRepository};
use crate::metrics::{ChannelMetrics, Counter};
use crate::resilience::RetryConfig;

/// The VOD a message sent at `sent_at` belongs to: the newest one started
/// at or before it, unless its recorded end plus `slack_ms` is already past.
/// `vods` is ordered newest first.
fn covering_vod(vods: &[VodDbModel], sent_at: i64, slack_ms: i64) -> Option<i64> {
    let index = vods.partition_point(|v| v.date > sent_at);
    let vod = vods.get(index)?;
    let covers = match vod.duration_secs {
        None => true,
        Some(secs) => vod
            .date
            .saturating_add(secs.saturating_mul(1000))
            .saturating_add(slack_ms)
            >= sent_at,
    };
    covers.then_some(vod.id)
}

/// Result of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub stored: u64,
    /// Duplicates of messages already stored.
    pub duplicates: u64,
    /// Still waiting for a VOD.
    pub held: usize,
    /// Dropped because the pending buffer was full.
    pub dropped: u64,
}

pub struct ChatRecorder {
    channel: String,
    config: ChatConfig,
    source: Arc<dyn ChatSource>,
    chat: Arc<dyn ChatRepository>,
    vods: Arc<dyn VodRepository>,
    metrics: ChannelMetrics,
    pending: parking_lot::Mutex<VecDeque<ChatMessage>>,
}

impl ChatRecorder {
    pub fn new(
        channel: impl Into<String>,
        config: ChatConfig,
        source: Arc<dyn ChatSource>,
        chat: Arc<dyn ChatRepository>,
        vods: Arc<dyn VodRepository>,
        metrics: ChannelMetrics,
    ) -> Self {
        Self {
            channel: channel.into(),
            config,
            source,
            chat,
            vods,
            metrics,
            pending: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn reconnect_policy(&self) -> RetryConfig {
        RetryConfig {
            max_retries: u32::MAX,
            initial_delay_ms: self.config.reconnect_initial_ms,
            max_delay_ms: self.config.reconnect_max_ms,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Queue a message for the next flush. Returns the number of messages
    /// dropped to stay within the pending bound.
    pub fn push(&self, message: ChatMessage) -> u64 {
        let mut pending = self.pending.lock();
        pending.push_back(message);
        let mut dropped = 0;
        while pending.len() > self.config.max_pending_messages.max(1) {
            pending.pop_front();
            dropped += 1;
        }
        drop(pending);

        if dropped > 0 {
            self.metrics.add(Counter::ChatMessagesDropped, dropped);
            warn!(channel = %self.channel, dropped, "Chat buffer full, dropped oldest messages");
        }
        dropped
    }

    /// Store every pending message that has a VOD to belong to.
    pub async fn flush(&self) -> Result<FlushReport> {
        let batch: Vec<ChatMessage> = self.pending.lock().drain(..).collect();
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }

        let from = batch.iter().map(|m| m.sent_at).min().unwrap_or_default();
        let to = batch.iter().map(|m| m.sent_at).max().unwrap_or_default();
        let candidates = match self.vods.list_covering(&self.channel, from, to).await {
            Ok(vods) => vods,
            Err(e) => {
                self.requeue(batch);
                return Err(e);
            }
        };
        let slack_ms = i64::try_from(self.config.attach_slack_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        let targets: Vec<Option<i64>> = batch
            .iter()
            .map(|m| covering_vod(&candidates, m.sent_at, slack_ms))
            .collect();

        let mut rows = Vec::new();
        let mut held = Vec::new();
        for (message, target) in batch.into_iter().zip(targets) {
            match target {
                Some(vod_id) => rows.push(NewChatMessage {
                    channel: self.channel.clone(),
                    vod_id,
                    message_id: message.message_id,
                    user_id: message.user_id,
                    username: message.username,
                    content: message.content,
                    sent_at: message.sent_at,
                }),
                None => held.push(message),
            }
        }

        let mut report = FlushReport::default();
        if !rows.is_empty() {
            match self.chat.append_batch(&rows).await {
                Ok(stored) => {
                    report.stored = stored;
                    report.duplicates = (rows.len() as u64).saturating_sub(stored);
                    self.metrics.add(Counter::ChatMessagesStored, stored);
                }
                Err(e) => {
                    self.requeue(rows.into_iter().map(unbound).chain(held));
                    return Err(e);
                }
            }
        }

        if !held.is_empty() {
            debug!(channel = %self.channel, held = held.len(), "Holding chat messages until a VOD appears");
            report.dropped = self.requeue(held);
        }
        report.held = self.pending_len();
        Ok(report)
    }

    /// Put messages back in front of anything queued since the drain.
    fn requeue(&self, messages: impl IntoIterator<Item = ChatMessage>) -> u64 {
        let mut pending = self.pending.lock();
        let newer: Vec<ChatMessage> = pending.drain(..).collect();
        pending.extend(messages);
        pending.extend(newer);

        let mut dropped = 0;
        while pending.len() > self.config.max_pending_messages.max(1) {
            pending.pop_front();
            dropped += 1;
        }
        drop(pending);
        if dropped > 0 {
            self.metrics.add(Counter::ChatMessagesDropped, dropped);
        }
        dropped
    }

    /// Record until cancelled, reconnecting with backoff.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let policy = self.reconnect_policy();
        let mut attempt = 0u32;

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.source.connect(&self.channel) => result,
            };

            match connected {
                Ok(stream) => {
                    info!(channel = %self.channel, "Chat connected");
                    attempt = 0;
                    match self.pump(stream, &cancel).await {
                        Ok(()) => debug!(channel = %self.channel, "Chat stream ended"),
                        Err(e) => warn!(channel = %self.channel, error = %e, "Chat stream failed"),
                    }
                }
                Err(e) => warn!(channel = %self.channel, error = %e, "Chat connect failed"),
            }
            if cancel.is_cancelled() {
                break;
            }

            attempt = attempt.saturating_add(1);
            self.metrics.incr(Counter::ChatReconnects);
            let delay = policy.delay_for_attempt(attempt);
            debug!(channel = %self.channel, attempt, delay_ms = delay.as_millis() as u64, "Reconnecting chat");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        if let Err(e) = self.flush().await {
            warn!(channel = %self.channel, error = %e, "Final chat flush failed");
        }
        debug!(channel = %self.channel, "Chat recorder stopped");
    }

    /// Read one connection until it ends, flushing on the interval or when
    /// a full batch is waiting.
    async fn pump(&self, mut stream: Box<dyn ChatStream>, cancel: &CancellationToken) -> std::result::Result<(), ChatError> {
        let mut ticker = interval(Duration::from_millis(self.config.flush_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let batch_size = self.config.flush_batch_size.max(1);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => self.flush_logged().await,
                next = stream.next_message() => match next? {
                    Some(message) => {
                        self.push(message);
                        if self.pending_len() >= batch_size {
                            self.flush_logged().await;
                        }
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    async fn flush_logged(&self) {
        if let Err(e) = self.flush().await {
            warn!(channel = %self.channel, error = %e, "Chat flush failed, will retry");
        }
    }
}

fn unbound(row: NewChatMessage) -> ChatMessage {
    ChatMessage {
        message_id: row.message_id,
        user_id: row.user_id,
        username: row.username,
        content: row.content,
        sent_at: row.sent_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vod(id: i64, date: i64, duration_secs: Option<i64>) -> VodDbModel {
        VodDbModel {
            id,
            channel: "chan".to_string(),
            twitch_vod_id: id.to_string(),
            title: String::new(),
            description: String::new(),
            date,
            duration_secs,
            priority: 0,
            download_state: "pending".to_string(),
            downloaded_path: None,
            processed: false,
            youtube_url: None,
            failure_reason: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_covering_vod() {
        // Newest first
        let vods = vec![vod(2, 10_000, None), vod(1, 1_000, Some(2))];

        assert_eq!(covering_vod(&vods, 500, 0), None);
        assert_eq!(covering_vod(&vods, 2_500, 0), Some(1));
        assert_eq!(covering_vod(&vods, 3_000, 0), Some(1));
        assert_eq!(covering_vod(&vods, 3_001, 0), None);
        assert_eq!(covering_vod(&vods, 3_500, 1_000), Some(1));
        assert_eq!(covering_vod(&vods, 10_000, 0), Some(2));
        assert_eq!(covering_vod(&vods, i64::MAX, 0), Some(2));
    }
}
