//! Per-channel circuit breaker persisted in the `kv` table.
//!
//! Every job task for a channel shares one breaker row, and several process
//! instances may share the database file, so the state lives in storage and
//! each change is a compare-and-swap on the row's `updated_at`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::database::repositories::KvRepository;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// `kv` key holding the breaker record.
pub const CIRCUIT_STATE_KEY: &str = "circuit_state";

/// How many lost races a single update tolerates before giving up.
const MAX_CAS_ATTEMPTS: u32 = 5;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed (normal operation).
    Closed,
    /// Circuit is open (failing, rejecting requests).
    Open,
    /// One trial call is allowed through to test recovery.
    HalfOpen,
}

/// Persisted breaker document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub state: CircuitState,
    pub failure_count: u32,
    /// When `state` last changed, epoch ms. Drives the cooldown.
    pub last_transition_at: i64,
    /// Set while a half-open trial is in flight.
    #[serde(default)]
    pub trial_started_at: Option<i64>,
}

/// Outcome of evaluating a record for `allow`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowDecision {
    Allow,
    Deny,
    /// Allowed only if this record is written conditionally.
    Claim(BreakerRecord),
}

impl BreakerRecord {
    pub fn closed(now: i64) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_transition_at: now,
            trial_started_at: None,
        }
    }

    pub fn decide(&self, now: i64, cooldown_ms: i64) -> AllowDecision {
        match self.state {
            CircuitState::Closed => AllowDecision::Allow,
            CircuitState::Open if now - self.last_transition_at < cooldown_ms => AllowDecision::Deny,
            CircuitState::Open => AllowDecision::Claim(self.claim_trial(now, true)),
            CircuitState::HalfOpen => match self.trial_started_at {
                Some(started) if now - started < cooldown_ms => AllowDecision::Deny,
                // Trial owner vanished without reporting back
                _ => AllowDecision::Claim(self.claim_trial(now, false)),
            },
        }
    }

    fn claim_trial(&self, now: i64, transition: bool) -> Self {
        Self {
            state: CircuitState::HalfOpen,
            failure_count: self.failure_count,
            last_transition_at: if transition { now } else { self.last_transition_at },
            trial_started_at: Some(now),
        }
    }

    pub fn on_success(&self, now: i64) -> Self {
        match self.state {
            CircuitState::HalfOpen => Self::closed(now),
            // A late success must not shorten the cooldown
            CircuitState::Open => Self {
                failure_count: 0,
                ..self.clone()
            },
            CircuitState::Closed => Self {
                failure_count: 0,
                ..self.clone()
            },
        }
    }

    /// Give back a half-open trial whose call ended without an upstream
    /// verdict, so the next caller may claim it.
    pub fn on_release(&self) -> Self {
        match self.state {
            CircuitState::HalfOpen => Self {
                trial_started_at: None,
                ..self.clone()
            },
            _ => self.clone(),
        }
    }

    pub fn on_failure(&self, now: i64, failure_threshold: u32) -> Self {
        let failure_count = self.failure_count.saturating_add(1);
        match self.state {
            CircuitState::Closed if failure_count < failure_threshold => Self {
                failure_count,
                ..self.clone()
            },
            _ => Self {
                state: CircuitState::Open,
                failure_count,
                last_transition_at: now,
                trial_started_at: None,
            },
        }
    }
}

/// Circuit breaker for one channel.
pub struct CircuitBreaker {
    channel: String,
    kv: Arc<dyn KvRepository>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(
        channel: impl Into<String>,
        kv: Arc<dyn KvRepository>,
        failure_threshold: u32,
        cooldown: Duration,
    ) -> Self {
        Self {
            channel: channel.into(),
            kv,
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn cooldown_ms(&self) -> i64 {
        i64::try_from(self.cooldown.as_millis()).unwrap_or(i64::MAX)
    }

    /// Read the stored record and its version. A missing row is a fresh
    /// closed breaker; an unreadable document is treated the same way and
    /// overwritten by the next update.
    async fn load(&self) -> Result<(BreakerRecord, Option<i64>)> {
        let now = now_ms();
        match self.kv.get(&self.channel, CIRCUIT_STATE_KEY).await? {
            None => Ok((BreakerRecord::closed(now), None)),
            Some(entry) => match entry.decode::<BreakerRecord>() {
                Ok(record) => Ok((record, Some(entry.updated_at))),
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "Discarding unreadable breaker record");
                    Ok((BreakerRecord::closed(now), Some(entry.updated_at)))
                }
            },
        }
    }

    async fn write(&self, record: &BreakerRecord, version: Option<i64>) -> Result<bool> {
        let value = serde_json::to_string(record)?;
        let written = match version {
            Some(expected) => {
                self.kv
                    .compare_and_swap(&self.channel, CIRCUIT_STATE_KEY, &value, expected)
                    .await?
            }
            None => {
                self.kv
                    .insert_if_absent(&self.channel, CIRCUIT_STATE_KEY, &value)
                    .await?
            }
        };
        Ok(written.is_some())
    }

    /// Whether an outbound call may proceed now.
    ///
    /// Fails closed when the store cannot be read. Exactly one concurrent
    /// caller wins a half-open trial.
    pub async fn allow(&self) -> bool {
        let (record, version) = match self.load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "Breaker state unavailable, denying call");
                return false;
            }
        };

        match record.decide(now_ms(), self.cooldown_ms()) {
            AllowDecision::Allow => true,
            AllowDecision::Deny => false,
            AllowDecision::Claim(next) => match self.write(&next, version).await {
                Ok(true) => {
                    info!(channel = %self.channel, "Circuit breaker half-open, trial call allowed");
                    true
                }
                Ok(false) => {
                    debug!(channel = %self.channel, "Lost half-open trial claim");
                    false
                }
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "Failed to claim breaker trial");
                    false
                }
            },
        }
    }

    /// Record a successful outbound call.
    pub async fn record_success(&self) {
        match self.update(|r, now| r.on_success(now)).await {
            Ok(record) => debug!(channel = %self.channel, state = ?record.state, "Breaker success recorded"),
            Err(e) => warn!(channel = %self.channel, error = %e, "Failed to record breaker success"),
        }
    }

    /// Record a failed outbound call.
    pub async fn record_failure(&self) {
        let threshold = self.failure_threshold;
        match self.update(|r, now| r.on_failure(now, threshold)).await {
            Ok(record) if record.state == CircuitState::Open => warn!(
                channel = %self.channel,
                failures = record.failure_count,
                "Circuit breaker open"
            ),
            Ok(record) => debug!(
                channel = %self.channel,
                failures = record.failure_count,
                threshold,
                "Breaker failure recorded"
            ),
            Err(e) => warn!(channel = %self.channel, error = %e, "Failed to record breaker failure"),
        }
    }

    /// Release a half-open trial without recording an outcome. Used when the
    /// allowed call was abandoned before the upstream answered.
    pub async fn release_trial(&self) {
        match self.update(|r, _| r.on_release()).await {
            Ok(record) => debug!(channel = %self.channel, state = ?record.state, "Breaker trial released"),
            Err(e) => warn!(channel = %self.channel, error = %e, "Failed to release breaker trial"),
        }
    }

    /// Operator reset: drop the stored record so the breaker starts closed.
    pub async fn reset(&self) -> Result<()> {
        if self.kv.delete(&self.channel, CIRCUIT_STATE_KEY).await? {
            info!(channel = %self.channel, "Circuit breaker reset");
        }
        Ok(())
    }

    /// Current persisted state, without side effects.
    pub async fn snapshot(&self) -> Result<BreakerRecord> {
        Ok(self.load().await?.0)
    }

    async fn update<F>(&self, f: F) -> Result<BreakerRecord>
    where
        F: Fn(&BreakerRecord, i64) -> BreakerRecord + Send + Sync,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (current, version) = self.load().await?;
            let next = f(&current, now_ms());
            if next == current {
                return Ok(current);
            }
            if self.write(&next, version).await? {
                return Ok(next);
            }
        }
        Err(Error::Database(format!(
            "breaker update for {} lost {} consecutive races",
            self.channel, MAX_CAS_ATTEMPTS
        )))
    }
}
