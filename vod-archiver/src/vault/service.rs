//! Token vault service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::cache::DataKeyCache;
use super::envelope::{self, DataKey, KEY_LEN, SealedToken};
use super::error::{KmsError, VaultError};
use super::kms::KeyManagementService;
use crate::Result;
use crate::database::repositories::TokenRepository;
use crate::database::time::now_ms;

/// Decrypted OAuth credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Epoch ms
    #[serde(default)]
    pub expires_at: Option<i64>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl OAuthToken {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            scopes: Vec::new(),
            token_type: default_token_type(),
            expires_at: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expires_at(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Whether the token expires within `skew` of `now_ms`.
    pub fn expires_within(&self, now_ms: i64, skew: Duration) -> bool {
        let skew_ms = i64::try_from(skew.as_millis()).unwrap_or(i64::MAX);
        self.expires_at
            .is_some_and(|exp| exp <= now_ms.saturating_add(skew_ms))
    }
}

impl std::fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthToken")
            .field("access_token", &"***")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***"))
            .field("scopes", &self.scopes)
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Exchanges a token for a fresh one with the issuing provider.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(
        &self,
        provider: &str,
        channel: &str,
        token: &OAuthToken,
    ) -> std::result::Result<OAuthToken, VaultError>;
}

/// Vault settings resolved from configuration.
#[derive(Clone)]
pub struct VaultSettings {
    /// KEK used for new and rotated data keys.
    pub active_kek_id: String,
    /// Static key for format-1 rows, if any still exist.
    pub legacy_key: Option<[u8; KEY_LEN]>,
    pub data_key_cache_ttl: Duration,
    pub kms_timeout: Duration,
    /// How close to expiry `load_fresh` refreshes.
    pub refresh_skew: Duration,
}

impl VaultSettings {
    pub fn new(active_kek_id: impl Into<String>) -> Self {
        Self {
            active_kek_id: active_kek_id.into(),
            legacy_key: None,
            data_key_cache_ttl: Duration::from_secs(300),
            kms_timeout: Duration::from_secs(10),
            refresh_skew: Duration::from_secs(300),
        }
    }

    pub fn with_legacy_key(mut self, key: [u8; KEY_LEN]) -> Self {
        self.legacy_key = Some(key);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.data_key_cache_ttl = ttl;
        self
    }
}

/// Envelope-encrypted OAuth token storage.
///
/// Each record gets its own random data key; only the KMS-wrapped form of
/// that key is stored. Every failure to unwrap or decrypt is surfaced as an
/// error and is never reported as a missing token.
pub struct TokenVault {
    repo: Arc<dyn TokenRepository>,
    kms: Arc<dyn KeyManagementService>,
    settings: VaultSettings,
    cache: DataKeyCache,
}

const ROTATE_ATTEMPTS: u32 = 3;

impl TokenVault {
    pub fn new(
        repo: Arc<dyn TokenRepository>,
        kms: Arc<dyn KeyManagementService>,
        settings: VaultSettings,
    ) -> Self {
        let cache = DataKeyCache::new(settings.data_key_cache_ttl);
        Self {
            repo,
            kms,
            settings,
            cache,
        }
    }

    pub fn active_kek_id(&self) -> &str {
        &self.settings.active_kek_id
    }

    async fn kms_wrap(&self, kek_id: &str, key: &DataKey) -> std::result::Result<Vec<u8>, KmsError> {
        timeout(self.settings.kms_timeout, self.kms.wrap(kek_id, key))
            .await
            .map_err(|_| KmsError::Unavailable("wrap timed out".into()))?
    }

    async fn kms_unwrap(&self, kek_id: &str, wrapped: &[u8]) -> std::result::Result<DataKey, KmsError> {
        let fingerprint = DataKeyCache::fingerprint(kek_id, wrapped);
        if let Some(key) = self.cache.get(&fingerprint) {
            return Ok(key);
        }
        let key = timeout(self.settings.kms_timeout, self.kms.unwrap(kek_id, wrapped))
            .await
            .map_err(|_| KmsError::Unavailable("unwrap timed out".into()))??;
        self.cache.insert(fingerprint, key.clone());
        Ok(key)
    }

    /// Encrypt and persist a token under a fresh data key.
    pub async fn store(&self, channel: &str, provider: &str, token: &OAuthToken) -> Result<()> {
        let plaintext = serde_json::to_vec(token).map_err(VaultError::from)?;
        let aad = envelope::token_aad(provider, channel);

        let data_key = DataKey::generate();
        let ciphertext = envelope::seal(data_key.as_bytes(), &plaintext, aad.as_bytes())?;
        let kek_id = self.settings.active_kek_id.clone();
        let wrapped_key = self.kms_wrap(&kek_id, &data_key).await.map_err(VaultError::from)?;

        let row = SealedToken::Envelope {
            wrapped_key,
            kek_id,
            ciphertext,
        }
        .into_row(provider, channel, token.expires_at, now_ms());
        self.repo.upsert_token(&row).await?;

        debug!(channel, provider, "Stored token");
        Ok(())
    }

    /// Decrypt the stored token, or `Ok(None)` when none is stored.
    pub async fn load(&self, channel: &str, provider: &str) -> Result<Option<OAuthToken>> {
        let Some(row) = self.repo.get_token(provider, channel).await? else {
            return Ok(None);
        };
        let sealed = SealedToken::from_row(&row)?;
        let plaintext = self.open(channel, provider, &sealed).await?;
        let token = serde_json::from_slice(&plaintext).map_err(VaultError::from)?;
        Ok(Some(token))
    }

    async fn open(&self, channel: &str, provider: &str, sealed: &SealedToken) -> Result<Vec<u8>> {
        let decrypt_error = || VaultError::Decrypt {
            provider: provider.to_string(),
            channel: channel.to_string(),
        };

        let plaintext = match sealed {
            SealedToken::Legacy { ciphertext } => {
                let key = self.settings.legacy_key.as_ref().ok_or(VaultError::MissingLegacyKey)?;
                envelope::open_legacy(key, ciphertext).ok_or_else(decrypt_error)?
            }
            SealedToken::Envelope {
                wrapped_key,
                kek_id,
                ciphertext,
            } => {
                let data_key = self
                    .kms_unwrap(kek_id, wrapped_key)
                    .await
                    .map_err(VaultError::from)?;
                let aad = envelope::token_aad(provider, channel);
                envelope::open(data_key.as_bytes(), ciphertext, aad.as_bytes()).ok_or_else(decrypt_error)?
            }
        };
        Ok(plaintext)
    }

    /// Re-wrap the record's data key under the active KEK, leaving the
    /// payload ciphertext untouched. Returns `false` when no token is stored.
    pub async fn rotate(&self, channel: &str, provider: &str) -> Result<bool> {
        for _ in 0..ROTATE_ATTEMPTS {
            let Some(row) = self.repo.get_token(provider, channel).await? else {
                return Ok(false);
            };
            let SealedToken::Envelope {
                wrapped_key, kek_id, ..
            } = SealedToken::from_row(&row)?
            else {
                return Err(VaultError::UnsupportedFormat(row.format_version).into());
            };

            let data_key = self.kms_unwrap(&kek_id, &wrapped_key).await.map_err(VaultError::from)?;
            let active = self.settings.active_kek_id.as_str();
            let rewrapped = self.kms_wrap(active, &data_key).await.map_err(VaultError::from)?;

            if self
                .repo
                .update_wrapped_key(provider, channel, &rewrapped, active, row.updated_at)
                .await?
            {
                info!(channel, provider, from = %kek_id, to = %active, "Rotated token data key");
                return Ok(true);
            }
            debug!(channel, provider, "Token changed during rotation, retrying");
        }
        Err(VaultError::Conflict {
            provider: provider.to_string(),
            channel: channel.to_string(),
        }
        .into())
    }

    /// Re-store a legacy record in envelope format. Returns whether a
    /// legacy record was converted.
    pub async fn migrate_legacy(&self, channel: &str, provider: &str) -> Result<bool> {
        let Some(row) = self.repo.get_token(provider, channel).await? else {
            return Ok(false);
        };
        let sealed = SealedToken::from_row(&row)?;
        if !matches!(sealed, SealedToken::Legacy { .. }) {
            return Ok(false);
        }

        let plaintext = self.open(channel, provider, &sealed).await?;
        let token: OAuthToken = serde_json::from_slice(&plaintext).map_err(VaultError::from)?;
        self.store(channel, provider, &token).await?;
        info!(channel, provider, "Migrated legacy token to envelope format");
        Ok(true)
    }

    /// Load a token, refreshing and re-storing it first when it is close to
    /// expiry. A failed refresh of a still-valid token falls back to it.
    pub async fn load_fresh(
        &self,
        channel: &str,
        provider: &str,
        refresher: &dyn TokenRefresher,
    ) -> Result<Option<OAuthToken>> {
        let Some(token) = self.load(channel, provider).await? else {
            return Ok(None);
        };

        let now = now_ms();
        if !token.expires_within(now, self.settings.refresh_skew) {
            return Ok(Some(token));
        }

        match refresher.refresh(provider, channel, &token).await {
            Ok(fresh) => {
                self.store(channel, provider, &fresh).await?;
                info!(channel, provider, "Refreshed token");
                Ok(Some(fresh))
            }
            Err(e) if token.expires_at.is_some_and(|exp| exp > now) => {
                warn!(channel, provider, error = %e, "Token refresh failed, using current token");
                Ok(Some(token))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop expired cached data keys.
    pub fn purge_cache(&self) -> usize {
        self.cache.purge_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_debug_redacts_secrets() {
        let token = OAuthToken::bearer("abc123").with_refresh_token("r3fr3sh");
        let debug = format!("{:?}", token);
        assert!(!debug.contains("abc123"));
        assert!(!debug.contains("r3fr3sh"));
    }

    #[test]
    fn test_expires_within() {
        let token = OAuthToken::bearer("a").with_expires_at(10_000);
        assert!(token.expires_within(9_000, Duration::from_secs(2)));
        assert!(!token.expires_within(5_000, Duration::from_secs(2)));
        assert!(!OAuthToken::bearer("a").expires_within(i64::MAX, Duration::ZERO));
    }

    #[test]
    fn test_payload_defaults() {
        let token: OAuthToken = serde_json::from_str(r#"{"access_token":"x"}"#).unwrap();
        assert_eq!(token.token_type, "bearer");
        assert!(token.scopes.is_empty());
    }
}
