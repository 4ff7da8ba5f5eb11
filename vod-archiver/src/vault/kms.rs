//! Key management service contract and a local implementation.

use std::collections::HashMap;

use async_trait::async_trait;

use super::envelope::{self, DataKey, KEY_LEN};
use super::error::KmsError;

/// Wraps and unwraps data keys under named key-encryption keys.
///
/// Implementations report connectivity problems as [`KmsError::Unavailable`]
/// and authorization problems as [`KmsError::AccessDenied`] so callers can
/// tell a retryable outage from a configuration fault.
#[async_trait]
pub trait KeyManagementService: Send + Sync {
    async fn wrap(&self, kek_id: &str, key: &DataKey) -> Result<Vec<u8>, KmsError>;
    async fn unwrap(&self, kek_id: &str, wrapped: &[u8]) -> Result<DataKey, KmsError>;
}

/// In-process KMS holding AES-256 KEKs in memory.
///
/// Wrapped keys are `nonce || AES-256-GCM(kek, dek)` with the KEK ID as
/// associated data.
pub struct LocalKms {
    keks: HashMap<String, [u8; KEY_LEN]>,
}

impl LocalKms {
    pub fn new() -> Self {
        Self { keks: HashMap::new() }
    }

    pub fn with_kek(mut self, kek_id: impl Into<String>, key: [u8; KEY_LEN]) -> Self {
        self.keks.insert(kek_id.into(), key);
        self
    }

    pub fn from_keys(keks: HashMap<String, [u8; KEY_LEN]>) -> Self {
        Self { keks }
    }

    pub fn contains(&self, kek_id: &str) -> bool {
        self.keks.contains_key(kek_id)
    }

    fn kek(&self, kek_id: &str) -> Result<&[u8; KEY_LEN], KmsError> {
        self.keks
            .get(kek_id)
            .ok_or_else(|| KmsError::UnknownKey(kek_id.to_string()))
    }
}

impl Default for LocalKms {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyManagementService for LocalKms {
    async fn wrap(&self, kek_id: &str, key: &DataKey) -> Result<Vec<u8>, KmsError> {
        let kek = self.kek(kek_id)?;
        envelope::seal(kek, key.as_bytes(), kek_id.as_bytes())
            .map_err(|e| KmsError::Unavailable(e.to_string()))
    }

    async fn unwrap(&self, kek_id: &str, wrapped: &[u8]) -> Result<DataKey, KmsError> {
        let kek = self.kek(kek_id)?;
        envelope::open(kek, wrapped, kek_id.as_bytes())
            .and_then(|bytes| DataKey::from_slice(&bytes))
            .ok_or_else(|| KmsError::InvalidWrappedKey(kek_id.to_string()))
    }
}
