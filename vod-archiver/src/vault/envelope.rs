//! Sealed token formats and the AES-256-GCM primitives behind them.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};

use super::error::VaultError;
use crate::database::models::OAuthTokenDbModel;

/// Legacy rows: payload encrypted directly with a static key.
pub const FORMAT_LEGACY: i64 = 1;
/// Envelope rows: payload encrypted with a per-record data key wrapped by a KEK.
pub const FORMAT_ENVELOPE: i64 = 2;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// 256-bit symmetric key. Never persisted in the clear.
#[derive(Clone, PartialEq, Eq)]
pub struct DataKey([u8; KEY_LEN]);

impl DataKey {
    pub fn generate() -> Self {
        Self(rand::random::<[u8; KEY_LEN]>())
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; KEY_LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataKey(..)")
    }
}

/// A stored token, interpreted by its declared format version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SealedToken {
    Legacy {
        ciphertext: Vec<u8>,
    },
    Envelope {
        wrapped_key: Vec<u8>,
        kek_id: String,
        ciphertext: Vec<u8>,
    },
}

impl SealedToken {
    pub fn from_row(row: &OAuthTokenDbModel) -> Result<Self, VaultError> {
        match row.format_version {
            FORMAT_LEGACY => Ok(Self::Legacy {
                ciphertext: row.ciphertext.clone(),
            }),
            FORMAT_ENVELOPE => {
                let wrapped_key = row
                    .wrapped_key
                    .clone()
                    .ok_or_else(|| VaultError::MalformedRecord("envelope row without wrapped key".into()))?;
                let kek_id = row
                    .kek_id
                    .clone()
                    .ok_or_else(|| VaultError::MalformedRecord("envelope row without KEK id".into()))?;
                Ok(Self::Envelope {
                    wrapped_key,
                    kek_id,
                    ciphertext: row.ciphertext.clone(),
                })
            }
            other => Err(VaultError::UnsupportedFormat(other)),
        }
    }

    pub fn format_version(&self) -> i64 {
        match self {
            Self::Legacy { .. } => FORMAT_LEGACY,
            Self::Envelope { .. } => FORMAT_ENVELOPE,
        }
    }

    pub fn ciphertext(&self) -> &[u8] {
        match self {
            Self::Legacy { ciphertext } | Self::Envelope { ciphertext, .. } => ciphertext,
        }
    }

    /// Build the row to persist.
    pub fn into_row(
        self,
        provider: &str,
        channel: &str,
        expires_at: Option<i64>,
        updated_at: i64,
    ) -> OAuthTokenDbModel {
        let format_version = self.format_version();
        let (wrapped_key, kek_id, ciphertext) = match self {
            Self::Legacy { ciphertext } => (None, None, ciphertext),
            Self::Envelope {
                wrapped_key,
                kek_id,
                ciphertext,
            } => (Some(wrapped_key), Some(kek_id), ciphertext),
        };
        OAuthTokenDbModel {
            provider: provider.to_string(),
            channel: channel.to_string(),
            format_version,
            wrapped_key,
            kek_id,
            ciphertext,
            expires_at,
            updated_at,
        }
    }
}

/// Associated data binding a ciphertext to its row.
pub fn token_aad(provider: &str, channel: &str) -> String {
    format!("{provider}:{channel}")
}

/// Encrypt with a fresh random nonce. Output is `nonce || ciphertext || tag`.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, VaultError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| VaultError::Encrypt("invalid key length".into()))?;
    let nonce = rand::random::<[u8; NONCE_LEN]>();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| VaultError::Encrypt("AES-GCM encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`seal`]. Returns `None` on any authentication failure.
pub fn open(key: &[u8; KEY_LEN], sealed: &[u8], aad: &[u8]) -> Option<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return None;
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).ok()?;
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .ok()
}

/// Legacy rows carry no associated data.
pub fn seal_legacy(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
    seal(key, plaintext, &[])
}

pub fn open_legacy(key: &[u8; KEY_LEN], sealed: &[u8]) -> Option<Vec<u8>> {
    open(key, sealed, &[])
}
