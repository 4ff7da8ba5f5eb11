//! Credential vault error types.

use thiserror::Error;

/// Errors reported by a key management service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KmsError {
    /// The service could not be reached or did not answer in time.
    #[error("Key service unavailable: {0}")]
    Unavailable(String),

    /// The service refused the operation for this caller or key.
    #[error("Key service denied access: {0}")]
    AccessDenied(String),

    /// No key-encryption key with this ID exists.
    #[error("Unknown key-encryption key: {0}")]
    UnknownKey(String),

    /// The wrapped key failed authentication under the named KEK.
    #[error("Wrapped key rejected by key-encryption key {0}")]
    InvalidWrappedKey(String),
}

impl KmsError {
    /// Check if this error is transient and may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Errors that can occur while sealing or opening stored credentials.
///
/// None of these mean "no token"; a missing row is `Ok(None)` from the vault.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error(transparent)]
    Kms(#[from] KmsError),

    /// Authenticated decryption failed: wrong key or tampered ciphertext.
    #[error("Failed to decrypt token for {provider}:{channel}")]
    Decrypt { provider: String, channel: String },

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Unsupported token format version {0}")]
    UnsupportedFormat(i64),

    /// A legacy row exists but no legacy key is configured.
    #[error("Legacy token found but no legacy key is configured")]
    MissingLegacyKey,

    #[error("Malformed token record: {0}")]
    MalformedRecord(String),

    #[error("Token payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Token refresh failed: {0}")]
    Refresh(String),

    #[error("Token record for {provider}:{channel} changed concurrently")]
    Conflict { provider: String, channel: String },
}

impl VaultError {
    /// Check if this error is transient and may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Kms(e) => e.is_transient(),
            Self::Conflict { .. } => true,
            _ => false,
        }
    }
}
