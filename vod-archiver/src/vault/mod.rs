//! Envelope-encrypted OAuth credential storage.
//!
//! Rows in `oauth_tokens` are interpreted strictly by `format_version`:
//! format 1 is the legacy static-key encryption, format 2 stores a per-record
//! data key wrapped by a key-encryption key held in a [`KeyManagementService`].

pub mod cache;
pub mod envelope;
pub mod error;
pub mod kms;
pub mod service;

pub use cache::DataKeyCache;
pub use envelope::{DataKey, FORMAT_ENVELOPE, FORMAT_LEGACY, SealedToken};
pub use error::{KmsError, VaultError};
pub use kms::{KeyManagementService, LocalKms};
pub use service::{OAuthToken, TokenRefresher, TokenVault, VaultSettings};
