//! OAuth token database models.

use sqlx::FromRow;

/// Encrypted OAuth token row.
///
/// The columns are only meaningful together with `format_version`; use
/// [`crate::vault::SealedToken`] to interpret them.
#[derive(Debug, Clone, FromRow, PartialEq)]
pub struct OAuthTokenDbModel {
    pub provider: String,
    pub channel: String,
    pub format_version: i64,
    pub wrapped_key: Option<Vec<u8>>,
    pub kek_id: Option<String>,
    pub ciphertext: Vec<u8>,
    /// Unix epoch milliseconds, kept in clear for refresh scheduling
    pub expires_at: Option<i64>,
    pub updated_at: i64,
}
