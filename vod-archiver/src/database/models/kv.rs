//! Key/value database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Generic per-channel key/value row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct KvEntryDbModel {
    pub channel: String,
    pub key: String,
    /// JSON document owned by whichever job owns `key`
    pub value: String,
    /// Strictly increasing per row; the optimistic-concurrency version
    pub updated_at: i64,
}

impl KvEntryDbModel {
    /// Decode the JSON value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.value)
    }
}
