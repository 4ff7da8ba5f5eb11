//! Twitch Helix catalog client.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use dashmap::DashMap;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, trace};

use super::client::{CatalogClient, CatalogError, CatalogPage, CatalogVideo};
use crate::vault::TokenVault;

#[derive(Debug, Deserialize)]
struct HelixList<T> {
    data: Vec<T>,
    #[serde(default)]
    pagination: Option<HelixPagination>,
}

#[derive(Debug, Deserialize)]
struct HelixPagination {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelixUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct HelixVideo {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    created_at: String,
    #[serde(default)]
    duration: Option<String>,
}

/// Parse Helix durations such as `3h2m1s` or `45s`.
pub fn parse_helix_duration(s: &str) -> Option<i64> {
    let mut total = 0i64;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: i64 = digits.parse().ok()?;
        digits.clear();
        total += match c {
            'h' => value * 3600,
            'm' => value * 60,
            's' => value,
            _ => return None,
        };
    }
    digits.is_empty().then_some(total)
}

fn classify_status(status: StatusCode, body: &str) -> CatalogError {
    let detail = format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>());
    match status {
        StatusCode::TOO_MANY_REQUESTS => CatalogError::Transient(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CatalogError::Unauthorized(detail),
        s if s.is_server_error() => CatalogError::Transient(detail),
        _ => CatalogError::Permanent(detail),
    }
}

fn classify_transport(err: reqwest::Error) -> CatalogError {
    CatalogError::Transient(err.to_string())
}

/// Helix client authenticating with a token held in the vault under
/// `(channel, token_provider)`.
pub struct HelixClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    vault: Arc<TokenVault>,
    token_provider: String,
    user_ids: DashMap<String, String>,
}

impl HelixClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        vault: Arc<TokenVault>,
        token_provider: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            vault,
            token_provider: token_provider.into(),
            user_ids: DashMap::new(),
        }
    }

    async fn access_token(&self, channel: &str) -> Result<String, CatalogError> {
        match self.vault.load(channel, &self.token_provider).await {
            Ok(Some(token)) => Ok(token.access_token),
            Ok(None) => Err(CatalogError::Unauthorized(format!(
                "no {} token stored for {}",
                self.token_provider, channel
            ))),
            Err(e) => Err(CatalogError::Credentials(e.to_string())),
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        channel: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<HelixList<T>, CatalogError> {
        let token = self.access_token(channel).await?;
        let url = format!("{}/{}", self.base_url, path);
        trace!(%url, ?query, "Helix request");

        let response = self
            .http
            .get(&url)
            .query(query)
            .header("Client-Id", &self.client_id)
            .bearer_auth(token)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        response.json().await.map_err(classify_transport)
    }

    async fn user_id(&self, channel: &str) -> Result<String, CatalogError> {
        if let Some(id) = self.user_ids.get(channel) {
            return Ok(id.value().clone());
        }
        let users: HelixList<HelixUser> = self
            .get(channel, "users", &[("login", channel.to_string())])
            .await?;
        let id = users
            .data
            .into_iter()
            .next()
            .map(|u| u.id)
            .ok_or_else(|| CatalogError::UnknownChannel(channel.to_string()))?;
        debug!(channel, user_id = %id, "Resolved Helix user id");
        self.user_ids.insert(channel.to_string(), id.clone());
        Ok(id)
    }
}

#[async_trait]
impl CatalogClient for HelixClient {
    async fn list_videos(
        &self,
        channel: &str,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<CatalogPage, CatalogError> {
        let user_id = self.user_id(channel).await?;
        let mut query = vec![
            ("user_id", user_id),
            ("type", "archive".to_string()),
            ("first", page_size.clamp(1, 100).to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("after", cursor.to_string()));
        }

        let list: HelixList<HelixVideo> = self.get(channel, "videos", &query).await?;
        let mut videos = Vec::with_capacity(list.data.len());
        for v in list.data {
            let created_at = DateTime::parse_from_rfc3339(&v.created_at)
                .map_err(|e| CatalogError::Permanent(format!("bad created_at {:?}: {}", v.created_at, e)))?
                .timestamp_millis();
            videos.push(CatalogVideo {
                duration_secs: v.duration.as_deref().and_then(parse_helix_duration),
                id: v.id,
                title: v.title,
                description: v.description,
                created_at,
            });
        }

        // Helix returns a cursor on the last page too; an empty page ends the listing
        let next_cursor = if videos.is_empty() {
            None
        } else {
            list.pagination.and_then(|p| p.cursor).filter(|c| !c.is_empty())
        };
        Ok(CatalogPage { videos, next_cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_helix_duration() {
        assert_eq!(parse_helix_duration("3h2m1s"), Some(3 * 3600 + 2 * 60 + 1));
        assert_eq!(parse_helix_duration("45s"), Some(45));
        assert_eq!(parse_helix_duration("10m"), Some(600));
        assert_eq!(parse_helix_duration("12"), None);
        assert_eq!(parse_helix_duration("1d"), None);
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            CatalogError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad"),
            CatalogError::Permanent(_)
        ));
    }

    #[test]
    fn test_video_list_decoding() {
        let raw = r#"{
            "data": [{"id": "v1", "title": "t", "description": "", "created_at": "2024-05-01T12:00:00Z", "duration": "1h0m0s"}],
            "pagination": {"cursor": "abc"}
        }"#;
        let list: HelixList<HelixVideo> = serde_json::from_str(raw).unwrap();
        assert_eq!(list.data[0].id, "v1");
        assert_eq!(list.pagination.unwrap().cursor.as_deref(), Some("abc"));
    }
}
