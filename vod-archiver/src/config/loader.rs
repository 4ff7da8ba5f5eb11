//! Loading, environment overrides and validation.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use base64::Engine as _;
use tracing::{debug, info};

use super::app::{AppConfig, VaultConfig};
use crate::vault::envelope::KEY_LEN;
use crate::{Error, Result};

/// Environment variable naming the JSON config file.
pub const CONFIG_PATH_ENV: &str = "VOD_ARCHIVER_CONFIG";

impl AppConfig {
    /// Load from the file named by `VOD_ARCHIVER_CONFIG` (defaults when
    /// unset), then apply environment overrides and validate.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => {
                debug!("{} not set, using default configuration", CONFIG_PATH_ENV);
                Self::default()
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        info!(channels = config.channels.len(), "Configuration loaded");
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::io_path("reading config", path, e))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::config(format!("Invalid config file: {}", e)))
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(dir) = get("LOG_DIR") {
            self.log_dir = dir;
        }
        if let Some(keks) = get("VOD_ARCHIVER_KEKS") {
            for entry in keks.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                match entry.split_once('=') {
                    Some((id, key)) => {
                        self.vault.keks.insert(id.trim().to_string(), key.trim().to_string());
                    }
                    // Keep it so validation reports it
                    None => {
                        self.vault.keks.insert(entry.to_string(), String::new());
                    }
                }
            }
        }
        if let Some(active) = get("VOD_ARCHIVER_ACTIVE_KEK") {
            self.vault.active_kek_id = Some(active.trim().to_string());
        }
        if let Some(legacy) = get("VOD_ARCHIVER_LEGACY_KEY") {
            self.vault.legacy_key = Some(legacy.trim().to_string());
        }
        if let Some(client_id) = get("TWITCH_CLIENT_ID") {
            self.catalog.client_id = Some(client_id);
        }
    }

    /// Reject configurations the jobs cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for channel in &self.channels {
            let name = channel.name.trim();
            if name.is_empty() {
                return Err(Error::config("channel name must not be empty"));
            }
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(Error::config(format!("duplicate channel: {}", name)));
            }
            if channel.overrides.catalog_interval_secs == Some(0) {
                return Err(Error::config(format!("{}: catalog_interval_secs must be positive", name)));
            }
        }

        let positive = [
            ("breaker.failure_threshold", u64::from(self.breaker.failure_threshold)),
            ("breaker.cooldown_secs", self.breaker.cooldown_secs),
            ("catalog.interval_secs", self.catalog.interval_secs),
            ("catalog.page_size", u64::from(self.catalog.page_size)),
            ("processing.interval_secs", self.processing.interval_secs),
            ("retention.interval_secs", self.retention.interval_secs),
            ("chat.flush_interval_ms", self.chat.flush_interval_ms),
            ("chat.flush_batch_size", self.chat.flush_batch_size as u64),
            ("chat.max_pending_messages", self.chat.max_pending_messages as u64),
            ("chat.reconnect_initial_ms", self.chat.reconnect_initial_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(Error::config(format!("{} must be greater than zero", field)));
            }
        }
        if self.catalog.page_size > 100 {
            return Err(Error::config("catalog.page_size must be at most 100"));
        }

        self.vault.decode_keks()?;
        self.vault.decode_legacy_key()?;
        Ok(())
    }
}

fn decode_key(label: &str, encoded: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim().as_bytes())
        .map_err(|e| Error::config(format!("{} is not valid base64: {}", label, e)))?;
    <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
        Error::config(format!(
            "{} must decode to {} bytes, got {}",
            label,
            KEY_LEN,
            bytes.len()
        ))
    })
}

impl VaultConfig {
    /// Decode all KEKs and check the active one is among them.
    pub fn decode_keks(&self) -> Result<HashMap<String, [u8; KEY_LEN]>> {
        let active = self
            .active_kek_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::config("vault.active_kek_id (VOD_ARCHIVER_ACTIVE_KEK) is required"))?;

        let mut keks = HashMap::with_capacity(self.keks.len());
        for (id, encoded) in &self.keks {
            if id.is_empty() {
                return Err(Error::config("KEK id must not be empty"));
            }
            keks.insert(id.clone(), decode_key(&format!("KEK {}", id), encoded)?);
        }
        if !keks.contains_key(active) {
            return Err(Error::config(format!("active KEK {} is not configured", active)));
        }
        Ok(keks)
    }

    pub fn decode_legacy_key(&self) -> Result<Option<[u8; KEY_LEN]>> {
        self.legacy_key
            .as_deref()
            .map(|encoded| decode_key("legacy key", encoded))
            .transpose()
    }
}
