//! Short-lived cache of unwrapped data keys.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use super::envelope::DataKey;

/// Unwrapped data keys keyed by a SHA-256 fingerprint of `(kek_id, wrapped_key)`.
///
/// Re-wrapping a key changes its fingerprint, so rotation never serves a key
/// under a stale KEK binding. Entries live in memory only.
pub struct DataKeyCache {
    entries: DashMap<[u8; 32], (DataKey, Instant)>,
    ttl: Duration,
}

impl DataKeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn fingerprint(kek_id: &str, wrapped_key: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(kek_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(wrapped_key);
        hasher.finalize().into()
    }

    pub fn get(&self, fingerprint: &[u8; 32]) -> Option<DataKey> {
        if self.ttl.is_zero() {
            return None;
        }
        let hit = self
            .entries
            .get(fingerprint)
            .map(|entry| (entry.0.clone(), entry.1.elapsed() < self.ttl));
        match hit {
            Some((key, true)) => Some(key),
            Some((_, false)) => {
                self.entries.remove(fingerprint);
                None
            }
            None => None,
        }
    }

    /// Also sweeps expired entries, including keys orphaned by rotation.
    pub fn insert(&self, fingerprint: [u8; 32], key: DataKey) {
        if self.ttl.is_zero() {
            return;
        }
        self.purge_expired();
        self.entries.insert(fingerprint, (key, Instant::now()));
    }

    /// Drop expired entries.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (_, inserted)| inserted.elapsed() < self.ttl);
        // Concurrent inserts can outgrow `before`
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_expiry() {
        let cache = DataKeyCache::new(Duration::from_millis(30));
        let fp = DataKeyCache::fingerprint("k1", b"wrapped");
        let key = DataKey::generate();
        cache.insert(fp, key.clone());
        assert_eq!(cache.get(&fp), Some(key));

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&fp), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_insert_sweeps_expired_entries() {
        let cache = DataKeyCache::new(Duration::from_millis(30));
        for i in 0..3u8 {
            cache.insert(DataKeyCache::fingerprint("k1", &[i]), DataKey::generate());
        }
        assert_eq!(cache.len(), 3);

        std::thread::sleep(Duration::from_millis(40));
        let fresh = DataKeyCache::fingerprint("k2", b"rotated");
        cache.insert(fresh, DataKey::generate());
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&fresh).is_some());
    }

    #[test]
    fn test_fingerprint_includes_kek() {
        assert_ne!(
            DataKeyCache::fingerprint("k1", b"w"),
            DataKeyCache::fingerprint("k2", b"w")
        );
    }

    #[test]
    fn test_zero_ttl_disables_cache() {
        let cache = DataKeyCache::new(Duration::ZERO);
        let fp = DataKeyCache::fingerprint("k1", b"w");
        cache.insert(fp, DataKey::generate());
        assert!(cache.get(&fp).is_none());
    }
}
