//! Response cache for idempotent analysis requests.
//!
//! Keys are the SHA-256 of `"METHOD:full-url"`. Entries expire after the
//! configured TTL; expired entries are dropped lazily on lookup and swept
//! every `cleanup_interval` inserts. When full, the oldest entry is evicted.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::CacheSettings;

/// Ten years; keeps `now + ttl` representable.
const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Value,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub total_entries: usize,
    pub active_entries: usize,
    pub expired_entries: usize,
    pub ttl_secs: u64,
    pub max_entries: usize,
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Debug)]
pub struct ResponseCache {
    settings: CacheSettings,
    entries: DashMap<String, CacheEntry>,
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
}

pub fn cache_key(method: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update(b":");
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Percentage rounded to two decimals.
fn hit_rate_percent(hits: u64, requests: u64) -> f64 {
    if requests == 0 {
        return 0.0;
    }
    (hits as f64 / requests as f64 * 10_000.0).round() / 100.0
}

impl ResponseCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            entries: DashMap::new(),
            requests: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    fn ttl(&self) -> Duration {
        Duration::seconds(self.settings.ttl_secs.min(MAX_TTL_SECS) as i64)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        if !self.settings.enabled {
            return None;
        }
        self.requests.fetch_add(1, Ordering::Relaxed);

        let now = Utc::now();
        // Copy out before mutating: holding a DashMap guard across `remove`
        // on the same shard deadlocks.
        let found = self
            .entries
            .get(key)
            .map(|entry| (entry.is_live(now), entry.payload.clone()));

        match found {
            Some((true, payload)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("cache hit");
                Some(payload)
            }
            Some((false, _)) => {
                self.entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: impl Into<String>, payload: Value) {
        if !self.settings.enabled || self.settings.max_entries == 0 {
            return;
        }
        let key = key.into();
        let inserts = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if self.settings.cleanup_interval > 0 && inserts % self.settings.cleanup_interval == 0 {
            self.remove_expired();
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.settings.max_entries {
            self.evict_oldest();
        }

        let now = Utc::now();
        self.entries.insert(
            key,
            CacheEntry {
                payload,
                created_at: now,
                expires_at: now + self.ttl(),
            },
        );
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.created_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
            debug!("evicted oldest cache entry");
        }
    }

    pub fn remove_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "swept expired cache entries");
        }
        removed
    }

    pub fn clear(&self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        info!(removed, "cache cleared");
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Utc::now();
        let total_entries = self.entries.len();
        let active_entries = self
            .entries
            .iter()
            .filter(|entry| entry.is_live(now))
            .count();
        let requests = self.requests.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        CacheStats {
            enabled: self.settings.enabled,
            total_entries,
            active_entries,
            expired_entries: total_entries.saturating_sub(active_entries),
            ttl_secs: self.settings.ttl_secs,
            max_entries: self.settings.max_entries,
            requests,
            hits,
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate: hit_rate_percent(hits, requests),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(ttl_secs: u64, max_entries: usize) -> CacheSettings {
        CacheSettings {
            enabled: true,
            ttl_secs,
            max_entries,
            cleanup_interval: 100,
        }
    }

    #[test]
    fn test_key_depends_on_method_and_url() {
        let get = cache_key("GET", "/api/target/analyze?target_keyword=ev");
        assert_eq!(get.len(), 64);
        assert_eq!(get, cache_key("get", "/api/target/analyze?target_keyword=ev"));
        assert_ne!(get, cache_key("POST", "/api/target/analyze?target_keyword=ev"));
        assert_ne!(get, cache_key("GET", "/api/target/analyze?target_keyword=ebike"));
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let cache = ResponseCache::new(settings(60, 10));
        assert!(cache.get("k").is_none());
        cache.insert("k", json!({"success": true}));
        assert_eq!(cache.get("k"), Some(json!({"success": true})));

        let stats = cache.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 50.0);
    }

    #[test]
    fn test_hit_rate_is_rounded_percentage() {
        assert_eq!(hit_rate_percent(0, 0), 0.0);
        assert_eq!(hit_rate_percent(1, 3), 33.33);
        assert_eq!(hit_rate_percent(2, 3), 66.67);
        assert_eq!(hit_rate_percent(3, 3), 100.0);
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let cache = ResponseCache::new(settings(0, 10));
        cache.insert("k", json!(1));
        assert_eq!(cache.stats().expired_entries, 1);
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let cache = ResponseCache::new(settings(60, 2));
        cache.insert("a", json!("a"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.insert("b", json!("b"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.insert("c", json!("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_disabled_cache_passes_through() {
        let mut s = settings(60, 10);
        s.enabled = false;
        let cache = ResponseCache::new(s);
        cache.insert("k", json!(1));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().requests, 0);
    }

    #[test]
    fn test_clear() {
        let cache = ResponseCache::new(settings(60, 10));
        cache.insert("a", json!(1));
        cache.insert("b", json!(2));
        assert_eq!(cache.clear(), 2);
        assert!(cache.is_empty());
    }
}
