//! Dependency-tagged statistics cache, per spec §4.4's cache contract: an
//! in-process mapping from a composite key to (value, expiry, dependency
//! tags), with tag-based bulk invalidation and bounded size under LRU
//! eviction.
//!
//! `dashmap` gives lock-free concurrent reads/writes per shard; `parking_lot`
//! backs the small amount of ordering bookkeeping (the LRU queue and the
//! tag→keys reverse index) that needs to stay consistent across shards.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

struct CacheEntry {
    value: serde_json::Value,
    expires_at: DateTime<Utc>,
    tags: Vec<String>,
}

/// Composes an operation name and its parameters into a single cache key,
/// mirroring spec §4.4's "composite key (operation name + parameter tuple)".
pub fn cache_key(operation: &str, params: &[&dyn std::fmt::Display]) -> String {
    let mut key = operation.to_string();
    for param in params {
        key.push('|');
        key.push_str(&param.to_string());
    }
    key
}

pub struct StatsCache {
    entries: DashMap<String, CacheEntry>,
    tag_index: DashMap<String, HashSet<String>>,
    lru: Mutex<VecDeque<String>>,
    max_entries: usize,
}

impl StatsCache {
    pub fn new(max_entries: usize) -> Self {
        StatsCache {
            entries: DashMap::new(),
            tag_index: DashMap::new(),
            lru: Mutex::new(VecDeque::new()),
            max_entries,
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = self.entries.get(key)?;
        if entry.expires_at < Utc::now() {
            drop(entry);
            self.remove(key);
            return None;
        }
        let value = serde_json::from_value(entry.value.clone()).ok()?;
        drop(entry);
        self.touch(key);
        value
    }

    pub fn put<T: Serialize>(&self, key: String, ttl: Duration, tags: Vec<String>, value: &T) {
        let Ok(value) = serde_json::to_value(value) else {
            return;
        };
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));

        for tag in &tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        self.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                expires_at,
                tags,
            },
        );
        self.touch(&key);
        self.evict_if_over_capacity();
    }

    /// Removes every entry carrying `tag`, per spec §4.4's
    /// `invalidate(tag)` removing "all entries with that tag".
    pub fn invalidate(&self, tag: &str) {
        let Some((_, keys)) = self.tag_index.remove(tag) else {
            return;
        };
        for key in keys {
            self.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove(&self, key: &str) {
        if let Some((_, entry)) = self.entries.remove(key) {
            for tag in entry.tags {
                if let Some(mut keys) = self.tag_index.get_mut(&tag) {
                    keys.remove(key);
                }
            }
        }
        self.lru.lock().retain(|k| k != key);
    }

    fn touch(&self, key: &str) {
        let mut lru = self.lru.lock();
        lru.retain(|k| k != key);
        lru.push_back(key.to_string());
    }

    fn evict_if_over_capacity(&self) {
        loop {
            if self.entries.len() <= self.max_entries {
                break;
            }
            let oldest = {
                let mut lru = self.lru.lock();
                lru.pop_front()
            };
            match oldest {
                Some(key) => self.remove(&key),
                None => break,
            }
        }
    }
}

impl Default for StatsCache {
    fn default() -> Self {
        StatsCache::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let cache = StatsCache::new(10);
        cache.put(
            cache_key("player_stats", &[&"p1"]),
            Duration::from_secs(60),
            vec!["player:p1".to_string()],
            &42i32,
        );
        let value: Option<i32> = cache.get(&cache_key("player_stats", &[&"p1"]));
        assert_eq!(value, Some(42));
    }

    #[test]
    fn invalidate_removes_all_entries_with_tag() {
        let cache = StatsCache::new(10);
        cache.put(
            "a".to_string(),
            Duration::from_secs(60),
            vec!["player:p1".to_string()],
            &1i32,
        );
        cache.put(
            "b".to_string(),
            Duration::from_secs(60),
            vec!["player:p1".to_string(), "leaderboard".to_string()],
            &2i32,
        );
        cache.put(
            "c".to_string(),
            Duration::from_secs(60),
            vec!["leaderboard".to_string()],
            &3i32,
        );
        cache.invalidate("player:p1");
        assert_eq!(cache.get::<i32>("a"), None);
        assert_eq!(cache.get::<i32>("b"), None);
        assert_eq!(cache.get::<i32>("c"), Some(3));
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let cache = StatsCache::new(10);
        cache.put(
            "k".to_string(),
            Duration::from_millis(0),
            vec![],
            &"value".to_string(),
        );
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get::<String>("k"), None);
    }

    #[test]
    fn lru_eviction_respects_capacity() {
        let cache = StatsCache::new(2);
        cache.put("a".to_string(), Duration::from_secs(60), vec![], &1i32);
        cache.put("b".to_string(), Duration::from_secs(60), vec![], &2i32);
        cache.put("c".to_string(), Duration::from_secs(60), vec![], &3i32);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get::<i32>("a"), None);
        assert_eq!(cache.get::<i32>("c"), Some(3));
    }
}
