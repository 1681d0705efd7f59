use dashmap::DashMap;
use std::time::{Duration, Instant};

use super::Cache;

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Bounded in-process cache with lazy expiry.
///
/// When full, expired entries are purged first; if that frees nothing, an
/// arbitrary entry is evicted. Arbitrary is fine here: losing a cached
/// score costs one neutral-default lookup.
#[derive(Debug)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    capacity: usize,
}

impl MemoryCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    fn make_room(&self, key: &str) {
        if self.entries.len() < self.capacity || self.entries.contains_key(key) {
            return;
        }
        if self.purge_expired() > 0 {
            return;
        }
        let victim = self.entries.iter().next().map(|e| e.key().clone());
        if let Some(victim) = victim {
            self.entries.remove(&victim);
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::with_capacity(16_384)
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let live = self
            .entries
            .get(key)
            .map(|entry| (entry.is_live(now), entry.value.clone()));
        match live {
            Some((true, value)) => Some(value),
            Some((false, _)) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        self.make_room(key);
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
    }

    fn expire(&self, key: &str) {
        self.entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::super::{get_json, set_json};
    use super::*;

    #[test]
    fn set_get_expire() {
        let cache = MemoryCache::default();
        cache.set("k", b"v".to_vec(), None);
        assert_eq!(cache.get("k"), Some(b"v".to_vec()));
        cache.expire("k");
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn ttl_elapses() {
        let cache = MemoryCache::default();
        cache.set("short", b"v".to_vec(), Some(Duration::ZERO));
        cache.set("long", b"v".to_vec(), Some(Duration::from_secs(60)));
        assert_eq!(cache.get("short"), None);
        assert!(cache.get("long").is_some());
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = MemoryCache::with_capacity(3);
        for i in 0..10 {
            cache.set(&format!("k{i}"), vec![i as u8], None);
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("k9"), Some(vec![9]));
    }

    #[test]
    fn expired_entries_are_evicted_first() {
        let cache = MemoryCache::with_capacity(2);
        cache.set("stale", vec![0], Some(Duration::ZERO));
        cache.set("keep", vec![1], None);
        cache.set("new", vec![2], None);
        assert_eq!(cache.get("keep"), Some(vec![1]));
        assert_eq!(cache.get("new"), Some(vec![2]));
    }

    #[test]
    fn json_helpers() {
        let cache = MemoryCache::default();
        set_json(&cache, "score", &0.75f64, None);
        assert_eq!(get_json::<f64>(&cache, "score"), Some(0.75));
        cache.set("garbage", b"{not json".to_vec(), None);
        assert_eq!(get_json::<f64>(&cache, "garbage"), None);
    }
}
