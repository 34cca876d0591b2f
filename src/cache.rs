// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory read accelerator for `StorageManager`.
//!
//! LRU-bounded with a global TTL. Disposable by contract: losing the cache
//! loses nothing, and every mutation path invalidates rather than populates.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::CacheConfig;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    inserted_at: Instant,
    last_access: Instant,
    access_count: u64,
}

/// Cache observability counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub total_requests: u64,
}

impl CacheStats {
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.hits as f64 / self.total_requests as f64
    }
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

pub struct CacheLayer {
    state: Mutex<CacheState>,
    max_entries: usize,
    ttl: Duration,
}

impl CacheLayer {
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_entries: config.max_entries,
            ttl: Duration::from_millis(config.ttl_ms),
        }
    }

    /// Fresh value for `key`, or `None` on miss/expiry.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut state = self.state.lock();
        let now = Instant::now();

        let expired = match state.entries.get(key) {
            Some(entry) => now.duration_since(entry.inserted_at) > self.ttl,
            None => {
                state.misses += 1;
                crate::metrics::record_cache(false);
                return None;
            }
        };
        if expired {
            state.entries.remove(key);
            state.misses += 1;
            crate::metrics::record_cache(false);
            return None;
        }

        let entry = state.entries.get_mut(key).unwrap();
        entry.last_access = now;
        entry.access_count += 1;
        let value = entry.value.clone();
        state.hits += 1;
        crate::metrics::record_cache(true);
        Some(value)
    }

    pub fn set(&self, key: &str, value: Value) {
        let mut state = self.state.lock();
        let now = Instant::now();

        if !state.entries.contains_key(key) && state.entries.len() >= self.max_entries {
            // Evict the least recently used entry
            if let Some(victim) = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            {
                state.entries.remove(&victim);
                state.evictions += 1;
                crate::metrics::record_cache_eviction();
            }
        }

        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: now,
                last_access: now,
                access_count: 0,
            },
        );
        crate::metrics::set_cache_entries(state.entries.len());
    }

    pub fn invalidate(&self, key: &str) {
        let mut state = self.state.lock();
        state.entries.remove(key);
        crate::metrics::set_cache_entries(state.entries.len());
    }

    /// Invalidate all keys matching a glob pattern (`*` wildcard).
    pub fn invalidate_pattern(&self, pattern: &str) {
        let mut state = self.state.lock();
        state.entries.retain(|key, _| !glob_match(pattern, key));
        crate::metrics::set_cache_entries(state.entries.len());
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        crate::metrics::set_cache_entries(0);
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            size: state.entries.len(),
            total_requests: state.hits + state.misses,
        }
    }
}

/// Minimal glob matching: `*` matches any run of characters.
fn glob_match(pattern: &str, key: &str) -> bool {
    fn inner(p: &[u8], k: &[u8]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], k) || (!k.is_empty() && inner(p, &k[1..])),
            (Some(pc), Some(kc)) if pc == kc => inner(&p[1..], &k[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), key.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(max_entries: usize, ttl_ms: u64) -> CacheLayer {
        CacheLayer::new(&CacheConfig {
            max_entries,
            ttl_ms,
        })
    }

    #[test]
    fn test_set_get() {
        let c = cache(10, 60_000);
        c.set("project:p1", json!({"id": "p1"}));
        assert_eq!(c.get("project:p1"), Some(json!({"id": "p1"})));
        assert_eq!(c.get("project:p2"), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let c = cache(10, 0);
        c.set("project:p1", json!(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(c.get("project:p1"), None);
    }

    #[test]
    fn test_lru_eviction() {
        let c = cache(2, 60_000);
        c.set("a", json!(1));
        std::thread::sleep(Duration::from_millis(2));
        c.set("b", json!(2));
        std::thread::sleep(Duration::from_millis(2));
        // Touch "a" so "b" becomes the LRU victim
        c.get("a");
        std::thread::sleep(Duration::from_millis(2));
        c.set("c", json!(3));

        assert!(c.get("a").is_some());
        assert!(c.get("b").is_none());
        assert!(c.get("c").is_some());
        assert_eq!(c.stats().evictions, 1);
    }

    #[test]
    fn test_invalidate_pattern() {
        let c = cache(10, 60_000);
        c.set("project:p1", json!(1));
        c.set("project:p2", json!(2));
        c.set("task:t1", json!(3));

        c.invalidate_pattern("project:*");
        assert!(c.get("project:p1").is_none());
        assert!(c.get("project:p2").is_none());
        assert!(c.get("task:t1").is_some());
    }

    #[test]
    fn test_stats() {
        let c = cache(10, 60_000);
        c.set("a", json!(1));
        c.get("a");
        c.get("a");
        c.get("missing");

        let stats = c.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("project:*", "project:p1"));
        assert!(glob_match("*:p1", "project:p1"));
        assert!(!glob_match("task:*", "project:p1"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }
}
