// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Named in-memory secondary indexes: field value to set of record IDs.
//!
//! Indexes are derived, disposable structures — never consulted for
//! correctness, only for lookup speed. [`IndexManager::rebuild`] reconstructs
//! any index from the authoritative collection, so losing one is always
//! recoverable.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

const LATENCY_SAMPLES: usize = 100;

#[derive(Debug, Default)]
struct Index {
    // field value -> record ids
    buckets: HashMap<String, HashSet<String>>,
}

/// Per-index and aggregate statistics.
#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub indexes: usize,
    pub total_indexed_items: usize,
    pub hits: u64,
    pub misses: u64,
    /// Rolling average over the last 100 lookups, in microseconds.
    pub avg_lookup_micros: f64,
}

struct Counters {
    total_indexed_items: usize,
    hits: u64,
    misses: u64,
    lookup_micros: VecDeque<f64>,
}

pub struct IndexManager {
    indexes: RwLock<HashMap<String, Index>>,
    counters: RwLock<Counters>,
}

impl IndexManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(HashMap::new()),
            counters: RwLock::new(Counters {
                total_indexed_items: 0,
                hits: 0,
                misses: 0,
                lookup_micros: VecDeque::with_capacity(LATENCY_SAMPLES),
            }),
        }
    }

    /// Add `id` under `value` in the named index. O(1) amortized.
    pub fn add(&self, index: &str, value: &str, id: &str) {
        let mut indexes = self.indexes.write();
        let bucket = indexes
            .entry(index.to_string())
            .or_default()
            .buckets
            .entry(value.to_string())
            .or_default();
        if bucket.insert(id.to_string()) {
            self.counters.write().total_indexed_items += 1;
        }
    }

    /// Remove `id` from under `value`. Empty buckets are dropped.
    pub fn remove(&self, index: &str, value: &str, id: &str) {
        let mut indexes = self.indexes.write();
        let Some(idx) = indexes.get_mut(index) else {
            return;
        };
        let Some(bucket) = idx.buckets.get_mut(value) else {
            return;
        };
        if bucket.remove(id) {
            self.counters.write().total_indexed_items -= 1;
        }
        if bucket.is_empty() {
            idx.buckets.remove(value);
        }
    }

    /// Move `id` from one value to another.
    pub fn update(&self, index: &str, old_value: &str, new_value: &str, id: &str) {
        if old_value == new_value {
            return;
        }
        self.remove(index, old_value, id);
        self.add(index, new_value, id);
    }

    /// IDs indexed under `value`, tracking hit/miss and lookup latency.
    #[must_use]
    pub fn lookup(&self, index: &str, value: &str) -> Vec<String> {
        let start = Instant::now();
        let indexes = self.indexes.read();
        let ids: Vec<String> = indexes
            .get(index)
            .and_then(|idx| idx.buckets.get(value))
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default();
        drop(indexes);

        let hit = !ids.is_empty();
        crate::metrics::record_index_lookup(index, hit);
        let mut counters = self.counters.write();
        if hit {
            counters.hits += 1;
        } else {
            counters.misses += 1;
        }
        if counters.lookup_micros.len() >= LATENCY_SAMPLES {
            counters.lookup_micros.pop_front();
        }
        counters
            .lookup_micros
            .push_back(start.elapsed().as_secs_f64() * 1e6);
        ids
    }

    /// Rebuild the named index from a full collection.
    ///
    /// `extractor` yields the indexed values for each item (possibly several,
    /// e.g. tags); items without an `id` field are skipped.
    pub fn rebuild<F>(&self, index: &str, items: &[Value], extractor: F)
    where
        F: Fn(&Value) -> Vec<String>,
    {
        let mut fresh = Index::default();
        let mut indexed = 0usize;
        for item in items {
            let Some(id) = item.get("id").and_then(Value::as_str) else {
                continue;
            };
            for value in extractor(item) {
                if fresh
                    .buckets
                    .entry(value)
                    .or_default()
                    .insert(id.to_string())
                {
                    indexed += 1;
                }
            }
        }

        let mut indexes = self.indexes.write();
        let previous = indexes
            .insert(index.to_string(), fresh)
            .map(|old| old.buckets.values().map(HashSet::len).sum::<usize>())
            .unwrap_or(0);
        let mut counters = self.counters.write();
        counters.total_indexed_items = counters.total_indexed_items - previous + indexed;
        crate::metrics::record_index_rebuild(index, items.len());
    }

    /// Drop the named index entirely.
    pub fn drop_index(&self, index: &str) {
        let mut indexes = self.indexes.write();
        if let Some(old) = indexes.remove(index) {
            let removed: usize = old.buckets.values().map(HashSet::len).sum();
            self.counters.write().total_indexed_items -= removed;
        }
    }

    #[must_use]
    pub fn stats(&self) -> IndexStats {
        let indexes = self.indexes.read();
        let counters = self.counters.read();
        let avg = if counters.lookup_micros.is_empty() {
            0.0
        } else {
            counters.lookup_micros.iter().sum::<f64>() / counters.lookup_micros.len() as f64
        };
        IndexStats {
            indexes: indexes.len(),
            total_indexed_items: counters.total_indexed_items,
            hits: counters.hits,
            misses: counters.misses,
            avg_lookup_micros: avg,
        }
    }
}

impl Default for IndexManager {
    fn default() -> Self {
        Self::new()
    }
}
