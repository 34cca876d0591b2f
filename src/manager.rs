// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The application-facing facade: one object that fronts an adapter with a
//! read cache, change notifications, batch operations, and transactions.
//!
//! Reads go cache-first. Writes go to the adapter first and only then touch
//! the cache, so a failed write never leaves a phantom entry. Subscribers
//! are notified synchronously after the write lands; the old value is only
//! fetched when someone is actually listening for that key.
//!
//! Transactions are single-flight: at most one open at a time, a second
//! `transaction` call fails fast with [`StorageError::TransactionInProgress`].
//! On closure error every touched key is restored from a pre-write snapshot
//! and the cache entries for those keys are dropped (never repopulated, the
//! next read refills from the adapter).

use crate::adapters::traits::StorageAdapter;
use crate::cache::{CacheLayer, CacheStats};
use crate::config::EngineConfig;
use crate::error::StorageError;
use crate::time;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Set,
    Remove,
    Clear,
}

/// Payload delivered to subscribers on every mutation.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub key: String,
    pub value: Option<Value>,
    pub old_value: Option<Value>,
    pub operation: ChangeOperation,
    /// Epoch ms.
    pub timestamp: i64,
}

type Listener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Handle returned by [`StorageManager::subscribe`]; pass it back to
/// [`StorageManager::unsubscribe`] to stop receiving events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Outcome of a batch call. Failures are per-key; one bad key never aborts
/// the rest of the batch.
#[derive(Debug)]
pub struct BatchResult {
    pub success_count: usize,
    pub failure_count: usize,
    pub errors: Vec<(String, StorageError)>,
    pub elapsed: Duration,
}

impl BatchResult {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failure_count == 0
    }
}

struct Subscriptions {
    // key pattern -> listeners; "*" matches every key
    by_pattern: HashMap<String, Vec<(SubscriptionId, Listener)>>,
}

pub struct StorageManager {
    adapter: Arc<dyn StorageAdapter>,
    cache: CacheLayer,
    subscriptions: parking_lot::RwLock<Subscriptions>,
    next_subscription: AtomicU64,
    transaction_lock: Mutex<()>,
}

impl StorageManager {
    #[must_use]
    pub fn new(adapter: Arc<dyn StorageAdapter>, config: &EngineConfig) -> Self {
        Self {
            adapter,
            cache: CacheLayer::new(&config.cache),
            subscriptions: parking_lot::RwLock::new(Subscriptions {
                by_pattern: HashMap::new(),
            }),
            next_subscription: AtomicU64::new(1),
            transaction_lock: Mutex::new(()),
        }
    }

    /// Cache-first read. A miss falls through to the adapter and fills the
    /// cache; a missing key is `None`, never an error.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        if let Some(hit) = self.cache.get(key) {
            return Ok(Some(hit));
        }
        let value = self.adapter.get(key).await?;
        if let Some(value) = &value {
            self.cache.set(key, value.clone());
        }
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let old_value = self.old_value_if_watched(key).await;
        self.adapter.set(key, value).await?;
        self.cache.set(key, value.clone());
        self.notify(ChangeEvent {
            key: key.to_string(),
            value: Some(value.clone()),
            old_value: old_value.flatten(),
            operation: ChangeOperation::Set,
            timestamp: time::now_ms(),
        });
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let old_value = self.old_value_if_watched(key).await;
        self.adapter.remove(key).await?;
        self.cache.invalidate(key);
        self.notify(ChangeEvent {
            key: key.to_string(),
            value: None,
            old_value: old_value.flatten(),
            operation: ChangeOperation::Remove,
            timestamp: time::now_ms(),
        });
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.adapter.clear().await?;
        self.cache.clear();
        self.notify(ChangeEvent {
            key: "*".to_string(),
            value: None,
            old_value: None,
            operation: ChangeOperation::Clear,
            timestamp: time::now_ms(),
        });
        Ok(())
    }

    pub async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.adapter.keys().await
    }

    pub async fn has_key(&self, key: &str) -> Result<bool, StorageError> {
        if self.cache.get(key).is_some() {
            return Ok(true);
        }
        self.adapter.has_key(key).await
    }

    /// Register a listener for a key, or `"*"` for every key.
    pub fn subscribe<F>(&self, pattern: &str, listener: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .by_pattern
            .entry(pattern.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.subscriptions.write();
        for listeners in subs.by_pattern.values_mut() {
            listeners.retain(|(existing, _)| *existing != id);
        }
        subs.by_pattern.retain(|_, listeners| !listeners.is_empty());
    }

    /// Fetch several keys; failures are collected, not short-circuited.
    pub async fn get_batch(&self, keys: &[&str]) -> (HashMap<String, Value>, BatchResult) {
        let started = std::time::Instant::now();
        let mut found = HashMap::new();
        let mut result = BatchResult {
            success_count: 0,
            failure_count: 0,
            errors: Vec::new(),
            elapsed: Duration::ZERO,
        };
        for key in keys {
            match self.get(key).await {
                Ok(Some(value)) => {
                    found.insert((*key).to_string(), value);
                    result.success_count += 1;
                }
                Ok(None) => result.success_count += 1,
                Err(e) => {
                    result.failure_count += 1;
                    result.errors.push(((*key).to_string(), e));
                }
            }
        }
        result.elapsed = started.elapsed();
        (found, result)
    }

    /// Write several key/value pairs; failures are collected, not
    /// short-circuited.
    pub async fn set_batch(&self, entries: &[(&str, Value)]) -> BatchResult {
        let started = std::time::Instant::now();
        let mut result = BatchResult {
            success_count: 0,
            failure_count: 0,
            errors: Vec::new(),
            elapsed: Duration::ZERO,
        };
        for (key, value) in entries {
            match self.set(key, value).await {
                Ok(()) => result.success_count += 1,
                Err(e) => {
                    result.failure_count += 1;
                    result.errors.push(((*key).to_string(), e));
                }
            }
        }
        if result.failure_count > 0 {
            warn!(
                failures = result.failure_count,
                "batch write completed with failures"
            );
        }
        result.elapsed = started.elapsed();
        result
    }

    /// Run `operations` atomically with respect to failure: if the closure
    /// errors, every key it wrote or removed is restored to its pre-call
    /// state and the error surfaces as
    /// [`StorageError::TransactionRolledBack`].
    ///
    /// On commit, subscribers receive one change event per touched key with
    /// its final state. A rolled-back transaction emits no events: the net
    /// state change is nil.
    ///
    /// Only one transaction may be open; a concurrent call fails fast.
    pub async fn transaction<F, Fut, T>(&self, operations: F) -> Result<T, StorageError>
    where
        F: FnOnce(TransactionScope) -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        let _guard = self
            .transaction_lock
            .try_lock()
            .map_err(|_| StorageError::TransactionInProgress)?;

        let scope = TransactionScope {
            adapter: self.adapter.clone(),
            snapshot: Arc::new(Mutex::new(HashMap::new())),
        };
        let snapshot = scope.snapshot.clone();

        match operations(scope).await {
            Ok(value) => {
                // Committed: drop stale cache entries for touched keys (the
                // next read refills from the adapter) and notify subscribers
                // with each key's final state
                let snapshot = snapshot.lock().await;
                for (key, original) in snapshot.iter() {
                    self.cache.invalidate(key);
                    let current = match self.adapter.get(key).await {
                        Ok(v) => v,
                        Err(e) => {
                            debug!(key = %key, error = %e, "post-commit read failed for change event");
                            continue;
                        }
                    };
                    let operation = if current.is_some() {
                        ChangeOperation::Set
                    } else {
                        ChangeOperation::Remove
                    };
                    self.notify(ChangeEvent {
                        key: key.clone(),
                        value: current,
                        old_value: original.clone(),
                        operation,
                        timestamp: time::now_ms(),
                    });
                }
                Ok(value)
            }
            Err(cause) => {
                let snapshot = snapshot.lock().await;
                for (key, original) in snapshot.iter() {
                    let restored = match original {
                        Some(value) => self.adapter.set(key, value).await,
                        None => self.adapter.remove(key).await,
                    };
                    if let Err(e) = restored {
                        // Rollback is best-effort per key; keep going
                        error!(key = %key, error = %e, "transaction rollback failed for key");
                    }
                    self.cache.invalidate(key);
                }
                debug!(keys = snapshot.len(), "transaction rolled back");
                Err(StorageError::TransactionRolledBack(cause.to_string()))
            }
        }
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn invalidate_cache(&self, pattern: &str) {
        self.cache.invalidate_pattern(pattern);
    }

    /// Old value lookup for change events, skipped when nobody listens.
    async fn old_value_if_watched(&self, key: &str) -> Option<Option<Value>> {
        if !self.is_watched(key) {
            return None;
        }
        match self.get(key).await {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(key, error = %e, "old value unavailable for change event");
                Some(None)
            }
        }
    }

    fn is_watched(&self, key: &str) -> bool {
        let subs = self.subscriptions.read();
        subs.by_pattern.contains_key(key) || subs.by_pattern.contains_key("*")
    }

    fn notify(&self, event: ChangeEvent) {
        let listeners: Vec<Listener> = {
            let subs = self.subscriptions.read();
            let mut matched = Vec::new();
            if let Some(exact) = subs.by_pattern.get(&event.key) {
                matched.extend(exact.iter().map(|(_, l)| l.clone()));
            }
            if event.key != "*" {
                if let Some(wild) = subs.by_pattern.get("*") {
                    matched.extend(wild.iter().map(|(_, l)| l.clone()));
                }
            } else {
                // A clear event notifies every subscriber once
                for (pattern, listeners) in &subs.by_pattern {
                    if pattern != "*" {
                        matched.extend(listeners.iter().map(|(_, l)| l.clone()));
                    }
                }
            }
            matched
        };
        for listener in listeners {
            listener(&event);
        }
    }
}

/// Write surface handed to a [`StorageManager::transaction`] closure.
/// Records the pre-image of every touched key for rollback.
pub struct TransactionScope {
    adapter: Arc<dyn StorageAdapter>,
    snapshot: Arc<Mutex<HashMap<String, Option<Value>>>>,
}

impl TransactionScope {
    pub async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.adapter.get(key).await
    }

    pub async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.capture(key).await?;
        self.adapter.set(key, value).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.capture(key).await?;
        self.adapter.remove(key).await
    }

    /// Snapshot the first pre-image only; later writes to the same key keep
    /// the original.
    async fn capture(&self, key: &str) -> Result<(), StorageError> {
        let mut snapshot = self.snapshot.lock().await;
        if !snapshot.contains_key(key) {
            let original = self.adapter.get(key).await?;
            snapshot.insert(key.to_string(), original);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::local::LocalAdapter;
    use serde_json::json;

    fn manager() -> StorageManager {
        let config = EngineConfig::default();
        StorageManager::new(Arc::new(LocalAdapter::in_memory(&config)), &config)
    }

    #[tokio::test]
    async fn test_get_fills_cache() {
        let mgr = manager();
        mgr.set("task:t1", &json!({"id": "t1"})).await.unwrap();
        mgr.invalidate_cache("*");

        assert!(mgr.get("task:t1").await.unwrap().is_some());
        let before = mgr.cache_stats();
        assert!(mgr.get("task:t1").await.unwrap().is_some());
        let after = mgr.cache_stats();
        assert_eq!(after.hits, before.hits + 1);
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let mgr = manager();
        assert!(mgr.get("task:absent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_receives_old_and_new() {
        let mgr = manager();
        mgr.set("task:t1", &json!({"rev": 1})).await.unwrap();

        let events: Arc<parking_lot::Mutex<Vec<ChangeEvent>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = events.clone();
        mgr.subscribe("task:t1", move |e| sink.lock().push(e.clone()));

        mgr.set("task:t1", &json!({"rev": 2})).await.unwrap();
        mgr.remove("task:t1").await.unwrap();

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].operation, ChangeOperation::Set);
        assert_eq!(events[0].old_value, Some(json!({"rev": 1})));
        assert_eq!(events[0].value, Some(json!({"rev": 2})));
        assert_eq!(events[1].operation, ChangeOperation::Remove);
        assert_eq!(events[1].old_value, Some(json!({"rev": 2})));
        assert!(events[1].value.is_none());
    }

    #[tokio::test]
    async fn test_wildcard_subscription_sees_every_key() {
        let mgr = manager();
        let count = Arc::new(AtomicU64::new(0));
        let sink = count.clone();
        mgr.subscribe("*", move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        mgr.set("task:t1", &json!(1)).await.unwrap();
        mgr.set("project:p1", &json!(2)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let mgr = manager();
        let count = Arc::new(AtomicU64::new(0));
        let sink = count.clone();
        let id = mgr.subscribe("task:t1", move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        mgr.set("task:t1", &json!(1)).await.unwrap();
        mgr.unsubscribe(id);
        mgr.set("task:t1", &json!(2)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_subscribers_skips_old_value_read() {
        // Covered indirectly: set on a fresh manager must not populate the
        // cache with the old value or error on a missing key
        let mgr = manager();
        mgr.set("task:t1", &json!(1)).await.unwrap();
        assert_eq!(mgr.get("task:t1").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_batch_collects_per_key_failures() {
        let mgr = manager();
        let result = mgr
            .set_batch(&[
                ("task:t1", json!(1)),
                ("", json!(2)), // invalid key
                ("task:t3", json!(3)),
            ])
            .await;
        assert_eq!(result.success_count, 2);
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.errors[0].0, "");
        assert!(!result.is_complete());

        let (found, get_result) = mgr.get_batch(&["task:t1", "task:t3", "task:none"]).await;
        assert_eq!(found.len(), 2);
        assert_eq!(get_result.success_count, 3);
    }

    #[tokio::test]
    async fn test_transaction_commits() {
        let mgr = manager();
        let total = mgr
            .transaction(|tx| async move {
                tx.set("counter:a", &json!(1)).await?;
                tx.set("counter:b", &json!(2)).await?;
                Ok(3)
            })
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(mgr.get("counter:a").await.unwrap(), Some(json!(1)));
        assert_eq!(mgr.get("counter:b").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_transaction_commit_notifies_subscribers() {
        let mgr = manager();
        mgr.set("task:t1", &json!({"rev": 1})).await.unwrap();

        let events: Arc<parking_lot::Mutex<Vec<ChangeEvent>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = events.clone();
        mgr.subscribe("*", move |e| sink.lock().push(e.clone()));

        mgr.transaction(|tx| async move {
            tx.set("task:t1", &json!({"rev": 2})).await?;
            tx.remove("task:gone").await?;
            Ok(())
        })
        .await
        .unwrap();

        let mut events = events.lock();
        events.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key, "task:gone");
        assert_eq!(events[0].operation, ChangeOperation::Remove);
        assert_eq!(events[1].key, "task:t1");
        assert_eq!(events[1].operation, ChangeOperation::Set);
        assert_eq!(events[1].old_value, Some(json!({"rev": 1})));
        assert_eq!(events[1].value, Some(json!({"rev": 2})));
    }

    #[tokio::test]
    async fn test_rolled_back_transaction_emits_no_events() {
        let mgr = manager();
        let count = Arc::new(AtomicU64::new(0));
        let sink = count.clone();
        mgr.subscribe("*", move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        let _ = mgr
            .transaction(|tx| async move {
                tx.set("task:t1", &json!(1)).await?;
                Err::<(), _>(StorageError::Backend("boom".into()))
            })
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_all_writes() {
        let mgr = manager();
        mgr.set("task:t1", &json!({"rev": 1})).await.unwrap();

        let err = mgr
            .transaction(|tx| async move {
                tx.set("task:t1", &json!({"rev": 99})).await?;
                tx.set("task:t2", &json!({"id": "t2"})).await?;
                tx.remove("task:t1").await?;
                Err::<(), _>(StorageError::Backend("validation blew up".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::TransactionRolledBack(_)));
        // Pre-existing key restored, new key gone
        assert_eq!(mgr.get("task:t1").await.unwrap(), Some(json!({"rev": 1})));
        assert!(mgr.get("task:t2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transaction_rollback_does_not_prepopulate_cache() {
        let mgr = manager();
        mgr.set("task:t1", &json!({"rev": 1})).await.unwrap();

        let _ = mgr
            .transaction(|tx| async move {
                tx.set("task:t1", &json!({"rev": 2})).await?;
                Err::<(), _>(StorageError::Backend("boom".into()))
            })
            .await;

        // First read after rollback is a miss: the cache was invalidated,
        // not repopulated with the restored value
        let misses_before = mgr.cache_stats().misses;
        assert_eq!(mgr.get("task:t1").await.unwrap(), Some(json!({"rev": 1})));
        assert_eq!(mgr.cache_stats().misses, misses_before + 1);
    }

    #[tokio::test]
    async fn test_second_transaction_fails_fast() {
        let mgr = Arc::new(manager());
        let inner = mgr.clone();
        let result = mgr
            .transaction(|tx| async move {
                let nested = inner
                    .transaction(|_| async move { Ok(()) })
                    .await;
                assert!(matches!(
                    nested,
                    Err(StorageError::TransactionInProgress)
                ));
                tx.set("task:t1", &json!(1)).await?;
                Ok(())
            })
            .await;
        assert!(result.is_ok());
    }
}
