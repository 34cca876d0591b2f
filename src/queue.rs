// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable FIFO queue of pending mutations for offline operation.
//!
//! Entries are persisted through the local adapter under a reserved key so a
//! queued mutation survives process restart. `enqueue` dedups by
//! `(entity, id)` — a newer op for the same record replaces the older one —
//! and evicts the oldest entry past `max_size` instead of rejecting the
//! write: local write availability beats replication completeness, and the
//! loss is surfaced through the queue-depth and eviction metrics.
//!
//! Draining is FIFO; an entry that keeps failing is retried up to
//! `max_retries` attempts and then dropped with a warning, never silently.

use crate::adapters::traits::StorageAdapter;
use crate::config::{QueueConfig, OFFLINE_QUEUE_KEY};
use crate::error::StorageError;
use crate::key::StorageKey;
use crate::time;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// The mutation kind a queue entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Set,
    Remove,
}

/// One pending mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub key: String,
    /// `None` for removes.
    pub value: Option<Value>,
    pub operation: Operation,
    pub enqueued_at: i64,
    pub retry_count: u32,
}

impl QueueEntry {
    #[must_use]
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
            operation: Operation::Set,
            enqueued_at: time::now_ms(),
            retry_count: 0,
        }
    }

    #[must_use]
    pub fn remove(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            operation: Operation::Remove,
            enqueued_at: time::now_ms(),
            retry_count: 0,
        }
    }

    /// Dedup identity: `(entity, id)` from the key.
    fn record_identity(&self) -> (String, Option<String>) {
        match StorageKey::parse(&self.key) {
            Ok(parsed) => (parsed.entity, parsed.id),
            Err(_) => (self.key.clone(), None),
        }
    }
}

pub struct OfflineQueue {
    storage: Arc<dyn StorageAdapter>,
    config: QueueConfig,
    entries: Mutex<VecDeque<QueueEntry>>,
    processing: AtomicBool,
}

impl OfflineQueue {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageAdapter>, config: QueueConfig) -> Self {
        Self {
            storage,
            config,
            entries: Mutex::new(VecDeque::new()),
            processing: AtomicBool::new(false),
        }
    }

    /// Reload persisted entries after a restart.
    pub async fn load(&self) -> Result<(), StorageError> {
        let Some(stored) = self.storage.get(OFFLINE_QUEUE_KEY).await? else {
            return Ok(());
        };
        let loaded: VecDeque<QueueEntry> =
            serde_json::from_value(stored).map_err(|e| StorageError::Corruption {
                key: OFFLINE_QUEUE_KEY.to_string(),
                reason: e.to_string(),
            })?;
        let depth = loaded.len();
        *self.entries.lock().await = loaded;
        crate::metrics::set_offline_queue_depth(depth);
        debug!(depth, "offline queue restored");
        Ok(())
    }

    /// Queue a mutation, replacing any earlier entry for the same record.
    pub async fn enqueue(&self, entry: QueueEntry) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;

        let identity = entry.record_identity();
        if let Some(pos) = entries.iter().position(|e| e.record_identity() == identity) {
            // Newer op for the same record wins; position need not be kept
            entries.remove(pos);
        }
        while entries.len() >= self.config.max_size {
            if let Some(evicted) = entries.pop_front() {
                warn!(key = %evicted.key, "offline queue full; evicting oldest entry");
                crate::metrics::record_queue_evicted();
            }
        }
        entries.push_back(entry);
        crate::metrics::set_offline_queue_depth(entries.len());
        self.persist(&entries).await
    }

    /// Drain the queue in order, invoking `handler` per entry.
    ///
    /// A failing entry goes back to the tail with its retry count bumped;
    /// once it exceeds `max_retries` attempts it is dropped and logged.
    /// Returns the number of entries successfully applied. Reentrant calls
    /// return immediately; shutdown is honored between entries.
    pub async fn process_all<H, Fut>(
        &self,
        mut handler: H,
        shutdown: &tokio::sync::watch::Receiver<bool>,
    ) -> Result<usize, StorageError>
    where
        H: FnMut(QueueEntry) -> Fut,
        Fut: Future<Output = Result<(), StorageError>>,
    {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(0);
        }
        let result = self.drain(&mut handler, shutdown).await;
        self.processing.store(false, Ordering::SeqCst);
        result
    }

    async fn drain<H, Fut>(
        &self,
        handler: &mut H,
        shutdown: &tokio::sync::watch::Receiver<bool>,
    ) -> Result<usize, StorageError>
    where
        H: FnMut(QueueEntry) -> Fut,
        Fut: Future<Output = Result<(), StorageError>>,
    {
        let mut applied = 0;
        // Entries enqueued after the drain starts wait for the next pass
        let batch = {
            let mut entries = self.entries.lock().await;
            std::mem::take(&mut *entries)
        };
        let mut remaining: VecDeque<QueueEntry> = VecDeque::new();

        let mut batch = batch.into_iter();
        for mut entry in batch.by_ref() {
            if *shutdown.borrow() {
                remaining.push_back(entry);
                break;
            }
            match handler(entry.clone()).await {
                Ok(()) => applied += 1,
                Err(err) => {
                    entry.retry_count += 1;
                    if entry.retry_count >= self.config.max_retries {
                        warn!(
                            key = %entry.key,
                            retries = entry.retry_count,
                            error = %err,
                            "dropping queued mutation after exhausting retries"
                        );
                        crate::metrics::record_queue_dropped("offline");
                    } else {
                        debug!(key = %entry.key, error = %err, "queued mutation failed; will retry");
                        remaining.push_back(entry);
                    }
                }
            }
        }
        remaining.extend(batch);

        let mut entries = self.entries.lock().await;
        // Failures go to the front so anything enqueued mid-drain stays newer
        for entry in remaining.into_iter().rev() {
            entries.push_front(entry);
        }
        crate::metrics::set_offline_queue_depth(entries.len());
        self.persist(&entries).await?;
        Ok(applied)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn persist(&self, entries: &VecDeque<QueueEntry>) -> Result<(), StorageError> {
        let value = serde_json::to_value(entries).map_err(|e| StorageError::Serialization {
            key: OFFLINE_QUEUE_KEY.to_string(),
            source: e,
        })?;
        self.storage.set(OFFLINE_QUEUE_KEY, &value).await
    }
}
