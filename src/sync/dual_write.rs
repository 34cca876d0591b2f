// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local-first dual writes with asynchronous remote propagation.
//!
//! Every write lands on the local adapter first and the call succeeds on
//! that alone; the remote copy is best-effort. The caller never touches the
//! remote: each mutation goes into a persisted queue and [`flush`] drains it
//! in the background with exponential backoff, so a slow or down remote
//! never surfaces to callers. Reads are local-only.
//!
//! [`flush`]: DualWriteAdapter::flush

use crate::adapters::traits::StorageAdapter;
use crate::config::{SyncConfig, DUAL_WRITE_QUEUE_KEY};
use crate::error::StorageError;
use crate::time;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "op", content = "value")]
enum PendingOp {
    Set(Value),
    Remove,
    Clear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingWrite {
    key: String,
    op: PendingOp,
    enqueued_at: i64,
    retry_count: u32,
    /// Epoch ms; the flusher skips entries scheduled in the future.
    next_attempt_at: i64,
}

/// Counters for the propagation side of the adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Writes dropped after exhausting retries.
    pub permanent_failures: u64,
    /// Epoch ms of the last successful propagation.
    pub last_sync: Option<i64>,
    pub pending: usize,
}

#[derive(Default)]
struct Counters {
    attempts: u64,
    successes: u64,
    failures: u64,
    permanent_failures: u64,
    last_sync: Option<i64>,
}

pub struct DualWriteAdapter {
    local: Arc<dyn StorageAdapter>,
    remote: Arc<dyn StorageAdapter>,
    config: SyncConfig,
    pending: Mutex<VecDeque<PendingWrite>>,
    counters: parking_lot::Mutex<Counters>,
}

impl DualWriteAdapter {
    #[must_use]
    pub fn new(
        local: Arc<dyn StorageAdapter>,
        remote: Arc<dyn StorageAdapter>,
        config: SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            remote,
            config,
            pending: Mutex::new(VecDeque::new()),
            counters: parking_lot::Mutex::new(Counters::default()),
        })
    }

    /// Restore the retry queue persisted by a previous process.
    pub async fn load(&self) -> Result<usize, StorageError> {
        let Some(raw) = self.local.get(DUAL_WRITE_QUEUE_KEY).await? else {
            return Ok(0);
        };
        let entries: VecDeque<PendingWrite> =
            serde_json::from_value(raw).map_err(|e| StorageError::Corruption {
                key: DUAL_WRITE_QUEUE_KEY.to_string(),
                reason: e.to_string(),
            })?;
        let mut pending = self.pending.lock().await;
        let count = entries.len();
        *pending = entries;
        crate::metrics::set_dual_write_queue_depth(count);
        debug!(entries = count, "dual-write retry queue restored");
        Ok(count)
    }

    /// Retry every due entry against the remote. Returns how many propagated.
    ///
    /// The queue lock is never held across a remote call: foreground writes
    /// keep enqueueing while a flush is in flight.
    pub async fn flush(&self) -> Result<usize, StorageError> {
        let now = time::now_ms();
        let due: Vec<PendingWrite> = {
            let mut pending = self.pending.lock().await;
            if pending.is_empty() {
                return Ok(0);
            }
            let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut *pending)
                .into_iter()
                .partition(|e| e.next_attempt_at <= now);
            *pending = later.into();
            due
        };

        let mut applied = 0usize;
        let mut retries: Vec<PendingWrite> = Vec::new();
        for mut entry in due {
            match self.apply_remote(&entry).await {
                Ok(()) => {
                    applied += 1;
                    {
                        let mut counters = self.counters.lock();
                        counters.attempts += 1;
                        counters.successes += 1;
                        counters.last_sync = Some(time::now_ms());
                    }
                }
                Err(e) => {
                    entry.retry_count += 1;
                    let exhausted = entry.retry_count >= self.config.max_retries;
                    {
                        let mut counters = self.counters.lock();
                        counters.attempts += 1;
                        counters.failures += 1;
                        if exhausted {
                            counters.permanent_failures += 1;
                        }
                    }
                    if exhausted {
                        warn!(
                            key = %entry.key,
                            retries = entry.retry_count,
                            error = %e,
                            "dropping dual write after exhausting retries"
                        );
                        crate::metrics::record_queue_dropped("dual_write");
                    } else {
                        entry.next_attempt_at =
                            now + self.backoff_ms(entry.retry_count) as i64;
                        debug!(
                            key = %entry.key,
                            retry = entry.retry_count,
                            error = %e,
                            "dual write failed; rescheduled"
                        );
                        retries.push(entry);
                    }
                }
            }
        }

        let mut pending = self.pending.lock().await;
        for entry in retries {
            // A write enqueued mid-flush supersedes the failed attempt
            if !pending.iter().any(|p| p.key == entry.key) {
                pending.push_back(entry);
            }
        }
        crate::metrics::set_dual_write_queue_depth(pending.len());
        self.persist(&pending).await?;
        Ok(applied)
    }

    /// Periodic flusher on the configured interval. Abort the handle to stop.
    pub fn spawn_flush_task(self: &Arc<Self>) -> JoinHandle<()> {
        let adapter = Arc::clone(self);
        let interval = std::time::Duration::from_millis(adapter.config.flush_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = adapter.flush().await {
                    warn!(error = %e, "dual-write flush failed");
                }
            }
        })
    }

    pub async fn stats(&self) -> SyncStats {
        let pending = self.pending.lock().await.len();
        let counters = self.counters.lock();
        SyncStats {
            attempts: counters.attempts,
            successes: counters.successes,
            failures: counters.failures,
            permanent_failures: counters.permanent_failures,
            last_sync: counters.last_sync,
            pending,
        }
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    fn backoff_ms(&self, retry_count: u32) -> u64 {
        self.config
            .backoff_base_ms
            .saturating_mul(1u64 << retry_count.min(16))
    }

    async fn apply_remote(&self, entry: &PendingWrite) -> Result<(), StorageError> {
        match &entry.op {
            PendingOp::Set(value) => self.remote.set(&entry.key, value).await,
            PendingOp::Remove => self.remote.remove(&entry.key).await,
            PendingOp::Clear => self.remote.clear().await,
        }
    }

    /// Queue a mutation for background propagation. Never calls the remote,
    /// so the caller's write latency is local-only.
    async fn enqueue(&self, key: &str, op: PendingOp) -> Result<(), StorageError> {
        let now = time::now_ms();
        let entry = PendingWrite {
            key: key.to_string(),
            op,
            enqueued_at: now,
            retry_count: 0,
            next_attempt_at: now,
        };
        let mut pending = self.pending.lock().await;
        // One queued write per key: a newer mutation supersedes an older
        // one for the same key.
        pending.retain(|p| p.key != entry.key || p.op == PendingOp::Clear);
        pending.push_back(entry);
        crate::metrics::set_dual_write_queue_depth(pending.len());
        self.persist(&pending).await
    }

    async fn persist(&self, pending: &VecDeque<PendingWrite>) -> Result<(), StorageError> {
        let raw = serde_json::to_value(pending).map_err(|e| StorageError::Serialization {
            key: DUAL_WRITE_QUEUE_KEY.to_string(),
            source: e,
        })?;
        self.local.set(DUAL_WRITE_QUEUE_KEY, &raw).await
    }
}

#[async_trait]
impl StorageAdapter for DualWriteAdapter {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        // Local is authoritative for reads
        self.local.get(key).await
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.local.set(key, value).await?;
        self.enqueue(key, PendingOp::Set(value.clone())).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.local.remove(key).await?;
        self.enqueue(key, PendingOp::Remove).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.local.clear().await?;
        // A clear supersedes every queued per-key write
        self.pending.lock().await.clear();
        self.enqueue("*", PendingOp::Clear).await
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.local.keys().await
    }
}
