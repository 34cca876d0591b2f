// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-way replication between a local store and a remote store.
//!
//! The local adapter is always written first and always serves reads, so
//! the application keeps working with no connectivity. While online,
//! mutations are pushed to the remote immediately; while offline (or when a
//! push fails) they divert to the durable [`OfflineQueue`]. A periodic
//! `sync` cycle pulls each entity's remote collection, merges every record
//! against the local copy through the [`ConflictResolver`], then drains the
//! queue. Cycles never overlap: a cycle that finds another one running (or
//! finds the host offline) is skipped, not queued.

use crate::adapters::traits::StorageAdapter;
use crate::config::EngineConfig;
use crate::conflict::ConflictResolver;
use crate::error::StorageError;
use crate::queue::{OfflineQueue, QueueEntry};
use crate::sync::network::NetworkStatusObserver;
use crate::time;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One captured sync failure, kept in a bounded ring.
#[derive(Debug, Clone)]
pub struct SyncErrorEntry {
    /// Epoch ms.
    pub at: i64,
    /// What the engine was doing (`pull:task`, `push`, `remote_set`).
    pub context: String,
    pub message: String,
}

/// Point-in-time view of the replication state.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    /// Epoch ms of the last completed cycle.
    pub last_sync: Option<i64>,
    /// Mutations waiting in the offline queue.
    pub pending_push: usize,
    pub recent_errors: Vec<SyncErrorEntry>,
}

pub struct BidirectionalSyncAdapter {
    local: Arc<dyn StorageAdapter>,
    remote: Arc<dyn StorageAdapter>,
    network: Arc<dyn NetworkStatusObserver>,
    resolver: ConflictResolver,
    queue: OfflineQueue,
    /// Entities pulled each cycle.
    entities: Vec<String>,
    pull_interval_ms: u64,
    sync_lock: Mutex<()>,
    is_syncing: AtomicBool,
    last_sync: parking_lot::Mutex<Option<i64>>,
    errors: parking_lot::Mutex<VecDeque<SyncErrorEntry>>,
    error_capacity: usize,
    shutdown: watch::Sender<bool>,
}

impl BidirectionalSyncAdapter {
    #[must_use]
    pub fn new(
        local: Arc<dyn StorageAdapter>,
        remote: Arc<dyn StorageAdapter>,
        network: Arc<dyn NetworkStatusObserver>,
        entities: Vec<String>,
        config: &EngineConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            local: local.clone(),
            remote,
            network,
            resolver: ConflictResolver::new(config.conflict.clone()),
            queue: OfflineQueue::new(local, config.queue.clone()),
            entities,
            pull_interval_ms: config.sync.pull_interval_ms,
            sync_lock: Mutex::new(()),
            is_syncing: AtomicBool::new(false),
            last_sync: parking_lot::Mutex::new(None),
            errors: parking_lot::Mutex::new(VecDeque::new()),
            error_capacity: config.conflict.error_ring_capacity,
            shutdown,
        })
    }

    /// Restore queued mutations persisted by a previous process.
    pub async fn load(&self) -> Result<(), StorageError> {
        self.queue.load().await
    }

    /// Run one pull-then-push cycle. Returns `false` when the cycle was
    /// skipped (offline, or another cycle holds the lock).
    pub async fn sync(&self) -> Result<bool, StorageError> {
        if !self.network.is_online() {
            debug!("sync skipped: offline");
            crate::metrics::record_sync_cycle("skipped");
            return Ok(false);
        }
        let Ok(_guard) = self.sync_lock.try_lock() else {
            debug!("sync skipped: cycle already running");
            crate::metrics::record_sync_cycle("skipped");
            return Ok(false);
        };
        self.is_syncing.store(true, Ordering::SeqCst);
        let started = std::time::Instant::now();

        let result = self.run_cycle().await;

        self.is_syncing.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                *self.last_sync.lock() = Some(time::now_ms());
                crate::metrics::record_sync_cycle("success");
                crate::metrics::record_sync_latency(started.elapsed());
                Ok(true)
            }
            Err(e) => {
                self.record_error("cycle", &e);
                crate::metrics::record_sync_cycle("error");
                Err(e)
            }
        }
    }

    async fn run_cycle(&self) -> Result<(), StorageError> {
        for entity in &self.entities {
            if let Err(e) = self.pull_entity(entity).await {
                // One unreachable entity shouldn't starve the others
                warn!(entity = %entity, error = %e, "pull failed");
                self.record_error(&format!("pull:{entity}"), &e);
                if !e.is_transient() {
                    return Err(e);
                }
            }
        }
        self.push().await?;
        Ok(())
    }

    /// Merge the remote collection for one entity into the local store.
    async fn pull_entity(&self, entity: &str) -> Result<(), StorageError> {
        let Some(Value::Array(rows)) = self.remote.get(entity).await? else {
            return Ok(());
        };
        let mut merged = 0usize;
        for row in rows {
            let Some(id) = row.get("id").and_then(Value::as_str) else {
                continue;
            };
            let key = format!("{entity}:{id}");
            let local = self.local.get(&key).await?;
            let resolution = self.resolver.resolve(local.as_ref(), Some(&row));
            if let Some(resolved) = resolution.resolved {
                if local.as_ref() != Some(&resolved) {
                    self.local.set(&key, &resolved).await?;
                    merged += 1;
                }
            }
        }
        debug!(entity, merged, "pull complete");
        Ok(())
    }

    /// Drain the offline queue against the remote. Each entry pushes the
    /// latest local value, not the value captured at enqueue time.
    async fn push(&self) -> Result<usize, StorageError> {
        let local = self.local.clone();
        let remote = self.remote.clone();
        let applied = self
            .queue
            .process_all(
                move |entry: QueueEntry| {
                    let local = local.clone();
                    let remote = remote.clone();
                    async move {
                        match entry.operation {
                            crate::queue::Operation::Set => {
                                let value = match local.get(&entry.key).await? {
                                    Some(latest) => latest,
                                    None => match entry.value {
                                        Some(v) => v,
                                        None => return Ok(()),
                                    },
                                };
                                remote.set(&entry.key, &value).await
                            }
                            crate::queue::Operation::Remove => remote.remove(&entry.key).await,
                        }
                    }
                },
                &self.shutdown.subscribe(),
            )
            .await?;
        if applied > 0 {
            info!(applied, "offline queue drained");
        }
        Ok(applied)
    }

    /// Call when connectivity returns: drain the backlog, then run a full
    /// cycle so remote changes made while away land locally.
    pub async fn handle_online(&self) -> Result<(), StorageError> {
        info!("connectivity restored; draining offline backlog");
        self.push().await?;
        self.sync().await?;
        Ok(())
    }

    /// Background loop: a cycle per interval, plus an immediate
    /// `handle_online` on every offline-to-online transition. Stops when
    /// [`stop`](Self::stop) is called.
    pub fn spawn_sync_task(self: &Arc<Self>) -> JoinHandle<()> {
        let adapter = Arc::clone(self);
        let mut network_rx = adapter.network.subscribe();
        let mut shutdown_rx = adapter.shutdown.subscribe();
        let interval = std::time::Duration::from_millis(adapter.pull_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = adapter.sync().await {
                            warn!(error = %e, "scheduled sync failed");
                        }
                    }
                    changed = network_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *network_rx.borrow_and_update();
                        if online {
                            if let Err(e) = adapter.handle_online().await {
                                warn!(error = %e, "online transition sync failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Signal the background task (and any in-flight queue drain) to stop.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn status(&self) -> SyncStatus {
        // Await before taking any lock; guard temporaries in the struct
        // literal would otherwise live across the await point
        let pending_push = self.queue.len().await;
        SyncStatus {
            is_online: self.network.is_online(),
            is_syncing: self.is_syncing.load(Ordering::SeqCst),
            last_sync: *self.last_sync.lock(),
            pending_push,
            recent_errors: self.errors.lock().iter().cloned().collect(),
        }
    }

    #[must_use]
    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    fn record_error(&self, context: &str, error: &StorageError) {
        let mut errors = self.errors.lock();
        if errors.len() >= self.error_capacity {
            errors.pop_front();
        }
        errors.push_back(SyncErrorEntry {
            at: time::now_ms(),
            context: context.to_string(),
            message: error.to_string(),
        });
    }
}

#[async_trait]
impl StorageAdapter for BidirectionalSyncAdapter {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.local.get(key).await
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.local.set(key, value).await?;
        if self.network.is_online() {
            match self.remote.set(key, value).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    // Local write stands; the push is deferred
                    debug!(key, error = %e, "remote set failed; queued");
                    self.record_error("remote_set", &e);
                }
            }
        }
        self.queue
            .enqueue(QueueEntry::set(key, value.clone()))
            .await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.local.remove(key).await?;
        if self.network.is_online() {
            match self.remote.remove(key).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(key, error = %e, "remote remove failed; queued");
                    self.record_error("remote_remove", &e);
                }
            }
        }
        self.queue.enqueue(QueueEntry::remove(key)).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.local.clear().await?;
        if self.network.is_online() {
            if let Err(e) = self.remote.clear().await {
                warn!(error = %e, "remote clear failed");
                self.record_error("remote_clear", &e);
            }
        } else {
            warn!("clear applied locally only; remote untouched while offline");
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.local.keys().await
    }
}
