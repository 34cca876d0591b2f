// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Syncstore
//!
//! A local-first storage and replication engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      StorageManager                         │
//! │  • Cache-first reads (LRU + TTL)                           │
//! │  • Change subscriptions ('*' wildcard)                     │
//! │  • Batches and single-flight transactions                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Replication adapters                     │
//! │  • DualWriteAdapter: local-first, async remote retry       │
//! │  • BidirectionalSyncAdapter: pull/merge/push cycles,       │
//! │    offline queue, conflict resolution (LWW + field merge)  │
//! └─────────────────────────────────────────────────────────────┘
//!                  │                          │
//!                  ▼                          ▼
//! ┌───────────────────────────┐  ┌───────────────────────────────┐
//! │       LocalAdapter        │  │        RemoteAdapter          │
//! │  • Quota-bounded device   │  │  • Table-driven schema        │
//! │  • Transparent zstd       │  │    normalization              │
//! │  • Key namespacing        │  │  • Transient-failure retry    │
//! └───────────────────────────┘  └───────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use syncstore::{EngineConfig, LocalAdapter, StorageManager};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), syncstore::StorageError> {
//!     let config = EngineConfig::default();
//!     let adapter = Arc::new(LocalAdapter::in_memory(&config));
//!     let manager = StorageManager::new(adapter, &config);
//!
//!     manager
//!         .set("project:p1", &json!({"id": "p1", "name": "Alpha"}))
//!         .await?;
//!
//!     // Missing keys are `None`, never an error
//!     assert!(manager.get("project:none").await?.is_none());
//!     assert!(manager.get("project:p1").await?.is_some());
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Local-first**: every read and write lands locally; remote sync is
//!   asynchronous and never blocks the caller
//! - **Offline queue**: durable, deduplicated per record, oldest-evicted at
//!   capacity
//! - **Conflict resolution**: last-write-wins with deterministic tiebreaks
//!   and automatic field-level merge
//! - **Schema migrations**: versioned, resumable, with backup-and-restore
//!   safety via [`SafeMigrationManager`]
//! - **Integrity checks**: count-first local/remote drift detection
//! - **Compression**: transparent zstd for large values with an adaptive
//!   size threshold

pub mod adapters;
pub mod backup;
pub mod cache;
pub mod compression;
pub mod config;
pub mod conflict;
pub mod error;
pub mod index;
pub mod integrity;
pub mod key;
pub mod manager;
pub mod metrics;
pub mod migrations;
pub mod queue;
pub mod resilience;
pub mod sync;
pub mod time;

pub use adapters::local::{LocalAdapter, LocalDevice, MemoryDevice, StorageUsage};
pub use adapters::remote::{
    EntitySchema, InMemoryTableClient, RemoteAdapter, RemoteError, SchemaRegistry, TableClient,
    WriteStrategy,
};
pub use adapters::traits::StorageAdapter;
pub use backup::{BackupDiff, BackupManager, BackupSnapshot};
pub use cache::{CacheLayer, CacheStats};
pub use compression::{CompressionManager, CompressionStats, Compressor, NoopCompressor};
#[cfg(feature = "compression")]
pub use compression::ZstdCompressor;
pub use config::EngineConfig;
pub use conflict::{
    ConflictRecord, ConflictResolver, ConflictStats, ConflictType, Resolution, ResolutionStrategy,
    Winner,
};
pub use error::{ErrorKind, Severity, StorageError};
pub use index::{IndexManager, IndexStats};
pub use integrity::{IntegrityReport, IntegrityValidator};
pub use key::StorageKey;
pub use manager::{BatchResult, ChangeEvent, ChangeOperation, StorageManager, SubscriptionId};
pub use metrics::LatencyTimer;
pub use migrations::{Migration, MigrationManager, SafeMigrationManager, SchemaVersionRecord};
pub use queue::{OfflineQueue, Operation, QueueEntry};
pub use resilience::retry::RetryConfig;
pub use sync::{
    BidirectionalSyncAdapter, DualWriteAdapter, ManualNetworkStatus, NetworkStatusObserver,
    SyncStats, SyncStatus,
};
