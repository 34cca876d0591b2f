// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Full-store snapshots: create, restore, JSON export/import, and diffing.
//!
//! A snapshot captures every key except the schema version record, which is
//! carried separately so a restore can reinstate data and schema version as
//! one unit. `data` is a `BTreeMap` so exports are byte-stable for the same
//! content.

use crate::adapters::traits::StorageAdapter;
use crate::config::SCHEMA_VERSION_KEY;
use crate::error::StorageError;
use crate::migrations::{read_schema_version, write_schema_version, SchemaVersionRecord};
use crate::time;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

const BACKUP_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub format_version: u32,
    /// Epoch milliseconds.
    pub taken_at: i64,
    pub schema_version: SchemaVersionRecord,
    pub data: BTreeMap<String, Value>,
}

impl BackupSnapshot {
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Key-level difference between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub unchanged: usize,
}

impl BackupDiff {
    #[must_use]
    pub fn is_identical(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

pub struct BackupManager {
    adapter: Arc<dyn StorageAdapter>,
}

impl BackupManager {
    #[must_use]
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self { adapter }
    }

    /// Snapshot every key in the store.
    pub async fn create(&self) -> Result<BackupSnapshot, StorageError> {
        let mut data = BTreeMap::new();
        for key in self.adapter.keys().await? {
            if key == SCHEMA_VERSION_KEY {
                continue;
            }
            if let Some(value) = self.adapter.get(&key).await? {
                data.insert(key, value);
            }
        }
        let schema_version = read_schema_version(self.adapter.as_ref()).await?;
        info!(entries = data.len(), "backup snapshot created");
        Ok(BackupSnapshot {
            format_version: BACKUP_FORMAT_VERSION,
            taken_at: time::now_ms(),
            schema_version,
            data,
        })
    }

    /// Write a snapshot back into the store. With `clear_first`, keys not in
    /// the snapshot are removed so the store ends exactly equal to it;
    /// otherwise snapshot keys are overlaid on the existing contents.
    pub async fn restore(
        &self,
        snapshot: &BackupSnapshot,
        clear_first: bool,
    ) -> Result<(), StorageError> {
        if snapshot.format_version > BACKUP_FORMAT_VERSION {
            return Err(StorageError::Backend(format!(
                "unsupported backup format version {}",
                snapshot.format_version
            )));
        }
        if clear_first {
            self.adapter.clear().await?;
        }
        for (key, value) in &snapshot.data {
            self.adapter.set(key, value).await?;
        }
        write_schema_version(self.adapter.as_ref(), &snapshot.schema_version).await?;
        info!(entries = snapshot.data.len(), clear_first, "backup restored");
        Ok(())
    }

    /// Serialize a snapshot for storage outside the engine.
    pub fn export(&self, snapshot: &BackupSnapshot) -> Result<String, StorageError> {
        serde_json::to_string_pretty(snapshot).map_err(|e| StorageError::Serialization {
            key: "backup".to_string(),
            source: e,
        })
    }

    /// Parse a previously exported snapshot.
    pub fn import(&self, raw: &str) -> Result<BackupSnapshot, StorageError> {
        serde_json::from_str(raw).map_err(|e| StorageError::Corruption {
            key: "backup".to_string(),
            reason: e.to_string(),
        })
    }

    /// Compare two snapshots key by key. `added`/`removed` are relative to
    /// `before`: a key present only in `after` is added.
    #[must_use]
    pub fn compare(&self, before: &BackupSnapshot, after: &BackupSnapshot) -> BackupDiff {
        let mut diff = BackupDiff::default();
        for (key, old_value) in &before.data {
            match after.data.get(key) {
                None => diff.removed.push(key.clone()),
                Some(new_value) if new_value != old_value => diff.modified.push(key.clone()),
                Some(_) => diff.unchanged += 1,
            }
        }
        for key in after.data.keys() {
            if !before.data.contains_key(key) {
                diff.added.push(key.clone());
            }
        }
        debug!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            modified = diff.modified.len(),
            "snapshots compared"
        );
        diff
    }
}
