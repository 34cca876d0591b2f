// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Versioned schema migrations over any [`StorageAdapter`].
//!
//! A migration is an `up` (and optional `down`) transform registered with a
//! version and a name. `migrate` applies pending migrations strictly in
//! ascending version order and persists the schema version record after each
//! successful step, so a crash mid-run resumes where it stopped instead of
//! re-running completed steps. Moving backward goes through `rollback`,
//! which refuses the whole path upfront if any step lacks a `down`.
//!
//! [`SafeMigrationManager`] wraps the above with backup-before-migrate and
//! automatic restore on failure. A failed restore raises
//! [`StorageError::RestoreFailed`] carrying both causes — that error must
//! reach the caller, the data is in an unknown state.

use crate::adapters::traits::StorageAdapter;
use crate::backup::BackupManager;
use crate::config::SCHEMA_VERSION_KEY;
use crate::error::StorageError;
use crate::time;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// The single source of truth for "what shape is the data in".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaVersionRecord {
    pub version: u32,
    pub applied_at: String,
    pub applied_migrations: Vec<String>,
}

impl Default for SchemaVersionRecord {
    fn default() -> Self {
        Self {
            version: 0,
            applied_at: time::to_iso(0),
            applied_migrations: Vec::new(),
        }
    }
}

/// One registered migration.
#[async_trait]
pub trait Migration: Send + Sync {
    fn version(&self) -> u32;
    fn name(&self) -> &str;

    fn description(&self) -> Option<&str> {
        None
    }

    async fn up(&self, adapter: &dyn StorageAdapter) -> Result<(), StorageError>;

    /// Reverse transform. Migrations without one cannot be rolled back.
    async fn down(&self, _adapter: &dyn StorageAdapter) -> Result<(), StorageError> {
        Err(StorageError::MissingDownMigration {
            version: self.version(),
            name: self.name().to_string(),
        })
    }

    fn has_down(&self) -> bool {
        false
    }
}

/// Read the current schema version record from an adapter.
pub async fn read_schema_version(
    adapter: &dyn StorageAdapter,
) -> Result<SchemaVersionRecord, StorageError> {
    match adapter.get(SCHEMA_VERSION_KEY).await? {
        None => Ok(SchemaVersionRecord::default()),
        Some(value) => serde_json::from_value(value).map_err(|e| StorageError::Corruption {
            key: SCHEMA_VERSION_KEY.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Persist a schema version record.
pub async fn write_schema_version(
    adapter: &dyn StorageAdapter,
    record: &SchemaVersionRecord,
) -> Result<(), StorageError> {
    let value = serde_json::to_value(record).map_err(|e| StorageError::Serialization {
        key: SCHEMA_VERSION_KEY.to_string(),
        source: e,
    })?;
    adapter.set(SCHEMA_VERSION_KEY, &value).await
}

pub struct MigrationManager {
    adapter: Arc<dyn StorageAdapter>,
    migrations: Vec<Arc<dyn Migration>>,
    // try_lock gate: concurrent migrate/rollback is an error, not a queue
    running: Mutex<()>,
}

impl MigrationManager {
    #[must_use]
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            adapter,
            migrations: Vec::new(),
            running: Mutex::new(()),
        }
    }

    /// Register a migration. Versions must be unique; registration order
    /// doesn't matter, execution is always by ascending version.
    pub fn register(&mut self, migration: Arc<dyn Migration>) -> Result<(), StorageError> {
        if self
            .migrations
            .iter()
            .any(|m| m.version() == migration.version())
        {
            return Err(StorageError::Backend(format!(
                "duplicate migration version {}",
                migration.version()
            )));
        }
        self.migrations.push(migration);
        self.migrations.sort_by_key(|m| m.version());
        Ok(())
    }

    pub async fn current_version(&self) -> Result<u32, StorageError> {
        Ok(read_schema_version(self.adapter.as_ref()).await?.version)
    }

    /// Highest registered version, or 0 with no registrations.
    #[must_use]
    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map(|m| m.version()).unwrap_or(0)
    }

    /// Apply all pending migrations up to `target` (default: highest
    /// registered). The version record is persisted after every step.
    pub async fn migrate(&self, target: Option<u32>) -> Result<u32, StorageError> {
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| StorageError::MigrationInProgress)?;

        let mut record = read_schema_version(self.adapter.as_ref()).await?;
        let target = target.unwrap_or_else(|| self.latest_version());
        if target < record.version {
            return Err(StorageError::BackwardMigration {
                current: record.version,
                target,
            });
        }

        for migration in &self.migrations {
            let version = migration.version();
            if version <= record.version || version > target {
                continue;
            }
            info!(version, name = migration.name(), "applying migration");
            migration
                .up(self.adapter.as_ref())
                .await
                .map_err(|e| {
                    crate::metrics::record_migration_step("up", "failure");
                    StorageError::MigrationFailed {
                        version,
                        name: migration.name().to_string(),
                        reason: e.to_string(),
                    }
                })?;

            record.version = version;
            record.applied_at = time::to_iso(time::now_ms());
            record.applied_migrations.push(migration.name().to_string());
            write_schema_version(self.adapter.as_ref(), &record).await?;
            crate::metrics::record_migration_step("up", "success");
        }
        Ok(record.version)
    }

    /// Roll back to `target` by applying `down` transforms in descending
    /// order. Fails before touching anything if a step in the path has no
    /// `down`.
    pub async fn rollback(&self, target: u32) -> Result<u32, StorageError> {
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| StorageError::MigrationInProgress)?;

        let mut record = read_schema_version(self.adapter.as_ref()).await?;
        if target >= record.version {
            return Ok(record.version);
        }

        let mut path: Vec<&Arc<dyn Migration>> = self
            .migrations
            .iter()
            .filter(|m| m.version() > target && m.version() <= record.version)
            .collect();
        path.sort_by_key(|m| std::cmp::Reverse(m.version()));

        if let Some(blocked) = path.iter().find(|m| !m.has_down()) {
            return Err(StorageError::MissingDownMigration {
                version: blocked.version(),
                name: blocked.name().to_string(),
            });
        }

        for migration in path {
            let version = migration.version();
            info!(version, name = migration.name(), "rolling back migration");
            migration
                .down(self.adapter.as_ref())
                .await
                .map_err(|e| {
                    crate::metrics::record_migration_step("down", "failure");
                    StorageError::MigrationFailed {
                        version,
                        name: migration.name().to_string(),
                        reason: e.to_string(),
                    }
                })?;

            // Land on the next registered version below this one, floored
            // at the rollback target.
            record.version = self
                .migrations
                .iter()
                .map(|m| m.version())
                .filter(|v| *v < version)
                .max()
                .unwrap_or(0)
                .max(target);
            record.applied_at = time::to_iso(time::now_ms());
            record.applied_migrations.pop();
            write_schema_version(self.adapter.as_ref(), &record).await?;
            crate::metrics::record_migration_step("down", "success");
        }
        Ok(record.version)
    }
}

/// Backup-before-migrate wrapper.
pub struct SafeMigrationManager {
    inner: MigrationManager,
    backup: BackupManager,
}

impl SafeMigrationManager {
    #[must_use]
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            inner: MigrationManager::new(adapter.clone()),
            backup: BackupManager::new(adapter),
        }
    }

    pub fn register(&mut self, migration: Arc<dyn Migration>) -> Result<(), StorageError> {
        self.inner.register(migration)
    }

    pub async fn current_version(&self) -> Result<u32, StorageError> {
        self.inner.current_version().await
    }

    /// Snapshot, migrate, and on failure restore the snapshot.
    ///
    /// When the restore itself fails the returned error is
    /// [`StorageError::RestoreFailed`]; nothing absorbs it.
    pub async fn migrate_with_backup(&self, target: Option<u32>) -> Result<u32, StorageError> {
        let snapshot = self.backup.create().await?;

        match self.inner.migrate(target).await {
            Ok(version) => Ok(version),
            Err(migration_err) => {
                warn!(error = %migration_err, "migration failed; restoring backup");
                match self.backup.restore(&snapshot, true).await {
                    Ok(()) => {
                        crate::metrics::record_migration_restore(true);
                        info!("backup restored after failed migration");
                        Err(migration_err)
                    }
                    Err(restore_err) => {
                        crate::metrics::record_migration_restore(false);
                        error!(
                            migration = %migration_err,
                            restore = %restore_err,
                            "restore after failed migration also failed"
                        );
                        Err(StorageError::RestoreFailed {
                            migration: migration_err.to_string(),
                            restore: restore_err.to_string(),
                        })
                    }
                }
            }
        }
    }
}
