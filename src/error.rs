// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the storage engine.
//!
//! Every error carries an operation [`ErrorKind`] and a [`Severity`].
//! Severity drives how callers react: `Low`/`Medium` errors are logged and
//! retried in the background, `High` errors surface to the caller, `Critical`
//! errors indicate data-loss risk and must produce an actionable message
//! (see [`StorageError::user_message`]).

use thiserror::Error;

/// Which storage operation an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Get,
    Set,
    Remove,
    Clear,
    Adapter,
}

/// Error severity, ordered `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Error, Debug)]
pub enum StorageError {
    /// A `get` validator rejected the stored value. Never coerced to `None`.
    #[error("validation failed for '{key}': {reason}")]
    Validation { key: String, reason: String },

    /// Stored bytes could not be decoded back into a value.
    #[error("corrupt data under '{key}': {reason}")]
    Corruption { key: String, reason: String },

    /// JSON (de)serialization failure.
    #[error("serialization failed for '{key}': {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The local device quota is exhausted. Foreground writes fail with this.
    #[error("local storage full: {used} of {quota} bytes used")]
    CapacityExceeded { used: u64, quota: u64 },

    /// Key does not conform to the `entity[:id[:subkey]]` grammar.
    #[error("invalid storage key '{0}'")]
    InvalidKey(String),

    /// Remote rejected the payload (bad enum value, unknown entity, ...).
    /// Never retried.
    #[error("remote rejected '{key}': {reason}")]
    RemoteRejected { key: String, reason: String },

    /// Transient remote failure (network, timeout). Safe to retry.
    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),

    /// Non-transient backend failure.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// No schema registered for an entity at the remote boundary.
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    /// A migration step failed.
    #[error("migration '{name}' (v{version}) failed: {reason}")]
    MigrationFailed {
        version: u32,
        name: String,
        reason: String,
    },

    /// Another migration or rollback is already running.
    #[error("migration already in progress")]
    MigrationInProgress,

    /// Rollback path contains a migration without a `down` transform.
    #[error("cannot roll back: migration '{name}' (v{version}) has no down")]
    MissingDownMigration { version: u32, name: String },

    /// `migrate` asked to move backward; use `rollback` instead.
    #[error("schema version {current} is newer than target {target}; use rollback")]
    BackwardMigration { current: u32, target: u32 },

    /// Migration failed AND the automatic restore failed. Data state unknown.
    #[error("migration failed ({migration}) and restore also failed ({restore}); data state unknown")]
    RestoreFailed { migration: String, restore: String },

    /// A transaction closure failed; all writes were rolled back.
    #[error("transaction failed and was rolled back: {0}")]
    TransactionRolledBack(String),

    /// Only one transaction may be open at a time.
    #[error("transaction already in progress")]
    TransactionInProgress,
}

impl StorageError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::Corruption { .. } => ErrorKind::Get,
            Self::CapacityExceeded { .. } | Self::RemoteRejected { .. } => ErrorKind::Set,
            Self::Serialization { .. } | Self::InvalidKey(_) | Self::UnknownEntity(_) => {
                ErrorKind::Adapter
            }
            Self::RemoteUnreachable(_) | Self::Backend(_) => ErrorKind::Adapter,
            Self::MigrationFailed { .. }
            | Self::MigrationInProgress
            | Self::MissingDownMigration { .. }
            | Self::BackwardMigration { .. }
            | Self::RestoreFailed { .. }
            | Self::TransactionRolledBack(_)
            | Self::TransactionInProgress => ErrorKind::Adapter,
        }
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::CapacityExceeded { .. }
            | Self::RemoteUnreachable(_)
            | Self::MigrationFailed { .. }
            | Self::RestoreFailed { .. } => Severity::Critical,
            Self::Validation { .. }
            | Self::Corruption { .. }
            | Self::Serialization { .. }
            | Self::TransactionRolledBack(_)
            | Self::MissingDownMigration { .. }
            | Self::BackwardMigration { .. } => Severity::High,
            Self::RemoteRejected { .. }
            | Self::Backend(_)
            | Self::UnknownEntity(_)
            | Self::MigrationInProgress
            | Self::TransactionInProgress => Severity::Medium,
            Self::InvalidKey(_) => Severity::Low,
        }
    }

    /// Whether retrying the failed operation can reasonably succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RemoteUnreachable(_))
    }

    /// Actionable message for data-loss-risk situations; `None` for errors
    /// the engine absorbs internally.
    #[must_use]
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::CapacityExceeded { .. } => Some(
                "Local storage is full. Free up space or export a backup before continuing."
                    .to_string(),
            ),
            Self::RestoreFailed { .. } => Some(
                "A schema migration failed and automatic recovery did not complete. \
                 Restore from your most recent backup."
                    .to_string(),
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_capacity_is_critical_set_error() {
        let err = StorageError::CapacityExceeded {
            used: 5 * 1024 * 1024,
            quota: 5 * 1024 * 1024,
        };
        assert_eq!(err.kind(), ErrorKind::Set);
        assert_eq!(err.severity(), Severity::Critical);
        assert!(err.user_message().is_some());
    }

    #[test]
    fn test_validation_is_high_get_error() {
        let err = StorageError::Validation {
            key: "project:p1".into(),
            reason: "missing id".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Get);
        assert_eq!(err.severity(), Severity::High);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_only_unreachable_is_transient() {
        assert!(StorageError::RemoteUnreachable("timeout".into()).is_transient());
        assert!(!StorageError::RemoteRejected {
            key: "projects".into(),
            reason: "bad enum".into()
        }
        .is_transient());
        assert!(!StorageError::Backend("boom".into()).is_transient());
    }

    #[test]
    fn test_restore_failed_keeps_both_causes() {
        let err = StorageError::RestoreFailed {
            migration: "v3 failed".into(),
            restore: "device full".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("v3 failed"));
        assert!(msg.contains("device full"));
        assert_eq!(err.severity(), Severity::Critical);
    }
}
