// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The storage capability contract every backend implements.

use crate::error::StorageError;
use async_trait::async_trait;
use serde_json::Value;

/// Validator applied to values read back from storage. Returning `false`
/// turns the read into a [`StorageError::Validation`] instead of handing
/// malformed data to the caller.
pub type Validator = dyn Fn(&Value) -> bool + Send + Sync;

/// One concrete storage backend.
///
/// Implementations must be safe to call concurrently for different keys, and
/// must preserve per-key write ordering from a single caller. Absence is a
/// value, not an error: `get` of a missing key returns `Ok(None)`.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError>;
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Remove every entry this adapter owns. Never touches foreign data
    /// sharing the same underlying device.
    async fn clear(&self) -> Result<(), StorageError>;

    async fn keys(&self) -> Result<Vec<String>, StorageError>;

    async fn has_key(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }

    /// `get` with a validator. A present-but-rejected value is an error,
    /// never silently coerced to `None`.
    async fn get_validated(
        &self,
        key: &str,
        validator: &Validator,
    ) -> Result<Option<Value>, StorageError> {
        match self.get(key).await? {
            None => Ok(None),
            Some(value) => {
                if validator(&value) {
                    Ok(Some(value))
                } else {
                    Err(StorageError::Validation {
                        key: key.to_string(),
                        reason: "stored value rejected by validator".to_string(),
                    })
                }
            }
        }
    }
}
