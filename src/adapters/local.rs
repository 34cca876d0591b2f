// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local adapter over a synchronous, quota-bounded key/value device.
//!
//! Responsibilities: key namespacing via the configured prefix, JSON
//! (de)serialization, transparent compression of large values (delegated to
//! [`CompressionManager`], sentinel-detected on read), and mapping a full
//! device to [`StorageError::CapacityExceeded`]. `clear()` only touches keys
//! under this adapter's prefix — the device may be shared.

use crate::adapters::traits::StorageAdapter;
use crate::compression::CompressionManager;
use crate::config::{CompressionConfig, EngineConfig};
use crate::error::StorageError;
use crate::key;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

/// A synchronous key/value byte store with a hard capacity ceiling,
/// the shape of the devices this engine targets (browser storage,
/// embedded NV storage, a single preallocated file).
pub trait LocalDevice: Send + Sync {
    fn read(&self, key: &str) -> Option<Vec<u8>>;

    /// Write, enforcing the quota. Full device returns `Err` with the byte
    /// count that would have been used.
    fn write(&self, key: &str, bytes: Vec<u8>) -> Result<(), u64>;

    fn delete(&self, key: &str);
    fn keys(&self) -> Vec<String>;

    /// Bytes currently stored (keys + values).
    fn used_bytes(&self) -> u64;

    /// Capacity ceiling in bytes.
    fn quota_bytes(&self) -> u64;
}

/// In-memory [`LocalDevice`] with quota accounting.
pub struct MemoryDevice {
    data: DashMap<String, Vec<u8>>,
    // Accounting is serialized; the quota check and the insert must agree.
    used: Mutex<u64>,
    quota: u64,
}

impl MemoryDevice {
    #[must_use]
    pub fn new(quota: u64) -> Self {
        Self {
            data: DashMap::new(),
            used: Mutex::new(0),
            quota,
        }
    }
}

impl LocalDevice for MemoryDevice {
    fn read(&self, key: &str) -> Option<Vec<u8>> {
        self.data.get(key).map(|e| e.value().clone())
    }

    fn write(&self, key: &str, bytes: Vec<u8>) -> Result<(), u64> {
        let mut used = self.used.lock();
        let entry_size = (key.len() + bytes.len()) as u64;
        let previous = self
            .data
            .get(key)
            .map(|e| (key.len() + e.value().len()) as u64)
            .unwrap_or(0);
        let projected = *used - previous + entry_size;
        if projected > self.quota {
            return Err(projected);
        }
        self.data.insert(key.to_string(), bytes);
        *used = projected;
        Ok(())
    }

    fn delete(&self, key: &str) {
        let mut used = self.used.lock();
        if let Some((k, v)) = self.data.remove(key) {
            *used -= (k.len() + v.len()) as u64;
        }
    }

    fn keys(&self) -> Vec<String> {
        self.data.iter().map(|e| e.key().clone()).collect()
    }

    fn used_bytes(&self) -> u64 {
        *self.used.lock()
    }

    fn quota_bytes(&self) -> u64 {
        self.quota
    }
}

/// Usage report for the "storage full" early warning.
#[derive(Debug, Clone, Copy)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub percent: f64,
}

pub struct LocalAdapter<D: LocalDevice> {
    device: D,
    prefix: String,
    compression: CompressionManager,
}

impl LocalAdapter<MemoryDevice> {
    /// Adapter over a fresh in-memory device sized from config.
    #[must_use]
    pub fn in_memory(config: &EngineConfig) -> Self {
        Self::new(
            MemoryDevice::new(config.quota_bytes),
            config.prefix.clone(),
            config.compression.clone(),
        )
    }
}

impl<D: LocalDevice> LocalAdapter<D> {
    #[must_use]
    pub fn new(device: D, prefix: String, compression: CompressionConfig) -> Self {
        Self {
            device,
            prefix,
            compression: CompressionManager::new(compression),
        }
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    #[must_use]
    pub fn usage(&self) -> StorageUsage {
        let used = self.device.used_bytes();
        let quota = self.device.quota_bytes();
        crate::metrics::set_local_used_bytes(used);
        StorageUsage {
            used_bytes: used,
            quota_bytes: quota,
            percent: if quota > 0 {
                used as f64 / quota as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    #[must_use]
    pub fn compression_stats(&self) -> crate::compression::CompressionStats {
        self.compression.stats()
    }
}

#[async_trait]
impl<D: LocalDevice> StorageAdapter for LocalAdapter<D> {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let _timer = crate::time_operation!("local", "get");
        let raw = key::sanitize(key)?;
        let Some(stored) = self.device.read(&self.prefixed(&raw)) else {
            return Ok(None);
        };
        let plain = self
            .compression
            .decode(&stored)
            .map_err(|e| StorageError::Corruption {
                key: raw.clone(),
                reason: e.to_string(),
            })?;
        let value = serde_json::from_slice(&plain).map_err(|e| StorageError::Corruption {
            key: raw,
            reason: e.to_string(),
        })?;
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let _timer = crate::time_operation!("local", "set");
        let raw = key::sanitize(key)?;
        let plain = serde_json::to_vec(value).map_err(|e| StorageError::Serialization {
            key: raw.clone(),
            source: e,
        })?;
        let encoded = self
            .compression
            .encode(&plain)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        self.device
            .write(&self.prefixed(&raw), encoded)
            .map_err(|projected| {
                crate::metrics::record_capacity_exceeded();
                StorageError::CapacityExceeded {
                    used: projected,
                    quota: self.device.quota_bytes(),
                }
            })?;
        crate::metrics::set_local_used_bytes(self.device.used_bytes());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let raw = key::sanitize(key)?;
        self.device.delete(&self.prefixed(&raw));
        crate::metrics::set_local_used_bytes(self.device.used_bytes());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        for device_key in self.device.keys() {
            if device_key.starts_with(&self.prefix) {
                self.device.delete(&device_key);
            }
        }
        crate::metrics::set_local_used_bytes(self.device.used_bytes());
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .device
            .keys()
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }

    async fn has_key(&self, key: &str) -> Result<bool, StorageError> {
        let raw = key::sanitize(key)?;
        Ok(self.device.read(&self.prefixed(&raw)).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> LocalAdapter<MemoryDevice> {
        LocalAdapter::in_memory(&EngineConfig::default())
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let local = adapter();
        let value = json!({"id": "p1", "status": "active"});

        local.set("project:p1", &value).await.unwrap();

        let result = local.get("project:p1").await.unwrap();
        assert_eq!(result, Some(value));
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let local = adapter();
        assert_eq!(local.get("project:missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove() {
        let local = adapter();
        local.set("tasks", &json!([1, 2, 3])).await.unwrap();
        local.remove("tasks").await.unwrap();
        assert_eq!(local.get("tasks").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let local = adapter();
        assert!(matches!(
            local.get("").await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            local.set("a:b:c:d", &json!(1)).await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_capacity_exceeded_is_critical() {
        let local = LocalAdapter::new(
            MemoryDevice::new(256),
            "t_".into(),
            CompressionConfig {
                enabled: false,
                ..Default::default()
            },
        );
        let big = json!({"blob": "z".repeat(512)});

        let err = local.set("blobs:b1", &big).await.unwrap_err();
        assert!(matches!(err, StorageError::CapacityExceeded { .. }));
        assert_eq!(err.severity(), crate::error::Severity::Critical);
        assert!(err.user_message().is_some());

        // The failed write must not leave partial data
        assert_eq!(local.get("blobs:b1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_reclaims_quota() {
        let local = LocalAdapter::new(
            MemoryDevice::new(1024),
            "t_".into(),
            CompressionConfig {
                enabled: false,
                ..Default::default()
            },
        );
        // Repeated overwrites of the same key must not accumulate usage
        for i in 0..50 {
            local
                .set("counter", &json!({"value": i, "pad": "p".repeat(100)}))
                .await
                .unwrap();
        }
        assert!(local.usage().used_bytes < 1024);
    }

    #[cfg(feature = "compression")]
    #[tokio::test]
    async fn test_large_value_compressed_transparently() {
        let local = adapter();
        let large = json!({"notes": "lorem ipsum ".repeat(2000)});

        local.set("project:p1:notes", &large).await.unwrap();

        // Round-trips through the sentinel path
        assert_eq!(local.get("project:p1:notes").await.unwrap(), Some(large));
        assert_eq!(local.compression_stats().kept, 1);
    }

    #[tokio::test]
    async fn test_clear_spares_foreign_prefixes() {
        let device = MemoryDevice::new(1024 * 1024);
        device
            .write("other_app_key", b"foreign".to_vec())
            .unwrap();
        let local = LocalAdapter::new(device, "mine_".into(), CompressionConfig::default());

        local.set("projects", &json!([])).await.unwrap();
        local.clear().await.unwrap();

        assert!(local.keys().await.unwrap().is_empty());
        // Foreign key untouched
        assert!(local.device.read("other_app_key").is_some());
    }

    #[tokio::test]
    async fn test_keys_strip_prefix() {
        let local = adapter();
        local.set("projects", &json!([])).await.unwrap();
        local.set("task:t1", &json!({"id": "t1"})).await.unwrap();

        let mut keys = local.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["projects", "task:t1"]);
    }

    #[tokio::test]
    async fn test_concurrent_writes_distinct_keys() {
        use std::sync::Arc;

        let local = Arc::new(adapter());
        let mut handles = vec![];

        for batch in 0..10 {
            let local = local.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    let key = format!("task:{batch}-{i}");
                    local.set(&key, &json!({"n": i})).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(local.keys().await.unwrap().len(), 100);
    }
}
