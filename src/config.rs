//! Configuration for the storage engine.
//!
//! All fields have sensible defaults; the host application owns loading and
//! deserialization (env, file, flags). The engine itself never reads config
//! sources.
//!
//! # Example
//!
//! ```
//! use syncstore::EngineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = EngineConfig::default();
//! assert_eq!(config.prefix, "syncstore_v1_");
//! assert_eq!(config.quota_bytes, 5 * 1024 * 1024);
//!
//! // Full config
//! let config = EngineConfig {
//!     prefix: "myapp_v2_".into(),
//!     quota_bytes: 10 * 1024 * 1024,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

/// Reserved key holding the schema version record.
pub const SCHEMA_VERSION_KEY: &str = "_version";

/// Reserved key the offline queue persists under.
pub const OFFLINE_QUEUE_KEY: &str = "_offline_queue";

/// Reserved key the dual-write retry queue persists under.
pub const DUAL_WRITE_QUEUE_KEY: &str = "_dual_write_queue";

/// Top-level configuration for the storage engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Namespace prefix applied to every key on the local device.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Hard capacity ceiling for the local device in bytes (default: 5 MiB).
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub conflict: ConflictConfig,
}

/// In-memory cache inside `StorageManager`.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    /// Global TTL in milliseconds (default: 5 minutes).
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
}

/// Transparent compression of large local values.
#[derive(Debug, Clone, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Only values above this size are candidates (default: 10 KiB).
    #[serde(default = "default_compression_threshold")]
    pub threshold_bytes: usize,

    /// Compressed output must be below `min_ratio * original` to be kept.
    #[serde(default = "default_compression_min_ratio")]
    pub min_ratio: f64,

    /// Adaptive threshold bounds.
    #[serde(default = "default_compression_min_threshold")]
    pub min_threshold_bytes: usize,
    #[serde(default = "default_compression_max_threshold")]
    pub max_threshold_bytes: usize,
}

/// Offline queue bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Oldest entries are evicted past this depth.
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,

    /// Failed entries are dropped after this many attempts.
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,
}

/// Background sync cadence and retry behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Bidirectional pull/push cycle interval (default: 10s).
    #[serde(default = "default_pull_interval_ms")]
    pub pull_interval_ms: u64,

    /// Dual-write retry queue flush interval (default: 5s).
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Exponential backoff base for propagation retries (default: 1s).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Permanent failure after this many propagation attempts.
    #[serde(default = "default_sync_max_retries")]
    pub max_retries: u32,
}

/// Conflict resolution tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ConflictConfig {
    /// Two updates within this window are `both_modified` (default: 15s).
    #[serde(default = "default_simultaneous_window_ms")]
    pub simultaneous_window_ms: i64,

    /// Ring-buffer capacity of the resolution log.
    #[serde(default = "default_conflict_log_capacity")]
    pub log_capacity: usize,

    /// Ring-buffer capacity of recent sync errors.
    #[serde(default = "default_error_ring_capacity")]
    pub error_ring_capacity: usize,
}

fn default_prefix() -> String {
    "syncstore_v1_".to_string()
}
fn default_quota_bytes() -> u64 {
    5 * 1024 * 1024
}
fn default_cache_max_entries() -> usize {
    1000
}
fn default_cache_ttl_ms() -> u64 {
    5 * 60 * 1000
}
fn default_true() -> bool {
    true
}
fn default_compression_threshold() -> usize {
    10 * 1024
}
fn default_compression_min_ratio() -> f64 {
    0.9
}
fn default_compression_min_threshold() -> usize {
    5 * 1024
}
fn default_compression_max_threshold() -> usize {
    50 * 1024
}
fn default_queue_max_size() -> usize {
    1000
}
fn default_queue_max_retries() -> u32 {
    3
}
fn default_pull_interval_ms() -> u64 {
    10_000
}
fn default_flush_interval_ms() -> u64 {
    5_000
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_sync_max_retries() -> u32 {
    3
}
fn default_simultaneous_window_ms() -> i64 {
    15_000
}
fn default_conflict_log_capacity() -> usize {
    1000
}
fn default_error_ring_capacity() -> usize {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            quota_bytes: default_quota_bytes(),
            cache: CacheConfig::default(),
            compression: CompressionConfig::default(),
            queue: QueueConfig::default(),
            sync: SyncConfig::default(),
            conflict: ConflictConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            ttl_ms: default_cache_ttl_ms(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            threshold_bytes: default_compression_threshold(),
            min_ratio: default_compression_min_ratio(),
            min_threshold_bytes: default_compression_min_threshold(),
            max_threshold_bytes: default_compression_max_threshold(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_queue_max_size(),
            max_retries: default_queue_max_retries(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pull_interval_ms: default_pull_interval_ms(),
            flush_interval_ms: default_flush_interval_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            max_retries: default_sync_max_retries(),
        }
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            simultaneous_window_ms: default_simultaneous_window_ms(),
            log_capacity: default_conflict_log_capacity(),
            error_ring_capacity: default_error_ring_capacity(),
        }
    }
}

/// True for keys the engine reserves for its own bookkeeping.
#[must_use]
pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with('_')
}
