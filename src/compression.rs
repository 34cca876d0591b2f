//! Transparent compression for large local values.
//!
//! The compressor is a strategy behind the narrow [`Compressor`] trait so it
//! can be swapped without touching adapters. The default strategy is zstd
//! (feature `compression`, enabled by default); its magic bytes double as the
//! stored-payload sentinel, so `decode` auto-detects compressed data and
//! passes plain JSON through untouched (legacy/uncompressed path).
//!
//! [`CompressionManager`] adds the policy layer: a size threshold below which
//! values are stored plain, a minimum-ratio gate that discards compression
//! attempts that don't pay for themselves, and an adaptive threshold that
//! tightens when compression keeps winning and backs off when it doesn't.
//!
//! # Feature Flag
//!
//! ```toml
//! [dependencies]
//! syncstore = { version = "0.3", features = ["compression"] }
//! ```
//!
//! With the feature disabled, [`CompressionManager`] stores everything plain.

use crate::config::CompressionConfig;
use parking_lot::Mutex;

/// Zstd magic bytes (little-endian): 0xFD2FB528
#[cfg(feature = "compression")]
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Default compression level (3 is a good balance of speed/ratio)
#[cfg(feature = "compression")]
const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Attempts between adaptive threshold adjustments.
const ADAPTIVE_WINDOW: u64 = 10;

/// Compression error types
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// Failed to compress data
    #[error("compression failed: {0}")]
    CompressFailed(String),

    /// Failed to decompress data
    #[error("decompression failed: {0}")]
    DecompressFailed(String),
}

/// A swappable compression strategy.
///
/// `decompress` must accept its own output and pass through data it did not
/// produce (detected via `is_compressed`), so stored values written before a
/// strategy change remain readable.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;
    fn is_compressed(&self, data: &[u8]) -> bool;
}

/// Zstd-backed default strategy.
#[cfg(feature = "compression")]
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: i32,
}

#[cfg(feature = "compression")]
impl ZstdCompressor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            level: DEFAULT_COMPRESSION_LEVEL,
        }
    }

    /// Custom compression level (1-22). Higher = better ratio, slower.
    #[must_use]
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

#[cfg(feature = "compression")]
impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "compression")]
impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        zstd::encode_all(data, self.level).map_err(|e| CompressionError::CompressFailed(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if self.is_compressed(data) {
            zstd::decode_all(data).map_err(|e| CompressionError::DecompressFailed(e.to_string()))
        } else {
            // Plain JSON (legacy data)
            Ok(data.to_vec())
        }
    }

    #[inline]
    fn is_compressed(&self, data: &[u8]) -> bool {
        data.len() >= 4 && data[..4] == ZSTD_MAGIC
    }
}

/// Pass-through strategy used when the `compression` feature is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(data.to_vec())
    }

    fn is_compressed(&self, _data: &[u8]) -> bool {
        false
    }
}

/// Cumulative compression statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionStats {
    /// Values stored compressed
    pub kept: u64,
    /// Candidates stored plain (ratio gate or size threshold)
    pub skipped: u64,
    /// Total bytes before compression (kept values only)
    pub original_bytes: u64,
    /// Total bytes after compression (kept values only)
    pub stored_bytes: u64,
    /// Current adaptive threshold in bytes
    pub threshold_bytes: usize,
}

impl CompressionStats {
    /// Fraction of candidates where compression paid off (0.0 - 1.0).
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let attempts = self.kept + self.skipped;
        if attempts == 0 {
            return 0.0;
        }
        self.kept as f64 / attempts as f64
    }

    /// Space saved as a fraction of original bytes (0.0 - 1.0).
    #[must_use]
    pub fn savings(&self) -> f64 {
        if self.original_bytes == 0 {
            return 0.0;
        }
        1.0 - (self.stored_bytes as f64 / self.original_bytes as f64)
    }
}

struct ManagerState {
    threshold: usize,
    kept: u64,
    skipped: u64,
    original_bytes: u64,
    stored_bytes: u64,
    window_kept: u64,
    window_attempts: u64,
}

/// Policy wrapper around a [`Compressor`] strategy.
pub struct CompressionManager {
    strategy: Box<dyn Compressor>,
    config: CompressionConfig,
    state: Mutex<ManagerState>,
}

impl CompressionManager {
    /// Manager with the default strategy for the build configuration.
    #[must_use]
    pub fn new(config: CompressionConfig) -> Self {
        #[cfg(feature = "compression")]
        let strategy: Box<dyn Compressor> = Box::new(ZstdCompressor::new());
        #[cfg(not(feature = "compression"))]
        let strategy: Box<dyn Compressor> = Box::new(NoopCompressor);
        Self::with_strategy(config, strategy)
    }

    /// Manager with a caller-supplied strategy.
    #[must_use]
    pub fn with_strategy(config: CompressionConfig, strategy: Box<dyn Compressor>) -> Self {
        let threshold = config.threshold_bytes;
        Self {
            strategy,
            config,
            state: Mutex::new(ManagerState {
                threshold,
                kept: 0,
                skipped: 0,
                original_bytes: 0,
                stored_bytes: 0,
                window_kept: 0,
                window_attempts: 0,
            }),
        }
    }

    /// Encode a value for storage: compress when it pays, store plain otherwise.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let threshold = self.state.lock().threshold;
        if !self.config.enabled || data.len() < threshold {
            return Ok(data.to_vec());
        }

        let compressed = self.strategy.compress(data)?;
        let ratio = compressed.len() as f64 / data.len() as f64;
        if ratio < self.config.min_ratio {
            crate::metrics::record_compression("kept", data.len(), compressed.len());
            self.record_attempt(true, data.len(), compressed.len());
            Ok(compressed)
        } else {
            crate::metrics::record_compression("skipped", data.len(), data.len());
            self.record_attempt(false, 0, 0);
            Ok(data.to_vec())
        }
    }

    /// Decode stored bytes, auto-detecting compression via the sentinel.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if self.strategy.is_compressed(data) {
            self.strategy.decompress(data)
        } else {
            Ok(data.to_vec())
        }
    }

    #[must_use]
    pub fn stats(&self) -> CompressionStats {
        let state = self.state.lock();
        CompressionStats {
            kept: state.kept,
            skipped: state.skipped,
            original_bytes: state.original_bytes,
            stored_bytes: state.stored_bytes,
            threshold_bytes: state.threshold,
        }
    }

    fn record_attempt(&self, kept: bool, original: usize, stored: usize) {
        let mut state = self.state.lock();
        state.window_attempts += 1;
        if kept {
            state.kept += 1;
            state.window_kept += 1;
            state.original_bytes += original as u64;
            state.stored_bytes += stored as u64;
        } else {
            state.skipped += 1;
        }

        if state.window_attempts < ADAPTIVE_WINDOW {
            return;
        }
        let rate = state.window_kept as f64 / state.window_attempts as f64;
        if rate > 0.7 {
            state.threshold = (state.threshold / 2).max(self.config.min_threshold_bytes);
        } else if rate < 0.3 {
            state.threshold = (state.threshold * 2).min(self.config.max_threshold_bytes);
        }
        state.window_kept = 0;
        state.window_attempts = 0;
    }
}

#[cfg(test)]
#[cfg(feature = "compression")]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(threshold: usize) -> CompressionManager {
        CompressionManager::new(CompressionConfig {
            threshold_bytes: threshold,
            ..Default::default()
        })
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mgr = manager(0);
        let value = json!({
            "project": {"id": "p1", "status": "active"},
            "tasks": (0..100).map(|i| json!({"id": i, "name": "task"})).collect::<Vec<_>>(),
        });
        let bytes = serde_json::to_vec(&value).unwrap();

        let encoded = mgr.encode(&bytes).unwrap();
        let decoded = mgr.decode(&encoded).unwrap();

        assert_eq!(bytes, decoded);
    }

    #[test]
    fn test_sentinel_detection() {
        let comp = ZstdCompressor::new();
        let compressed = comp.compress(b"hello hello hello hello").unwrap();

        assert!(comp.is_compressed(&compressed));
        assert!(!comp.is_compressed(b"{\"plain\": true}"));
        assert!(!comp.is_compressed(b""));
        assert!(!comp.is_compressed(b"abc"));
    }

    #[test]
    fn test_decode_plain_json_passthrough() {
        // Simulate legacy uncompressed data
        let mgr = manager(0);
        let plain = b"{\"legacy\": true, \"value\": 123}";
        let decoded = mgr.decode(plain).unwrap();
        assert_eq!(plain.as_slice(), decoded.as_slice());
    }

    #[test]
    fn test_small_values_stored_plain() {
        let mgr = manager(10 * 1024);
        let small = b"{\"tiny\": 1}";
        let encoded = mgr.encode(small).unwrap();
        assert_eq!(small.as_slice(), encoded.as_slice());
    }

    #[test]
    fn test_ratio_gate_skips_incompressible() {
        let mgr = CompressionManager::new(CompressionConfig {
            threshold_bytes: 0,
            // Require 90%+ savings, which random-ish data won't hit
            min_ratio: 0.1,
            ..Default::default()
        });
        let data: Vec<u8> = (0..500u32).flat_map(|i| i.to_le_bytes()).collect();
        let encoded = mgr.encode(&data).unwrap();
        assert_eq!(data, encoded);
        assert_eq!(mgr.stats().skipped, 1);
    }

    #[test]
    fn test_repetitive_data_compresses_well() {
        let mgr = manager(0);
        let value = json!({"data": "x".repeat(5000)});
        let bytes = serde_json::to_vec(&value).unwrap();

        let encoded = mgr.encode(&bytes).unwrap();
        assert!(encoded.len() < bytes.len() / 2);

        let stats = mgr.stats();
        assert_eq!(stats.kept, 1);
        assert!(stats.savings() > 0.5, "expected >50% savings, got {:.1}%", stats.savings() * 100.0);
    }

    #[test]
    fn test_adaptive_threshold_tightens_on_success() {
        let config = CompressionConfig {
            threshold_bytes: 20 * 1024,
            ..Default::default()
        };
        let min = config.min_threshold_bytes;
        let mgr = CompressionManager::new(config);
        let compressible = serde_json::to_vec(&json!({"pad": "y".repeat(40 * 1024)})).unwrap();

        for _ in 0..ADAPTIVE_WINDOW {
            mgr.encode(&compressible).unwrap();
        }
        let stats = mgr.stats();
        assert!(stats.threshold_bytes < 20 * 1024);
        assert!(stats.threshold_bytes >= min);
    }

    #[test]
    fn test_noop_strategy() {
        let mgr = CompressionManager::with_strategy(
            CompressionConfig {
                threshold_bytes: 0,
                ..Default::default()
            },
            Box::new(NoopCompressor),
        );
        let data = b"some bytes";
        assert_eq!(mgr.encode(data).unwrap(), data.to_vec());
        assert_eq!(mgr.decode(data).unwrap(), data.to_vec());
    }
}
