// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the storage engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `syncstore_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size histograms
//!
//! # Labels
//! - `adapter`: local, remote, dual_write, bidirectional
//! - `operation`: get, set, remove, clear, keys
//! - `status`: success, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a storage operation outcome
pub fn record_operation(adapter: &str, operation: &str, status: &str) {
    counter!(
        "syncstore_operations_total",
        "adapter" => adapter.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(adapter: &str, operation: &str, duration: Duration) {
    histogram!(
        "syncstore_operation_seconds",
        "adapter" => adapter.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an error by kind and severity for alerting
pub fn record_error(adapter: &str, kind: &str, severity: &str) {
    counter!(
        "syncstore_errors_total",
        "adapter" => adapter.to_string(),
        "kind" => kind.to_string(),
        "severity" => severity.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// LOCAL DEVICE - Capacity tracking
// ═══════════════════════════════════════════════════════════════════════════

/// Set bytes currently used on the local device
pub fn set_local_used_bytes(bytes: u64) {
    gauge!("syncstore_local_used_bytes").set(bytes as f64);
}

/// Record a write rejected because the local device is full
pub fn record_capacity_exceeded() {
    counter!("syncstore_capacity_exceeded_total").increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// COMPRESSION
// ═══════════════════════════════════════════════════════════════════════════

/// Record a compression attempt outcome ("kept" or "skipped")
pub fn record_compression(outcome: &str, original: usize, stored: usize) {
    counter!(
        "syncstore_compression_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
    if outcome == "kept" {
        counter!("syncstore_compression_saved_bytes_total")
            .increment((original.saturating_sub(stored)) as u64);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// QUEUES - The offline-queue depth is a health signal: a growing queue
// means replication is falling behind or the host is offline.
// ═══════════════════════════════════════════════════════════════════════════

/// Set offline queue depth
pub fn set_offline_queue_depth(depth: usize) {
    gauge!("syncstore_offline_queue_depth").set(depth as f64);
}

/// Record an entry evicted from the offline queue (oldest-first overflow)
pub fn record_queue_evicted() {
    counter!("syncstore_offline_queue_evicted_total").increment(1);
}

/// Record an entry dropped after exhausting its retries
pub fn record_queue_dropped(queue: &str) {
    counter!(
        "syncstore_queue_dropped_total",
        "queue" => queue.to_string()
    )
    .increment(1);
}

/// Set dual-write retry queue depth
pub fn set_dual_write_queue_depth(depth: usize) {
    gauge!("syncstore_dual_write_queue_depth").set(depth as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// CONFLICTS
// ═══════════════════════════════════════════════════════════════════════════

/// Record a conflict resolution by winner ("local", "remote", "none")
pub fn record_conflict_resolved(winner: &str) {
    counter!(
        "syncstore_conflicts_resolved_total",
        "winner" => winner.to_string()
    )
    .increment(1);
}

/// Record a detected conflict by type
pub fn record_conflict_detected(conflict_type: &str) {
    counter!(
        "syncstore_conflicts_detected_total",
        "type" => conflict_type.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNC CYCLES
// ═══════════════════════════════════════════════════════════════════════════

/// Record a sync cycle outcome ("success", "error", "skipped")
pub fn record_sync_cycle(status: &str) {
    counter!(
        "syncstore_sync_cycles_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record sync cycle latency
pub fn record_sync_latency(duration: Duration) {
    histogram!("syncstore_sync_cycle_seconds").record(duration.as_secs_f64());
}

/// Set online/offline state (1 = online, 0 = offline)
pub fn set_online(online: bool) {
    gauge!("syncstore_online").set(if online { 1.0 } else { 0.0 });
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE
// ═══════════════════════════════════════════════════════════════════════════

/// Record cache hit/miss
pub fn record_cache(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(
        "syncstore_cache_total",
        "outcome" => outcome
    )
    .increment(1);
}

/// Set current cache entry count
pub fn set_cache_entries(count: usize) {
    gauge!("syncstore_cache_entries").set(count as f64);
}

/// Record a cache eviction
pub fn record_cache_eviction() {
    counter!("syncstore_cache_evictions_total").increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// MIGRATIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Record a migration step ("up" or "down")
pub fn record_migration_step(direction: &str, status: &str) {
    counter!(
        "syncstore_migration_steps_total",
        "direction" => direction.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record an automatic restore after a failed migration
pub fn record_migration_restore(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "syncstore_migration_restores_total",
        "status" => status
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// INDEXES
// ═══════════════════════════════════════════════════════════════════════════

/// Record an index lookup hit/miss
pub fn record_index_lookup(index: &str, hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(
        "syncstore_index_lookups_total",
        "index" => index.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record an index rebuild
pub fn record_index_rebuild(index: &str, items: usize) {
    counter!(
        "syncstore_index_rebuilds_total",
        "index" => index.to_string()
    )
    .increment(1);
    histogram!("syncstore_index_rebuild_items").record(items as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// INTEGRITY
// ═══════════════════════════════════════════════════════════════════════════

/// Record an integrity check result for an entity
pub fn record_integrity_check(entity: &str, passed: bool) {
    let status = if passed { "pass" } else { "fail" };
    counter!(
        "syncstore_integrity_checks_total",
        "entity" => entity.to_string(),
        "status" => status
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    adapter: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(adapter: &'static str, operation: &'static str) -> Self {
        Self {
            adapter,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.adapter, self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($adapter:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($adapter, $op)
    };
}
