// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Timestamp-based conflict resolution (last-write-wins).
//!
//! [`ConflictResolver::resolve`] implements the LWW decision table with the
//! remote store as the designated tiebreaker (it is the system of record).
//! [`ConflictResolver::detect`] classifies a local/remote pair before
//! resolution; two updates inside the configured simultaneous window are
//! always `BothModified`, never auto-resolved — inside that window "newer"
//! is noise from clock skew or the sync interval, not signal.
//!
//! Every resolution is appended to a bounded ring log for diagnostics.

use crate::config::ConflictConfig;
use crate::time;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Which side a resolution picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Local,
    Remote,
    None,
}

impl Winner {
    fn label(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::None => "none",
        }
    }
}

/// Outcome of one LWW resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub winner: Winner,
    pub resolved: Option<Value>,
    pub reason: String,
}

/// Classification of a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    LocalNewer,
    RemoteNewer,
    BothModified,
    Unknown,
}

impl ConflictType {
    fn label(self) -> &'static str {
        match self {
            Self::LocalNewer => "local_newer",
            Self::RemoteNewer => "remote_newer",
            Self::BothModified => "both_modified",
            Self::Unknown => "unknown",
        }
    }
}

/// How a detected conflict should be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionStrategy {
    KeepLocal,
    KeepRemote,
    MergeAuto,
    MergeManual,
    Cancel,
}

impl ResolutionStrategy {
    fn label(self) -> &'static str {
        match self {
            Self::KeepLocal => "keep_local",
            Self::KeepRemote => "keep_remote",
            Self::MergeAuto => "merge_auto",
            Self::MergeManual => "merge_manual",
            Self::Cancel => "cancel",
        }
    }
}

/// One differing field between the two versions.
#[derive(Debug, Clone, Serialize)]
pub struct FieldDifference {
    pub field: String,
    pub local: Option<Value>,
    pub remote: Option<Value>,
}

/// A detected conflict, computed on demand.
#[derive(Debug, Clone)]
pub struct ConflictRecord {
    pub key: String,
    pub conflict_type: ConflictType,
    pub local_timestamp: Option<i64>,
    pub remote_timestamp: Option<i64>,
    pub field_differences: Vec<FieldDifference>,
    pub can_auto_resolve: bool,
    pub recommended: ResolutionStrategy,
}

/// Diagnostic record of one resolution, kept in the bounded log.
#[derive(Debug, Clone)]
pub struct ResolutionLogEntry {
    pub winner: Winner,
    pub reason: String,
    pub local_timestamp: Option<i64>,
    pub remote_timestamp: Option<i64>,
    pub local_actor: Option<String>,
    pub remote_actor: Option<String>,
    pub at: i64,
}

/// Aggregate resolution statistics.
#[derive(Debug, Clone, Default)]
pub struct ConflictStats {
    pub total: u64,
    pub local_wins: u64,
    pub remote_wins: u64,
    pub no_winner: u64,
    pub strategy_breakdown: HashMap<String, u64>,
}

/// Update timestamp of a record: `updated_at` or `updatedAt`, ISO-8601
/// string or epoch milliseconds.
#[must_use]
pub fn record_timestamp(value: &Value) -> Option<i64> {
    let field = value.get("updated_at").or_else(|| value.get("updatedAt"))?;
    match field {
        Value::String(s) => time::parse_iso(s),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// Updating-actor identifier: `updated_by` or `updatedBy`.
#[must_use]
pub fn record_actor(value: &Value) -> Option<&str> {
    value
        .get("updated_by")
        .or_else(|| value.get("updatedBy"))
        .and_then(Value::as_str)
}

pub struct ConflictResolver {
    config: ConflictConfig,
    log: Mutex<VecDeque<ResolutionLogEntry>>,
    stats: Mutex<ConflictStats>,
}

impl ConflictResolver {
    #[must_use]
    pub fn new(config: ConflictConfig) -> Self {
        Self {
            config,
            log: Mutex::new(VecDeque::new()),
            stats: Mutex::new(ConflictStats::default()),
        }
    }

    /// Last-write-wins. Decision order:
    /// 1. only one side exists, it wins;
    /// 2. neither exists, no winner;
    /// 3. newer timestamp wins, a missing timestamp loses to a present one,
    ///    both missing falls to remote;
    /// 4. equal timestamps fall to the lexicographically higher actor,
    ///    then to remote.
    pub fn resolve(&self, local: Option<&Value>, remote: Option<&Value>) -> Resolution {
        let resolution = match (local, remote) {
            (None, None) => Resolution {
                winner: Winner::None,
                resolved: None,
                reason: "neither side exists".to_string(),
            },
            (Some(l), None) => Resolution {
                winner: Winner::Local,
                resolved: Some(l.clone()),
                reason: "only local exists".to_string(),
            },
            (None, Some(r)) => Resolution {
                winner: Winner::Remote,
                resolved: Some(r.clone()),
                reason: "only remote exists".to_string(),
            },
            (Some(l), Some(r)) => self.resolve_both(l, r),
        };

        crate::metrics::record_conflict_resolved(resolution.winner.label());
        self.push_log(ResolutionLogEntry {
            winner: resolution.winner,
            reason: resolution.reason.clone(),
            local_timestamp: local.and_then(record_timestamp),
            remote_timestamp: remote.and_then(record_timestamp),
            local_actor: local.and_then(record_actor).map(str::to_string),
            remote_actor: remote.and_then(record_actor).map(str::to_string),
            at: time::now_ms(),
        });
        let mut stats = self.stats.lock();
        stats.total += 1;
        match resolution.winner {
            Winner::Local => stats.local_wins += 1,
            Winner::Remote => stats.remote_wins += 1,
            Winner::None => stats.no_winner += 1,
        }
        resolution
    }

    fn resolve_both(&self, local: &Value, remote: &Value) -> Resolution {
        let lt = record_timestamp(local);
        let rt = record_timestamp(remote);
        match (lt, rt) {
            (None, None) => Resolution {
                winner: Winner::Remote,
                resolved: Some(remote.clone()),
                reason: "no timestamps; remote is source of truth".to_string(),
            },
            (None, Some(_)) => Resolution {
                winner: Winner::Remote,
                resolved: Some(remote.clone()),
                reason: "local timestamp missing".to_string(),
            },
            (Some(_), None) => Resolution {
                winner: Winner::Local,
                resolved: Some(local.clone()),
                reason: "remote timestamp missing".to_string(),
            },
            (Some(l), Some(r)) if l > r => Resolution {
                winner: Winner::Local,
                resolved: Some(local.clone()),
                reason: format!("local newer ({l} > {r})"),
            },
            (Some(l), Some(r)) if r > l => Resolution {
                winner: Winner::Remote,
                resolved: Some(remote.clone()),
                reason: format!("remote newer ({r} > {l})"),
            },
            _ => {
                // Equal timestamps: actor identifier breaks the tie
                let la = record_actor(local);
                let ra = record_actor(remote);
                match (la, ra) {
                    (Some(l), Some(r)) if l > r => Resolution {
                        winner: Winner::Local,
                        resolved: Some(local.clone()),
                        reason: format!("equal timestamps; actor '{l}' > '{r}'"),
                    },
                    (Some(l), Some(r)) if r > l => Resolution {
                        winner: Winner::Remote,
                        resolved: Some(remote.clone()),
                        reason: format!("equal timestamps; actor '{r}' > '{l}'"),
                    },
                    _ => Resolution {
                        winner: Winner::Remote,
                        resolved: Some(remote.clone()),
                        reason: "equal timestamps; remote is source of truth".to_string(),
                    },
                }
            }
        }
    }

    /// Classify a local/remote pair. Equal values are no conflict.
    pub fn detect(&self, key: &str, local: &Value, remote: &Value) -> Option<ConflictRecord> {
        if local == remote {
            return None;
        }

        let lt = record_timestamp(local);
        let rt = record_timestamp(remote);
        let conflict_type = match (lt, rt) {
            (Some(l), Some(r)) if (l - r).abs() <= self.config.simultaneous_window_ms => {
                ConflictType::BothModified
            }
            (Some(l), Some(r)) if l > r => ConflictType::LocalNewer,
            (Some(_), Some(_)) => ConflictType::RemoteNewer,
            _ => ConflictType::Unknown,
        };

        let field_differences = field_differences(local, remote);
        let can_auto_resolve = !matches!(
            conflict_type,
            ConflictType::BothModified | ConflictType::Unknown
        );
        let recommended = match conflict_type {
            ConflictType::LocalNewer => ResolutionStrategy::KeepLocal,
            ConflictType::RemoteNewer => ResolutionStrategy::KeepRemote,
            ConflictType::BothModified | ConflictType::Unknown => ResolutionStrategy::MergeManual,
        };

        crate::metrics::record_conflict_detected(conflict_type.label());
        Some(ConflictRecord {
            key: key.to_string(),
            conflict_type,
            local_timestamp: lt,
            remote_timestamp: rt,
            field_differences,
            can_auto_resolve,
            recommended,
        })
    }

    /// Apply a strategy to a detected conflict. `Cancel` resolves to `None`.
    pub fn resolve_with_strategy(
        &self,
        local: &Value,
        remote: &Value,
        strategy: ResolutionStrategy,
        overrides: Option<&Map<String, Value>>,
    ) -> Option<Value> {
        self.stats
            .lock()
            .strategy_breakdown
            .entry(strategy.label().to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);

        match strategy {
            ResolutionStrategy::KeepLocal => Some(local.clone()),
            ResolutionStrategy::KeepRemote => Some(remote.clone()),
            ResolutionStrategy::MergeAuto => Some(self.auto_merge(local, remote)),
            ResolutionStrategy::MergeManual => Some(manual_merge(local, overrides)),
            ResolutionStrategy::Cancel => None,
        }
    }

    /// Field-level merge. For each differing field, the value from the side
    /// with the newer per-field timestamp wins when both sides carry one;
    /// otherwise remote's value is taken. Fields present only in local pass
    /// through. The merged record's timestamp is the max of the two sides.
    pub fn auto_merge(&self, local: &Value, remote: &Value) -> Value {
        let empty = Map::new();
        let lf = local.as_object().unwrap_or(&empty);
        let rf = remote.as_object().unwrap_or(&empty);

        let mut merged = Map::new();
        let fields: BTreeSet<&String> = lf.keys().chain(rf.keys()).collect();
        for field in fields {
            let merged_value = match (lf.get(field), rf.get(field)) {
                (Some(l), Some(r)) if l == r => l.clone(),
                (Some(l), Some(r)) => match (record_timestamp(l), record_timestamp(r)) {
                    (Some(lt), Some(rt)) if lt > rt => l.clone(),
                    _ => r.clone(),
                },
                (Some(l), None) => l.clone(),
                (None, Some(r)) => r.clone(),
                (None, None) => continue,
            };
            merged.insert(field.clone(), merged_value);
        }

        if let (Some(lt), Some(rt)) = (record_timestamp(local), record_timestamp(remote)) {
            merged.remove("updatedAt");
            merged.insert(
                "updated_at".to_string(),
                Value::String(time::to_iso(lt.max(rt))),
            );
        }
        Value::Object(merged)
    }

    /// Most recent resolutions, newest last.
    #[must_use]
    pub fn log(&self) -> Vec<ResolutionLogEntry> {
        self.log.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn stats(&self) -> ConflictStats {
        self.stats.lock().clone()
    }

    fn push_log(&self, entry: ResolutionLogEntry) {
        let mut log = self.log.lock();
        if log.len() >= self.config.log_capacity {
            log.pop_front();
        }
        log.push_back(entry);
    }
}

/// Local record plus caller-supplied overrides, stamped with a fresh
/// update timestamp.
#[must_use]
pub fn manual_merge(local: &Value, overrides: Option<&Map<String, Value>>) -> Value {
    let mut merged = local.as_object().cloned().unwrap_or_default();
    if let Some(overrides) = overrides {
        for (field, value) in overrides {
            merged.insert(field.clone(), value.clone());
        }
    }
    merged.remove("updatedAt");
    merged.insert(
        "updated_at".to_string(),
        Value::String(time::to_iso(time::now_ms())),
    );
    Value::Object(merged)
}

/// Symmetric field differences over the union of keys.
#[must_use]
pub fn field_differences(local: &Value, remote: &Value) -> Vec<FieldDifference> {
    let empty = Map::new();
    let lf = local.as_object().unwrap_or(&empty);
    let rf = remote.as_object().unwrap_or(&empty);

    let fields: BTreeSet<&String> = lf.keys().chain(rf.keys()).collect();
    fields
        .into_iter()
        .filter(|f| lf.get(*f) != rf.get(*f))
        .map(|f| FieldDifference {
            field: f.clone(),
            local: lf.get(f).cloned(),
            remote: rf.get(f).cloned(),
        })
        .collect()
}
