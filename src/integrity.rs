// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cross-store consistency checks between a local and a remote adapter.
//!
//! Checks are count-first: a shallow pass compares record counts per entity
//! and only a deep pass diffs record contents. Volatile fields the sync loop
//! rewrites on every cycle (`updated_at`, `modified_date`) are ignored so a
//! healthy store doesn't report phantom drift. Mismatch lists are capped;
//! past the cap only the count grows.

use crate::adapters::traits::StorageAdapter;
use crate::error::StorageError;
use crate::key::StorageKey;
use crate::time;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

const DEFAULT_MAX_MISMATCHES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    /// Record exists locally but not remotely.
    MissingRemote { id: String },
    /// Record exists remotely but not locally.
    MissingLocal { id: String },
    /// Record exists on both sides with different content.
    Different { id: String, fields: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct EntityReport {
    pub entity: String,
    pub local_count: usize,
    pub remote_count: usize,
    /// Capped at `max_mismatches`; `mismatch_total` keeps counting past it.
    pub mismatches: Vec<Mismatch>,
    pub mismatch_total: usize,
    pub deep: bool,
}

impl EntityReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.local_count == self.remote_count && self.mismatch_total == 0
    }
}

#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub checked_at: i64,
    pub duration_ms: u64,
    pub entities: Vec<EntityReport>,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.entities.iter().all(EntityReport::is_consistent)
    }

    /// Human-readable multi-line summary.
    #[must_use]
    pub fn format(&self) -> String {
        let mut out = String::new();
        let verdict = if self.is_consistent() { "OK" } else { "DRIFT" };
        let _ = writeln!(
            out,
            "integrity check [{verdict}] at {} ({}ms)",
            time::to_iso(self.checked_at),
            self.duration_ms
        );
        for report in &self.entities {
            let _ = writeln!(
                out,
                "  {}: local={} remote={} mismatches={}",
                report.entity, report.local_count, report.remote_count, report.mismatch_total
            );
            for mismatch in &report.mismatches {
                match mismatch {
                    Mismatch::MissingRemote { id } => {
                        let _ = writeln!(out, "    {id}: missing remotely");
                    }
                    Mismatch::MissingLocal { id } => {
                        let _ = writeln!(out, "    {id}: missing locally");
                    }
                    Mismatch::Different { id, fields } => {
                        let _ = writeln!(out, "    {id}: differs in [{}]", fields.join(", "));
                    }
                }
            }
            if report.mismatch_total > report.mismatches.len() {
                let _ = writeln!(
                    out,
                    "    ... and {} more",
                    report.mismatch_total - report.mismatches.len()
                );
            }
        }
        out
    }
}

pub struct IntegrityValidator {
    local: Arc<dyn StorageAdapter>,
    remote: Arc<dyn StorageAdapter>,
    ignore_fields: Vec<String>,
    max_mismatches: usize,
}

impl IntegrityValidator {
    #[must_use]
    pub fn new(local: Arc<dyn StorageAdapter>, remote: Arc<dyn StorageAdapter>) -> Self {
        Self {
            local,
            remote,
            ignore_fields: vec!["updated_at".to_string(), "modified_date".to_string()],
            max_mismatches: DEFAULT_MAX_MISMATCHES,
        }
    }

    #[must_use]
    pub fn with_ignore_fields(mut self, fields: Vec<String>) -> Self {
        self.ignore_fields = fields;
        self
    }

    #[must_use]
    pub fn with_max_mismatches(mut self, max: usize) -> Self {
        self.max_mismatches = max;
        self
    }

    /// Check one entity. Shallow checks compare counts only; `deep` also
    /// diffs each record.
    pub async fn check_entity(
        &self,
        entity: &str,
        deep: bool,
    ) -> Result<EntityReport, StorageError> {
        let local_records = self.collect(self.local.as_ref(), entity).await?;
        let remote_records = self.collect(self.remote.as_ref(), entity).await?;

        let mut report = EntityReport {
            entity: entity.to_string(),
            local_count: local_records.len(),
            remote_count: remote_records.len(),
            mismatches: Vec::new(),
            mismatch_total: 0,
            deep,
        };

        // Count-first: equal counts and no deep request means done
        if !deep {
            crate::metrics::record_integrity_check(entity, report.is_consistent());
            return Ok(report);
        }

        let ids: BTreeSet<&String> = local_records
            .iter()
            .map(|(id, _)| id)
            .chain(remote_records.iter().map(|(id, _)| id))
            .collect();

        for id in ids {
            let local = local_records.iter().find(|(i, _)| i == id).map(|(_, v)| v);
            let remote = remote_records.iter().find(|(i, _)| i == id).map(|(_, v)| v);
            let mismatch = match (local, remote) {
                (Some(_), None) => Some(Mismatch::MissingRemote { id: id.clone() }),
                (None, Some(_)) => Some(Mismatch::MissingLocal { id: id.clone() }),
                (Some(l), Some(r)) => {
                    let fields = self.differing_fields(l, r);
                    if fields.is_empty() {
                        None
                    } else {
                        Some(Mismatch::Different {
                            id: id.clone(),
                            fields,
                        })
                    }
                }
                (None, None) => None,
            };
            if let Some(m) = mismatch {
                report.mismatch_total += 1;
                if report.mismatches.len() < self.max_mismatches {
                    report.mismatches.push(m);
                }
            }
        }

        if report.mismatch_total > 0 {
            warn!(
                entity,
                mismatches = report.mismatch_total,
                "integrity drift detected"
            );
        } else {
            debug!(entity, "entity consistent");
        }
        crate::metrics::record_integrity_check(entity, report.is_consistent());
        Ok(report)
    }

    /// Check several entities and aggregate into one report.
    pub async fn validate(
        &self,
        entities: &[&str],
        deep: bool,
    ) -> Result<IntegrityReport, StorageError> {
        let started = Instant::now();
        let mut reports = Vec::with_capacity(entities.len());
        for entity in entities {
            reports.push(self.check_entity(entity, deep).await?);
        }
        Ok(IntegrityReport {
            checked_at: time::now_ms(),
            duration_ms: started.elapsed().as_millis() as u64,
            entities: reports,
        })
    }

    /// Gather `(id, record)` pairs for an entity from one adapter, merging
    /// the collection key with any per-record keys.
    async fn collect(
        &self,
        adapter: &dyn StorageAdapter,
        entity: &str,
    ) -> Result<Vec<(String, Value)>, StorageError> {
        let mut records: Vec<(String, Value)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        if let Some(Value::Array(rows)) = adapter.get(entity).await? {
            for row in rows {
                if let Some(id) = row.get("id").and_then(Value::as_str) {
                    if seen.insert(id.to_string()) {
                        records.push((id.to_string(), row.clone()));
                    }
                }
            }
        }
        for raw in adapter.keys().await? {
            let Ok(key) = StorageKey::parse(&raw) else {
                continue;
            };
            if key.entity != entity || key.subkey.is_some() {
                continue;
            }
            let Some(id) = key.id else { continue };
            if seen.contains(&id) {
                continue;
            }
            if let Some(value) = adapter.get(&raw).await? {
                seen.insert(id.clone());
                records.push((id, value));
            }
        }
        Ok(records)
    }

    fn differing_fields(&self, local: &Value, remote: &Value) -> Vec<String> {
        let (Some(l), Some(r)) = (local.as_object(), remote.as_object()) else {
            return if local == remote {
                Vec::new()
            } else {
                vec!["<value>".to_string()]
            };
        };
        let fields: BTreeSet<&String> = l.keys().chain(r.keys()).collect();
        fields
            .into_iter()
            .filter(|f| !self.ignore_fields.iter().any(|ig| ig == *f))
            .filter(|f| l.get(*f) != r.get(*f))
            .map(|f| f.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::local::LocalAdapter;
    use crate::config::EngineConfig;
    use serde_json::json;

    fn adapter() -> Arc<dyn StorageAdapter> {
        Arc::new(LocalAdapter::in_memory(&EngineConfig::default()))
    }

    #[tokio::test]
    async fn test_consistent_stores() {
        let local = adapter();
        let remote = adapter();
        for side in [&local, &remote] {
            side.set("task:t1", &json!({"id": "t1", "done": true}))
                .await
                .unwrap();
        }

        let validator = IntegrityValidator::new(local, remote);
        let report = validator.check_entity("task", true).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.local_count, 1);
    }

    #[tokio::test]
    async fn test_shallow_check_counts_only() {
        let local = adapter();
        let remote = adapter();
        local
            .set("task:t1", &json!({"id": "t1", "done": true}))
            .await
            .unwrap();
        remote
            .set("task:t1", &json!({"id": "t1", "done": false}))
            .await
            .unwrap();

        let validator = IntegrityValidator::new(local, remote);
        let report = validator.check_entity("task", false).await.unwrap();
        // Same counts, content never compared
        assert!(report.is_consistent());
        assert!(!report.deep);
    }

    #[tokio::test]
    async fn test_deep_check_finds_drift() {
        let local = adapter();
        let remote = adapter();
        local
            .set("task:t1", &json!({"id": "t1", "status": "open"}))
            .await
            .unwrap();
        local
            .set("task:t2", &json!({"id": "t2", "status": "open"}))
            .await
            .unwrap();
        remote
            .set("task:t1", &json!({"id": "t1", "status": "closed"}))
            .await
            .unwrap();
        remote
            .set("task:t3", &json!({"id": "t3", "status": "open"}))
            .await
            .unwrap();

        let validator = IntegrityValidator::new(local, remote);
        let report = validator.check_entity("task", true).await.unwrap();
        assert_eq!(report.mismatch_total, 3);
        assert!(report.mismatches.contains(&Mismatch::MissingRemote {
            id: "t2".to_string()
        }));
        assert!(report.mismatches.contains(&Mismatch::MissingLocal {
            id: "t3".to_string()
        }));
        assert!(report.mismatches.iter().any(|m| matches!(
            m,
            Mismatch::Different { id, fields } if id == "t1" && fields == &["status"]
        )));
    }

    #[tokio::test]
    async fn test_volatile_fields_ignored() {
        let local = adapter();
        let remote = adapter();
        local
            .set(
                "task:t1",
                &json!({"id": "t1", "done": true, "updated_at": 1000}),
            )
            .await
            .unwrap();
        remote
            .set(
                "task:t1",
                &json!({"id": "t1", "done": true, "updated_at": 2000}),
            )
            .await
            .unwrap();

        let validator = IntegrityValidator::new(local, remote);
        let report = validator.check_entity("task", true).await.unwrap();
        assert!(report.is_consistent());
    }

    #[tokio::test]
    async fn test_mismatch_list_is_capped() {
        let local = adapter();
        let remote = adapter();
        for i in 0..5 {
            local
                .set(&format!("task:t{i}"), &json!({"id": format!("t{i}")}))
                .await
                .unwrap();
        }

        let validator =
            IntegrityValidator::new(local, remote).with_max_mismatches(2);
        let report = validator.validate(&["task"], true).await.unwrap();
        let entity = &report.entities[0];
        assert_eq!(entity.mismatches.len(), 2);
        assert_eq!(entity.mismatch_total, 5);
        assert!(report.format().contains("and 3 more"));
    }

    #[tokio::test]
    async fn test_aggregate_report_format() {
        let local = adapter();
        let remote = adapter();
        local
            .set("task:t1", &json!({"id": "t1"}))
            .await
            .unwrap();

        let validator = IntegrityValidator::new(local, remote);
        let report = validator.validate(&["task", "project"], true).await.unwrap();
        assert!(!report.is_consistent());
        let text = report.format();
        assert!(text.contains("DRIFT"));
        assert!(text.contains("task: local=1 remote=0"));
        assert!(text.contains("project: local=0 remote=0"));
    }
}
