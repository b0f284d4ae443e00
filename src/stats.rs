//! Run summaries shared by the batch job and recalculation.
use crate::db::{self, Pool};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Job,
    Recalculate,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Job => "job",
            RunKind::Recalculate => "recalculate",
        }
    }
}

/// Counters produced by one anchor strategy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnchorStats {
    pub templates_processed: u64,
    pub templates_rejected: u64,
    pub students_found: u64,
    pub tasks_created: u64,
    pub tasks_updated: u64,
    pub tasks_skipped: u64,
    pub tasks_deleted: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl AnchorStats {
    pub fn failed(message: String) -> Self {
        Self {
            errors: vec![message],
            ..Default::default()
        }
    }
}

/// Immutable summary of one execution, persisted once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunStats {
    pub run_id: String,
    pub kind: RunKind,
    pub tenant_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub dry_run: bool,
    pub templates_processed: u64,
    pub students_found: u64,
    pub tasks_created: u64,
    pub tasks_updated: u64,
    pub tasks_skipped: u64,
    pub tasks_deleted: u64,
    pub tasks_promoted: u64,
    pub strategies_executed: u32,
    pub strategies_failed: u32,
    pub errors: Vec<String>,
    pub by_anchor: BTreeMap<String, AnchorStats>,
}

impl RunStats {
    pub fn begin(kind: RunKind, tenant_id: &str, dry_run: bool, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            kind,
            tenant_id: tenant_id.to_string(),
            started_at,
            finished_at: started_at,
            duration_ms: 0,
            dry_run,
            templates_processed: 0,
            students_found: 0,
            tasks_created: 0,
            tasks_updated: 0,
            tasks_skipped: 0,
            tasks_deleted: 0,
            tasks_promoted: 0,
            strategies_executed: 0,
            strategies_failed: 0,
            errors: Vec::new(),
            by_anchor: BTreeMap::new(),
        }
    }

    /// Fold one anchor's outcome into the totals. `failed` marks a strategy
    /// that aborted rather than one that finished with item errors.
    pub fn absorb(&mut self, anchor: &str, stats: AnchorStats, failed: bool) {
        self.strategies_executed += 1;
        if failed {
            self.strategies_failed += 1;
        }
        self.templates_processed += stats.templates_processed;
        self.students_found += stats.students_found;
        self.tasks_created += stats.tasks_created;
        self.tasks_updated += stats.tasks_updated;
        self.tasks_skipped += stats.tasks_skipped;
        self.tasks_deleted += stats.tasks_deleted;
        self.errors
            .extend(stats.errors.iter().map(|e| format!("{anchor}: {e}")));
        self.by_anchor.insert(anchor.to_string(), stats);
    }

    pub fn finish(&mut self, finished_at: DateTime<Utc>, elapsed: std::time::Duration) {
        self.finished_at = finished_at;
        self.duration_ms = elapsed.as_millis() as u64;
    }
}

pub async fn persist(pool: &Pool, stats: &RunStats) -> Result<()> {
    let value = serde_json::to_value(stats).context("encode run stats")?;
    db::insert_run(
        pool,
        &stats.run_id,
        &stats.tenant_id,
        stats.kind.as_str(),
        stats.started_at,
        stats.finished_at,
        &value,
    )
    .await
}

pub async fn last_run(pool: &Pool, tenant_id: &str, kind: RunKind) -> Result<Option<RunStats>> {
    match db::last_run(pool, tenant_id, kind.as_str()).await? {
        Some(value) => Ok(Some(serde_json::from_value(value).context("decode run stats")?)),
        None => Ok(None),
    }
}
