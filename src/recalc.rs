//! Operator-triggered rebuild of generated tasks, guarded by the process lock.
use crate::anchors::create_strategy;
use crate::db;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::model::{Anchor, CreatedBy, Template, SUPPORTED_ANCHORS};
use crate::stats::{self, AnchorStats, RunKind, RunStats};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecalcRequest {
    pub anchor: Option<String>,
    pub dry_run: bool,
    /// Skip the lock entirely.
    pub force: bool,
}

impl Default for RecalcRequest {
    fn default() -> Self {
        Self {
            anchor: None,
            dry_run: true,
            force: false,
        }
    }
}

#[instrument(skip_all, fields(tenant_id = %tenant_id))]
pub async fn recalculate(engine: &Engine, tenant_id: &str, request: &RecalcRequest) -> EngineResult<RunStats> {
    let requested = match request.anchor.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
        Some(code) => Some(
            Anchor::parse(code)
                .ok_or_else(|| EngineError::Validation(format!("unsupported anchor '{code}'")))?,
        ),
        None => None,
    };

    let lock = engine.recalc_lock();
    if !request.force {
        lock.acquire(engine.clock.now()).await?;
    }

    let result = rebuild(engine, tenant_id, requested, request.dry_run).await;

    if !request.force {
        if let Err(err) = lock.release().await {
            error!(?err, "failed to release recalculation lock");
        }
    }

    let run = result?;
    if !request.dry_run {
        engine.registry.invalidate(tenant_id).await;
    }
    Ok(run)
}

async fn rebuild(
    engine: &Engine,
    tenant_id: &str,
    requested: Option<Anchor>,
    dry_run: bool,
) -> EngineResult<RunStats> {
    let timer = Instant::now();
    let mut run = RunStats::begin(RunKind::Recalculate, tenant_id, dry_run, engine.clock.now());

    // Straight from the store: recalculation must not see a stale cache.
    let templates = db::list_active_templates(&engine.pool, tenant_id).await?;
    let mut grouped: BTreeMap<Anchor, Vec<Template>> = BTreeMap::new();
    for template in templates {
        match template.anchor() {
            Some(anchor) => grouped.entry(anchor).or_default().push(template),
            None => run.errors.push(format!(
                "{}: unsupported anchor '{}'",
                template.code, template.anchor
            )),
        }
    }

    let scope: Vec<Anchor> = match requested {
        Some(anchor) => vec![anchor],
        None => SUPPORTED_ANCHORS
            .iter()
            .copied()
            .filter(|a| grouped.contains_key(a))
            .collect(),
    };

    for anchor in scope {
        let code = anchor.as_str();
        if anchor == Anchor::Manual {
            // Manual tasks have no generator to rebuild them from.
            run.absorb(code, AnchorStats::default(), false);
            continue;
        }

        let removed = if dry_run {
            db::count_regenerable_tasks(&engine.pool, tenant_id, code)
                .await
                .map(|n| n.max(0) as u64)
        } else {
            db::delete_regenerable_tasks(&engine.pool, tenant_id, code).await
        };
        let removed = match removed {
            Ok(n) => n,
            Err(err) => {
                warn!(anchor = code, ?err, "clearing tasks failed");
                run.absorb(code, AnchorStats::failed(format!("{err:#}")), true);
                continue;
            }
        };

        let strategy = create_strategy(anchor, &engine.settings.horizons);
        let ctx = engine.strategy_context(tenant_id, dry_run, CreatedBy::ManualRecalculate, dry_run);
        let anchor_templates = grouped.get(&anchor).map(Vec::as_slice).unwrap_or(&[]);
        match strategy.process_anchor(&ctx, anchor_templates).await {
            Ok(mut anchor_stats) => {
                anchor_stats.tasks_deleted = removed;
                run.absorb(code, anchor_stats, false);
            }
            Err(err) => {
                warn!(anchor = code, ?err, "regeneration failed");
                let mut anchor_stats = AnchorStats::failed(format!("{err:#}"));
                anchor_stats.tasks_deleted = removed;
                run.absorb(code, anchor_stats, true);
            }
        }
    }

    run.finish(engine.clock.now(), timer.elapsed());
    if let Err(err) = stats::persist(&engine.pool, &run).await {
        error!(?err, "failed to persist run stats");
        run.errors.push(format!("run stats not persisted: {err:#}"));
    }
    info!(
        run_id = %run.run_id,
        deleted = run.tasks_deleted,
        created = run.tasks_created,
        skipped = run.tasks_skipped,
        errors = run.errors.len(),
        dry_run,
        "recalculation finished"
    );
    Ok(run)
}
