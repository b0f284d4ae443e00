//! Daily batch run: every anchor strategy over the active template catalog,
//! executed in bounded concurrent batches.
use crate::anchors::create_strategy_for_code;
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::model::{Anchor, CreatedBy, Template, SUPPORTED_ANCHORS};
use crate::stats::{self, AnchorStats, RunKind, RunStats};
use crate::tasks;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRequest {
    /// Anchor codes to run; all supported anchors when absent.
    pub anchors: Option<Vec<String>>,
    pub force_refresh: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub last_run: Option<RunStats>,
    pub supported_anchors: Vec<&'static str>,
    pub max_parallel_strategies: usize,
    pub max_tasks_per_subject_per_day: u32,
    pub template_cache_ttl_seconds: u64,
}

fn group_by_anchor(templates: Vec<Template>, run: &mut RunStats) -> HashMap<Anchor, Vec<Template>> {
    let mut grouped: HashMap<Anchor, Vec<Template>> = HashMap::new();
    for template in templates {
        match template.anchor() {
            Some(anchor) => grouped.entry(anchor).or_default().push(template),
            None => {
                warn!(code = %template.code, anchor = %template.anchor, "template has unsupported anchor");
                run.errors.push(format!(
                    "{}: unsupported anchor '{}'",
                    template.code, template.anchor
                ));
            }
        }
    }
    grouped
}

fn requested_codes(request: &JobRequest) -> Vec<String> {
    let mut codes: Vec<String> = match &request.anchors {
        Some(list) if !list.is_empty() => list.iter().map(|c| c.trim().to_string()).collect(),
        _ => SUPPORTED_ANCHORS.iter().map(|a| a.as_str().to_string()).collect(),
    };
    let mut seen = std::collections::HashSet::new();
    codes.retain(|c| seen.insert(c.clone()));
    codes
}

#[instrument(skip_all, fields(tenant_id = %tenant_id))]
pub async fn run(engine: &Engine, tenant_id: &str, request: &JobRequest) -> EngineResult<RunStats> {
    let timer = Instant::now();
    let mut run = RunStats::begin(RunKind::Job, tenant_id, request.dry_run, engine.clock.now());

    let templates = engine
        .registry
        .fetch_active_templates(tenant_id, request.force_refresh)
        .await?;
    let grouped = group_by_anchor(templates, &mut run);
    let ctx = engine.strategy_context(tenant_id, request.dry_run, CreatedBy::Job, false);
    let width = engine.settings.max_parallel_strategies.max(1);

    let codes = requested_codes(request);
    for batch in codes.chunks(width) {
        let mut labels = Vec::with_capacity(batch.len());
        let mut handles = Vec::with_capacity(batch.len());
        for code in batch {
            let strategy = match create_strategy_for_code(code, &engine.settings.horizons) {
                Ok(strategy) => strategy,
                Err(err) => {
                    warn!(anchor = %code, %err, "skipping anchor");
                    run.absorb(code, AnchorStats::failed(err.to_string()), true);
                    continue;
                }
            };
            let ctx = ctx.clone();
            let templates = grouped.get(&strategy.anchor()).cloned().unwrap_or_default();
            labels.push(code.clone());
            handles.push(tokio::spawn(async move {
                strategy.process_anchor(&ctx, &templates).await
            }));
        }

        let results = join_all(handles).await;
        for (code, result) in labels.into_iter().zip(results) {
            match result {
                Ok(Ok(anchor_stats)) => run.absorb(&code, anchor_stats, false),
                Ok(Err(err)) => {
                    error!(anchor = %code, ?err, "anchor strategy failed");
                    run.absorb(&code, AnchorStats::failed(format!("{err:#}")), true);
                }
                Err(join_err) => {
                    error!(anchor = %code, %join_err, "anchor strategy aborted");
                    run.absorb(&code, AnchorStats::failed(format!("strategy aborted: {join_err}")), true);
                }
            }
        }
    }

    // After generation, so tasks created for today are promoted by this run.
    if !request.dry_run {
        match tasks::promote_due_tasks(engine, tenant_id).await {
            Ok(outcome) => run.tasks_promoted = outcome.promoted,
            Err(err) => {
                error!(%err, "promotion failed");
                run.errors.push(format!("promotion failed: {err}"));
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
        created = run.tasks_created,
        updated = run.tasks_updated,
        skipped = run.tasks_skipped,
        failed = run.strategies_failed,
        duration_ms = run.duration_ms,
        dry_run = run.dry_run,
        "relationship job finished"
    );
    Ok(run)
}

/// Last batch run plus the static engine configuration.
pub async fn health(engine: &Engine, tenant_id: &str) -> EngineResult<HealthReport> {
    let last_run = stats::last_run(&engine.pool, tenant_id, RunKind::Job).await?;
    Ok(HealthReport {
        last_run,
        supported_anchors: SUPPORTED_ANCHORS.iter().map(|a| a.as_str()).collect(),
        max_parallel_strategies: engine.settings.max_parallel_strategies,
        max_tasks_per_subject_per_day: engine.settings.max_tasks_per_subject_per_day,
        template_cache_ttl_seconds: engine.settings.template_cache_ttl_seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_codes_default_and_dedup() {
        let all = requested_codes(&JobRequest::default());
        assert_eq!(all.len(), SUPPORTED_ANCHORS.len());

        let req = JobRequest {
            anchors: Some(vec!["birthday".into(), " birthday".into(), "bogus".into()]),
            ..Default::default()
        };
        assert_eq!(requested_codes(&req), vec!["birthday", "bogus"]);
    }
}
