//! Event-driven generation for one subject: a closed sale, a completed
//! onboarding or an incident saved with a reminder creates that anchor's
//! tasks right away instead of waiting for the daily run.
use crate::anchors::select::Candidate;
use crate::anchors::{create_strategy, generate};
use crate::db;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::model::{Anchor, CreatedBy, Subject, Template};
use crate::stats::AnchorStats;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{info, instrument};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventRequest {
    /// `sale_close`, `first_workout` or `occurrence_followup`.
    pub anchor: String,
    pub subject_id: String,
    /// Required for `occurrence_followup`.
    pub occurrence_id: Option<i64>,
    /// Local day the event happened on. Defaults to today for a sale, the
    /// subject's first workout date for onboarding and the reminder day for
    /// an incident.
    pub event_date: Option<NaiveDate>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventOutcome {
    pub anchor: Anchor,
    pub subject_id: String,
    pub anchor_date: NaiveDate,
    pub dry_run: bool,
    pub stats: AnchorStats,
}

async fn candidate_for(
    engine: &Engine,
    tenant_id: &str,
    anchor: Anchor,
    subject: Subject,
    request: &EventRequest,
) -> EngineResult<Candidate> {
    let today = engine.calendar.local_date(engine.clock.now());
    match anchor {
        Anchor::SaleClose => Ok(Candidate {
            anchor_date: request.event_date.unwrap_or(today),
            subject,
            occurrence: None,
        }),
        Anchor::FirstWorkout => {
            let anchor_date = request
                .event_date
                .or(subject.first_workout_date)
                .ok_or_else(|| {
                    EngineError::Validation(format!("subject {} has no first workout date", subject.id))
                })?;
            Ok(Candidate {
                subject,
                anchor_date,
                occurrence: None,
            })
        }
        Anchor::OccurrenceFollowup => {
            let id = request
                .occurrence_id
                .ok_or_else(|| EngineError::Validation("occurrence_id is required".into()))?;
            let occurrence = db::get_occurrence(&engine.pool, tenant_id, id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("occurrence {id}")))?;
            if occurrence.subject_id != subject.id {
                return Err(EngineError::Validation(format!(
                    "occurrence {id} does not belong to subject {}",
                    subject.id
                )));
            }
            let anchor_date = request
                .event_date
                .or_else(|| occurrence.reminder_at.map(|at| engine.calendar.local_date(at)))
                .unwrap_or(today);
            Ok(Candidate {
                subject,
                anchor_date,
                occurrence: Some(occurrence),
            })
        }
        other => Err(EngineError::Validation(format!("anchor '{other}' has no event trigger"))),
    }
}

/// Generate the tasks of one anchor for one subject. Dedup, the daily cap and
/// the past-date rule apply exactly as in the batch run.
#[instrument(skip_all, fields(tenant_id = %tenant_id, anchor = %request.anchor))]
pub async fn trigger_event(engine: &Engine, tenant_id: &str, request: &EventRequest) -> EngineResult<EventOutcome> {
    let started = Instant::now();
    let anchor = Anchor::parse(&request.anchor)
        .ok_or_else(|| EngineError::Validation(format!("unsupported anchor '{}'", request.anchor)))?;
    let subject = db::get_subject(&engine.pool, tenant_id, request.subject_id.trim())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("subject {}", request.subject_id)))?;
    let candidate = candidate_for(engine, tenant_id, anchor, subject, request).await?;

    let templates: Vec<Template> = engine
        .registry
        .fetch_active_templates(tenant_id, false)
        .await?
        .into_iter()
        .filter(|t| t.anchor() == Some(anchor))
        .collect();
    let strategy = create_strategy(anchor, &engine.settings.horizons);
    let mut stats = AnchorStats::default();
    let valid = strategy.accept_templates(&templates, &mut stats);
    stats.students_found = 1;

    let ctx = engine.strategy_context(tenant_id, request.dry_run, CreatedBy::Trigger, false);
    generate::generate(&ctx, anchor, &valid, std::slice::from_ref(&candidate), &mut stats).await;
    stats.duration_ms = started.elapsed().as_millis() as u64;

    info!(
        subject_id = %candidate.subject.id,
        created = stats.tasks_created,
        updated = stats.tasks_updated,
        skipped = stats.tasks_skipped,
        errors = stats.errors.len(),
        dry_run = request.dry_run,
        "event processed"
    );
    Ok(EventOutcome {
        anchor,
        subject_id: candidate.subject.id,
        anchor_date: candidate.anchor_date,
        dry_run: request.dry_run,
        stats,
    })
}
