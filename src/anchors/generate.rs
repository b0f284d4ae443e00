//! Turns `(template, candidate)` pairs into persisted tasks.
use super::select::Candidate;
use crate::clock::{Clock, LocalCalendar};
use crate::db::{self, NewTask, Pool};
use crate::model::{compute_scheduled_date, Anchor, AudienceFilter, CreatedBy, TaskStatus, Template};
use crate::render::{self, RenderContext};
use crate::stats::AnchorStats;
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Per-run knobs shared by every strategy.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub max_tasks_per_subject_per_day: u32,
    pub send_hour: u32,
    pub app_url: String,
}

/// Everything a strategy needs to run; cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct StrategyContext {
    pub pool: Pool,
    pub tenant_id: String,
    pub clock: Arc<dyn Clock>,
    pub calendar: LocalCalendar,
    pub settings: GenerationSettings,
    pub dry_run: bool,
    pub created_by: CreatedBy,
    /// Project a rebuild: regenerable tasks of the anchor being processed are
    /// treated as already deleted.
    pub assume_cleared: bool,
    pub cap: Arc<DailyCap>,
}

/// Run-scoped per-subject, per-day task counter. Seeded lazily from the store
/// and guarded by one mutex so concurrent anchors reserve slots atomically.
pub struct DailyCap {
    limit: u32,
    counts: Mutex<HashMap<(String, NaiveDate), u32>>,
}

impl DailyCap {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve one slot for the subject on `day`. Returns false when the cap
    /// is reached.
    pub async fn reserve(
        &self,
        ctx: &StrategyContext,
        subject_id: &str,
        day: NaiveDate,
        ignore_anchor: Option<&str>,
    ) -> Result<bool> {
        let mut counts = self.counts.lock().await;
        let key = (subject_id.to_string(), day);
        let current = match counts.get(&key) {
            Some(n) => *n,
            None => {
                let (start, end) = ctx.calendar.day_bounds(day);
                let seeded = db::count_open_tasks_between(
                    &ctx.pool,
                    &ctx.tenant_id,
                    subject_id,
                    start,
                    end,
                    ignore_anchor,
                )
                .await?;
                u32::try_from(seeded).unwrap_or(u32::MAX)
            }
        };
        if current >= self.limit {
            counts.insert(key, current);
            return Ok(false);
        }
        counts.insert(key, current + 1);
        Ok(true)
    }

    /// Give back a slot whose insert failed.
    pub async fn release(&self, subject_id: &str, day: NaiveDate) {
        let mut counts = self.counts.lock().await;
        if let Some(n) = counts.get_mut(&(subject_id.to_string(), day)) {
            *n = n.saturating_sub(1);
        }
    }
}

/// A template that passed validation, with its decoded audience filter.
pub struct ValidTemplate<'a> {
    pub template: &'a Template,
    pub audience: Option<AudienceFilter>,
}

enum Outcome {
    Filtered,
    Created,
    Updated,
    Skipped,
}

pub async fn generate(
    ctx: &StrategyContext,
    anchor: Anchor,
    templates: &[ValidTemplate<'_>],
    candidates: &[Candidate],
    stats: &mut AnchorStats,
) {
    let now = ctx.clock.now();
    for vt in templates {
        for candidate in candidates {
            match generate_one(ctx, anchor, vt, candidate, now).await {
                Ok(Outcome::Filtered) => {}
                Ok(Outcome::Created) => stats.tasks_created += 1,
                Ok(Outcome::Updated) => stats.tasks_updated += 1,
                Ok(Outcome::Skipped) => stats.tasks_skipped += 1,
                Err(err) => stats.errors.push(format!(
                    "{} / {}: {err:#}",
                    vt.template.code, candidate.subject.id
                )),
            }
        }
    }
}

async fn generate_one(
    ctx: &StrategyContext,
    anchor: Anchor,
    vt: &ValidTemplate<'_>,
    candidate: &Candidate,
    now: DateTime<Utc>,
) -> Result<Outcome> {
    let template = vt.template;
    let subject = &candidate.subject;
    if let Some(filter) = &vt.audience {
        if !filter.matches(subject) {
            return Ok(Outcome::Filtered);
        }
    }

    let today = ctx.calendar.local_date(now);
    let scheduled_date = compute_scheduled_date(candidate.anchor_date, &template.offset)?;
    if scheduled_date < today {
        debug!(template = %template.code, subject_id = %subject.id, %scheduled_date, "scheduled date already passed");
        return Ok(Outcome::Skipped);
    }
    let scheduled_for = ctx.calendar.at_hour(scheduled_date, ctx.settings.send_hour);
    let (payload, variables_used) = build_payload(ctx, template, candidate, now);

    let occurrence_id = candidate.occurrence.as_ref().map(|occ| occ.id);
    let existing = match occurrence_id {
        // One follow-up per incident, whatever day its reminder lands on.
        Some(occurrence_id) => {
            db::generated_tasks_for_occurrence(
                &ctx.pool,
                &ctx.tenant_id,
                &subject.id,
                &template.code,
                anchor.as_str(),
                occurrence_id,
            )
            .await?
        }
        None => {
            let (day_start, day_end) = ctx.calendar.day_bounds(scheduled_date);
            db::generated_tasks_between(
                &ctx.pool,
                &ctx.tenant_id,
                &subject.id,
                &template.code,
                anchor.as_str(),
                day_start,
                day_end,
            )
            .await?
        }
    };
    // A projected rebuild sees its own anchor's generated rows as gone.
    let open = existing
        .iter()
        .find(|prior| !prior.status.is_terminal() && !(ctx.assume_cleared && prior.regenerable));
    if let Some(prior) = open {
        if !ctx.dry_run {
            db::refresh_task_content(&ctx.pool, prior.id, scheduled_for, &payload, &variables_used, now)
                .await?;
        }
        return Ok(Outcome::Updated);
    }
    if existing.iter().any(|prior| prior.status.is_terminal()) {
        return Ok(Outcome::Skipped);
    }

    let ignore_anchor = ctx.assume_cleared.then(|| anchor.as_str());
    if !ctx.cap.reserve(ctx, &subject.id, scheduled_date, ignore_anchor).await? {
        debug!(subject_id = %subject.id, %scheduled_date, "daily cap reached");
        return Ok(Outcome::Skipped);
    }
    if ctx.dry_run {
        return Ok(Outcome::Created);
    }

    let task = NewTask {
        tenant_id: ctx.tenant_id.clone(),
        subject_id: subject.id.clone(),
        template_code: template.code.clone(),
        anchor: anchor.as_str().to_string(),
        scheduled_for,
        channel: template.channel.clone(),
        status: TaskStatus::Pending,
        payload,
        variables_used,
        classification_tag: template.classification_tag.clone(),
        created_by: ctx.created_by.as_str().to_string(),
        notes: None,
        occurrence_id,
    };
    let meta = json!({
        "anchor": anchor.as_str(),
        "scheduled_date": scheduled_date.to_string(),
        "occurrence_id": occurrence_id,
    });
    if let Err(err) = db::insert_task_with_log(&ctx.pool, &task, ctx.created_by.creation_action(), meta, now).await {
        ctx.cap.release(&subject.id, scheduled_date).await;
        return Err(err);
    }
    Ok(Outcome::Created)
}

fn build_payload(
    ctx: &StrategyContext,
    template: &Template,
    candidate: &Candidate,
    now: DateTime<Utc>,
) -> (Value, Vec<String>) {
    let subject = &candidate.subject;
    let vars = render::build_variables(&RenderContext {
        subject,
        calendar: &ctx.calendar,
        local_now: ctx.calendar.local_datetime(now),
        occurrence: candidate.occurrence.as_ref(),
        app_url: &ctx.settings.app_url,
    });
    let primary = render::render(&template.message_v1, &vars);
    let mut used = primary.used;

    let mut payload = json!({
        "message": primary.text,
        "student_name": subject.name,
        "student_email": subject.email,
        "student_phone": subject.phone,
        "anchor_date": candidate.anchor_date.to_string(),
        "template_title": template.title,
    });
    if let Some(alt_body) = template.message_v2.as_deref().filter(|b| !b.trim().is_empty()) {
        let alt = render::render(alt_body, &vars);
        for token in alt.used {
            if !used.contains(&token) {
                used.push(token);
            }
        }
        payload["message_alt"] = Value::String(alt.text);
    }
    if let Some(occ) = &candidate.occurrence {
        payload["occurrence"] = json!({
            "id": occ.id,
            "type": occ.kind,
            "description": occ.description,
            "created_at": occ.created_at,
        });
    }
    (payload, used)
}
