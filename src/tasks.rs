//! Task read/write surface: filtered queries, manual creation, status
//! transitions with undo, and time-driven promotion.
use crate::api::RequestContext;
use crate::clock::LocalCalendar;
use crate::db::{self, LogEntry, NewTask, SortDir, SortKey, TaskFilter};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::model::{Anchor, Task, TaskStatus};
use crate::render::{self, RenderContext};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{info, instrument};

/// Query parameters as received from a caller; echoed back in the response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskQuery {
    pub status: Option<String>,
    pub anchor: Option<String>,
    pub template_code: Option<String>,
    pub channel: Option<String>,
    pub subject_id: Option<String>,
    pub classification_tag: Option<String>,
    /// RFC 3339 instant or `YYYY-MM-DD` (tenant-local day). Both ends of a
    /// range are inclusive.
    pub scheduled_from: Option<String>,
    pub scheduled_to: Option<String>,
    pub created_from: Option<String>,
    pub created_to: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub sort_by: Option<String>,
    pub sort_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total: i64,
    pub total_pages: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Breakdown {
    pub by_status: BTreeMap<String, i64>,
    pub by_anchor: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Performance {
    pub query_time_ms: u64,
    pub total_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub pagination: Pagination,
    pub filters: TaskQuery,
    pub breakdown: Breakdown,
    pub performance: Performance,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Parse a range bound into the half-open form the store filters with. A bare
/// date covers the whole local day, so an upper bound of `2026-03-10` ends at
/// the following local midnight. An explicit upper instant is inclusive;
/// stored timestamps have millisecond precision, so one millisecond past it
/// is the exclusive end.
fn parse_bound(
    raw: &Option<String>,
    field: &str,
    calendar: &LocalCalendar,
    upper: bool,
) -> EngineResult<Option<DateTime<Utc>>> {
    let Some(raw) = non_empty(raw) else {
        return Ok(None);
    };
    if let Ok(instant) = DateTime::parse_from_rfc3339(&raw) {
        let instant = instant.with_timezone(&Utc);
        return Ok(Some(if upper { instant + Duration::milliseconds(1) } else { instant }));
    }
    let date = NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|_| EngineError::Validation(format!("{field}: '{raw}' is not a date or timestamp")))?;
    let (start, end) = calendar.day_bounds(date);
    Ok(Some(if upper { end } else { start }))
}

fn build_filter(engine: &Engine, tenant_id: &str, q: &TaskQuery) -> EngineResult<TaskFilter> {
    let status = match non_empty(&q.status) {
        Some(raw) => Some(
            TaskStatus::parse(&raw)
                .ok_or_else(|| EngineError::Validation(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };
    let anchor = non_empty(&q.anchor);
    if let Some(code) = &anchor {
        if Anchor::parse(code).is_none() {
            return Err(EngineError::Validation(format!("unsupported anchor '{code}'")));
        }
    }
    let cal = &engine.calendar;
    Ok(TaskFilter {
        tenant_id: tenant_id.to_string(),
        status,
        anchor,
        template_code: non_empty(&q.template_code),
        channel: non_empty(&q.channel),
        subject_id: non_empty(&q.subject_id),
        classification_tag: non_empty(&q.classification_tag),
        scheduled_from: parse_bound(&q.scheduled_from, "scheduled_from", cal, false)?,
        scheduled_to: parse_bound(&q.scheduled_to, "scheduled_to", cal, true)?,
        created_from: parse_bound(&q.created_from, "created_from", cal, false)?,
        created_to: parse_bound(&q.created_to, "created_to", cal, true)?,
    })
}

#[instrument(skip_all, fields(tenant_id = %ctx.tenant_id))]
pub async fn query_tasks(engine: &Engine, ctx: &RequestContext, q: &TaskQuery) -> EngineResult<TaskPage> {
    let total_timer = Instant::now();
    let filter = build_filter(engine, &ctx.tenant_id, q)?;
    let sort = match non_empty(&q.sort_by) {
        Some(raw) => SortKey::parse(&raw)
            .ok_or_else(|| EngineError::Validation(format!("cannot sort by '{raw}'")))?,
        None => SortKey::default(),
    };
    let dir = match non_empty(&q.sort_dir).as_deref() {
        None | Some("asc") => SortDir::Asc,
        Some("desc") => SortDir::Desc,
        Some(other) => return Err(EngineError::Validation(format!("bad sort direction '{other}'"))),
    };
    let page = q.page.unwrap_or(1).max(1);
    let page_size = q
        .page_size
        .unwrap_or(20)
        .clamp(1, engine.settings.max_page_size.max(1));
    let offset = i64::from(page - 1) * i64::from(page_size);

    let query_timer = Instant::now();
    let rows = db::query_tasks(&engine.pool, &filter, sort, dir, i64::from(page_size), offset).await?;
    let query_time_ms = query_timer.elapsed().as_millis() as u64;

    let total_pages = (rows.total + i64::from(page_size) - 1) / i64::from(page_size);
    Ok(TaskPage {
        tasks: rows.tasks,
        pagination: Pagination {
            page,
            page_size,
            total: rows.total,
            total_pages,
        },
        filters: q.clone(),
        breakdown: Breakdown {
            by_status: rows.by_status,
            by_anchor: rows.by_anchor,
        },
        performance: Performance {
            query_time_ms,
            total_time_ms: total_timer.elapsed().as_millis() as u64,
        },
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualTaskRequest {
    pub subject_id: String,
    pub template_code: String,
    pub anchor: String,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub channel: Option<String>,
    pub status: Option<String>,
    pub payload: Option<Value>,
    pub variables_used: Option<Vec<String>>,
    pub created_by: Option<String>,
    pub notes: Option<String>,
}

/// Insert one task on behalf of a user, denormalising the subject's contact
/// fields into the payload.
#[instrument(skip_all, fields(tenant_id = %ctx.tenant_id))]
pub async fn create_manual_task(
    engine: &Engine,
    ctx: &RequestContext,
    req: &ManualTaskRequest,
) -> EngineResult<Task> {
    ctx.require_write()?;
    for (field, value) in [
        ("subject_id", &req.subject_id),
        ("template_code", &req.template_code),
        ("anchor", &req.anchor),
    ] {
        if value.trim().is_empty() {
            return Err(EngineError::Validation(format!("{field} is required")));
        }
    }
    let scheduled_for = req
        .scheduled_for
        .ok_or_else(|| EngineError::Validation("scheduled_for is required".into()))?;
    let anchor = Anchor::parse(&req.anchor)
        .ok_or_else(|| EngineError::Validation(format!("unsupported anchor '{}'", req.anchor)))?;
    let status = match req.status.as_deref() {
        Some(raw) => TaskStatus::parse(raw)
            .ok_or_else(|| EngineError::Validation(format!("unknown status '{raw}'")))?,
        None => TaskStatus::Pending,
    };

    let subject = db::get_subject(&engine.pool, &ctx.tenant_id, req.subject_id.trim())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("subject {}", req.subject_id)))?;
    let template = db::get_template(&engine.pool, &ctx.tenant_id, req.template_code.trim()).await?;

    let mut payload = match &req.payload {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) | None => Map::new(),
        Some(_) => return Err(EngineError::Validation("payload must be an object".into())),
    };
    let mut variables_used = req.variables_used.clone().unwrap_or_default();
    if !payload.contains_key("message") {
        if let Some(template) = &template {
            let vars = render::build_variables(&RenderContext {
                subject: &subject,
                calendar: &engine.calendar,
                local_now: engine.calendar.local_datetime(engine.clock.now()),
                occurrence: None,
                app_url: &engine.app_url,
            });
            let rendered = render::render(&template.message_v1, &vars);
            payload.insert("message".into(), Value::String(rendered.text));
            if variables_used.is_empty() {
                variables_used = rendered.used;
            }
        }
    }
    payload.insert("student_name".into(), json!(subject.name));
    payload.insert("student_email".into(), json!(subject.email));
    payload.insert("student_phone".into(), json!(subject.phone));

    let channel = non_empty(&req.channel)
        .or_else(|| template.as_ref().map(|t| t.channel.clone()))
        .unwrap_or_else(|| engine.settings.default_channel.clone());
    let created_by = non_empty(&req.created_by).unwrap_or_else(|| ctx.user_id.clone());

    let task = NewTask {
        tenant_id: ctx.tenant_id.clone(),
        subject_id: subject.id.clone(),
        template_code: req.template_code.trim().to_string(),
        anchor: anchor.as_str().to_string(),
        scheduled_for,
        channel,
        status,
        payload: Value::Object(payload),
        variables_used,
        classification_tag: template.as_ref().and_then(|t| t.classification_tag.clone()),
        created_by,
        notes: req.notes.clone(),
        occurrence_id: None,
    };
    let now = engine.clock.now();
    let id = db::insert_task_with_log(&engine.pool, &task, "created", json!({ "source": "manual" }), now).await?;
    info!(task_id = id, subject_id = %task.subject_id, "manual task created");
    db::get_task(&engine.pool, &ctx.tenant_id, id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("task {id}")))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusUpdate {
    pub status: String,
    pub notes: Option<String>,
    /// Required when snoozing.
    pub snooze_until: Option<DateTime<Utc>>,
}

fn audit_action(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "reactivated",
        other => other.as_str(),
    }
}

#[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, task_id = task_id))]
pub async fn update_task_status(
    engine: &Engine,
    ctx: &RequestContext,
    task_id: i64,
    update: &StatusUpdate,
) -> EngineResult<Task> {
    ctx.require_write()?;
    let next = TaskStatus::parse(&update.status)
        .ok_or_else(|| EngineError::Validation(format!("unknown status '{}'", update.status)))?;
    let task = db::get_task(&engine.pool, &ctx.tenant_id, task_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))?;
    if !task.status.can_transition_to(next) {
        return Err(EngineError::Validation(format!(
            "cannot move task {task_id} from {} to {next}",
            task.status
        )));
    }

    let now = engine.clock.now();
    let scheduled_for = if next == TaskStatus::Snoozed {
        let until = update
            .snooze_until
            .ok_or_else(|| EngineError::Validation("snooze_until is required when snoozing".into()))?;
        if until <= now {
            return Err(EngineError::Validation("snooze_until must be in the future".into()));
        }
        until
    } else {
        task.scheduled_for
    };
    let sent_at = (next == TaskStatus::Sent).then_some(now);

    let log = LogEntry {
        tenant_id: task.tenant_id.clone(),
        subject_id: task.subject_id.clone(),
        task_id: Some(task.id),
        action: audit_action(next).to_string(),
        channel: Some(task.channel.clone()),
        template_code: Some(task.template_code.clone()),
        meta: json!({
            "from": task.status.as_str(),
            "to": next.as_str(),
            "scheduled_for": db::ts(task.scheduled_for),
            "by": ctx.user_id,
        }),
    };
    db::apply_status_change(
        &engine.pool,
        &task,
        next,
        scheduled_for,
        update.notes.as_deref(),
        sent_at,
        &log,
        now,
    )
    .await?;
    info!(from = %task.status, to = %next, "task status changed");
    db::get_task(&engine.pool, &ctx.tenant_id, task_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))
}

fn meta_str<'a>(meta: &'a Value, key: &str) -> Option<&'a str> {
    meta.get(key).and_then(Value::as_str)
}

/// Revert the latest status change of a task, restoring its previous status
/// and `scheduled_for`. Only allowed within the configured undo window.
#[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, task_id = task_id))]
pub async fn undo_status_change(engine: &Engine, ctx: &RequestContext, task_id: i64) -> EngineResult<Task> {
    ctx.require_write()?;
    let task = db::get_task(&engine.pool, &ctx.tenant_id, task_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))?;
    let last = db::last_task_log(&engine.pool, &ctx.tenant_id, task_id)
        .await?
        .ok_or_else(|| EngineError::Validation(format!("task {task_id} has no history")))?;

    // The change must still describe the task as it is now.
    let previous = meta_str(&last.meta, "from")
        .and_then(TaskStatus::parse)
        .filter(|_| meta_str(&last.meta, "to") == Some(task.status.as_str()))
        .ok_or_else(|| {
            EngineError::Validation(format!("task {task_id}: '{}' cannot be undone", last.action))
        })?;

    let now = engine.clock.now();
    let elapsed = (now - last.created_at).num_seconds();
    let window = engine.settings.undo_window_seconds;
    if elapsed > window {
        return Err(EngineError::Validation(format!(
            "undo window of {window}s has passed ({elapsed}s ago)"
        )));
    }
    let scheduled_for = meta_str(&last.meta, "scheduled_for")
        .and_then(|raw| db::parse_ts(raw).ok())
        .unwrap_or(task.scheduled_for);

    let log = LogEntry {
        tenant_id: task.tenant_id.clone(),
        subject_id: task.subject_id.clone(),
        task_id: Some(task.id),
        action: "undo".into(),
        channel: Some(task.channel.clone()),
        template_code: Some(task.template_code.clone()),
        meta: json!({
            "undone_status": task.status.as_str(),
            "restored_status": previous.as_str(),
            "undone_scheduled_for": db::ts(task.scheduled_for),
            "restored_scheduled_for": db::ts(scheduled_for),
            "elapsed_seconds": elapsed,
            "by": ctx.user_id,
        }),
    };
    db::restore_status(&engine.pool, &task, previous, scheduled_for, &log, now).await?;
    info!(from = %task.status, to = %previous, "status change undone");
    db::get_task(&engine.pool, &ctx.tenant_id, task_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PromoteOutcome {
    pub reactivated: u64,
    pub promoted: u64,
}

/// Move pending tasks scheduled up to the end of today to `due_today`, first
/// returning snoozed tasks whose new date has arrived to `pending`. Days a
/// run was missed are caught up.
#[instrument(skip_all, fields(tenant_id = %tenant_id))]
pub async fn promote_due_tasks(engine: &Engine, tenant_id: &str) -> EngineResult<PromoteOutcome> {
    let now = engine.clock.now();
    let (_, end_of_today) = engine.calendar.day_bounds(engine.calendar.local_date(now));
    let (reactivated, promoted) = db::promote_due(&engine.pool, tenant_id, end_of_today, now).await?;
    if reactivated + promoted > 0 {
        info!(reactivated, promoted, "due tasks promoted");
    }
    Ok(PromoteOutcome {
        reactivated,
        promoted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_bounds_cover_local_day() {
        let cal = LocalCalendar::from_offset_minutes(-180);
        let lower = parse_bound(&Some("2026-03-10".into()), "f", &cal, false).unwrap().unwrap();
        let upper = parse_bound(&Some("2026-03-10".into()), "f", &cal, true).unwrap().unwrap();
        assert_eq!(lower.to_rfc3339(), "2026-03-10T03:00:00+00:00");
        assert_eq!(upper.to_rfc3339(), "2026-03-11T03:00:00+00:00");

        let exact = parse_bound(&Some("2026-03-10T12:00:00Z".into()), "f", &cal, false).unwrap().unwrap();
        assert_eq!(exact.to_rfc3339(), "2026-03-10T12:00:00+00:00");
        let exact_upper = parse_bound(&Some("2026-03-10T12:00:00Z".into()), "f", &cal, true).unwrap().unwrap();
        assert_eq!(exact_upper.to_rfc3339(), "2026-03-10T12:00:00.001+00:00");

        assert!(parse_bound(&Some("yesterday".into()), "f", &cal, false).is_err());
        assert!(parse_bound(&Some("  ".into()), "f", &cal, false).unwrap().is_none());
    }

    #[test]
    fn pending_reentry_is_audited_as_reactivation() {
        assert_eq!(audit_action(TaskStatus::Pending), "reactivated");
        assert_eq!(audit_action(TaskStatus::Snoozed), "snoozed");
        assert_eq!(audit_action(TaskStatus::Sent), "sent");
    }
}
