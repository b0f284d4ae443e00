use super::model::{LogEntry, LoggedAction, NewTask, PriorTask, NewTemplate, SortDir, SortKey, TaskFilter, TaskPageRows, TaskSlice};
use crate::model::{Occurrence, Subject, Task, TaskStatus, Template};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Fixed-width UTC text so range predicates compare lexicographically.
pub fn ts(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp '{raw}'"))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn string_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn json_text(value: &impl serde::Serialize) -> Result<String> {
    serde_json::to_string(value).context("serialize json column")
}

// ---------------------------------------------------------------------------
// subjects & occurrences (read-only to the engine; writes exist for seeding)

fn subject_from_row(row: &SqliteRow) -> Result<Subject> {
    Ok(Subject {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        status: row.try_get("status")?,
        tags: string_list(&row.try_get::<String, _>("tags")?),
        plan_name: row.try_get("plan_name")?,
        trainer_id: row.try_get("trainer_id")?,
        trainer_name: row.try_get("trainer_name")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        first_workout_date: row.try_get::<Option<NaiveDate>, _>("first_workout_date")?,
        last_workout_date: row.try_get::<Option<NaiveDate>, _>("last_workout_date")?,
        birth_date: row.try_get::<Option<NaiveDate>, _>("birth_date")?,
        next_renewal_date: row.try_get::<Option<NaiveDate>, _>("next_renewal_date")?,
    })
}

#[instrument(skip_all)]
pub async fn insert_subject(pool: &Pool, subject: &Subject) -> Result<()> {
    sqlx::query(
        "INSERT INTO subjects (id, tenant_id, name, email, phone, status, tags, plan_name, \
         trainer_id, trainer_name, created_at, first_workout_date, last_workout_date, \
         birth_date, next_renewal_date) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&subject.id)
    .bind(&subject.tenant_id)
    .bind(&subject.name)
    .bind(&subject.email)
    .bind(&subject.phone)
    .bind(&subject.status)
    .bind(json_text(&subject.tags)?)
    .bind(&subject.plan_name)
    .bind(&subject.trainer_id)
    .bind(&subject.trainer_name)
    .bind(ts(subject.created_at))
    .bind(subject.first_workout_date)
    .bind(subject.last_workout_date)
    .bind(subject.birth_date)
    .bind(subject.next_renewal_date)
    .execute(pool)
    .await
    .with_context(|| format!("insert subject {}", subject.id))?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_subject(pool: &Pool, tenant_id: &str, subject_id: &str) -> Result<Option<Subject>> {
    let row = sqlx::query("SELECT * FROM subjects WHERE tenant_id = ? AND id = ?")
        .bind(tenant_id)
        .bind(subject_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(subject_from_row).transpose()
}

/// Subjects of a tenant, optionally restricted to one status.
#[instrument(skip_all)]
pub async fn list_subjects(pool: &Pool, tenant_id: &str, status: Option<&str>) -> Result<Vec<Subject>> {
    let rows = match status {
        Some(status) => {
            sqlx::query("SELECT * FROM subjects WHERE tenant_id = ? AND status = ? ORDER BY id")
                .bind(tenant_id)
                .bind(status)
                .fetch_all(pool)
                .await?
        }
        None => {
            sqlx::query("SELECT * FROM subjects WHERE tenant_id = ? ORDER BY id")
                .bind(tenant_id)
                .fetch_all(pool)
                .await?
        }
    };
    rows.iter().map(subject_from_row).collect()
}

#[instrument(skip_all)]
pub async fn insert_occurrence(
    pool: &Pool,
    tenant_id: &str,
    subject_id: &str,
    kind: &str,
    description: Option<&str>,
    reminder_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<i64> {
    let row = sqlx::query(
        "INSERT INTO occurrences (tenant_id, subject_id, kind, description, reminder_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(tenant_id)
    .bind(subject_id)
    .bind(kind)
    .bind(description)
    .bind(reminder_at.map(ts))
    .bind(ts(now))
    .fetch_one(pool)
    .await
    .context("insert occurrence")?;
    Ok(row.get::<i64, _>("id"))
}

fn occurrence_from_row(row: &SqliteRow) -> Result<Occurrence> {
    Ok(Occurrence {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        subject_id: row.try_get("subject_id")?,
        kind: row.try_get("kind")?,
        description: row.try_get("description")?,
        reminder_at: parse_opt_ts(row.try_get("reminder_at")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

/// Occurrences whose reminder falls in `[start, end)`.
#[instrument(skip_all)]
pub async fn occurrences_due_between(
    pool: &Pool,
    tenant_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Occurrence>> {
    let rows = sqlx::query(
        "SELECT * FROM occurrences WHERE tenant_id = ? AND reminder_at >= ? AND reminder_at < ? \
         ORDER BY reminder_at, id",
    )
    .bind(tenant_id)
    .bind(ts(start))
    .bind(ts(end))
    .fetch_all(pool)
    .await?;
    rows.iter().map(occurrence_from_row).collect()
}

#[instrument(skip_all)]
pub async fn get_occurrence(pool: &Pool, tenant_id: &str, occurrence_id: i64) -> Result<Option<Occurrence>> {
    let row = sqlx::query("SELECT * FROM occurrences WHERE tenant_id = ? AND id = ?")
        .bind(tenant_id)
        .bind(occurrence_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(occurrence_from_row).transpose()
}

// ---------------------------------------------------------------------------
// templates

fn template_from_row(row: &SqliteRow) -> Result<Template> {
    // A filter that is not valid JSON is kept as a string so it fails to
    // resolve later instead of failing the whole read.
    let audience_filter = row
        .try_get::<Option<String>, _>("audience_filter")?
        .map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw)));
    Ok(Template {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        code: row.try_get("code")?,
        title: row.try_get("title")?,
        anchor: row.try_get("anchor")?,
        channel: row.try_get("channel")?,
        offset: row.try_get("schedule_offset")?,
        message_v1: row.try_get("message_v1")?,
        message_v2: row.try_get("message_v2")?,
        audience_filter,
        variables: string_list(&row.try_get::<String, _>("variables")?),
        classification_tag: row.try_get("classification_tag")?,
        active: row.try_get::<i64, _>("active")? != 0,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

/// Insert a template unless its code already exists for the tenant.
/// Returns the new id, or `None` when skipped.
#[instrument(skip_all)]
pub async fn insert_template_if_absent(
    pool: &Pool,
    template: &NewTemplate,
    now: DateTime<Utc>,
) -> Result<Option<i64>> {
    let audience = template.audience_filter.as_ref().map(|v| json_text(v)).transpose()?;
    let row = sqlx::query(
        "INSERT INTO templates (tenant_id, code, title, anchor, channel, schedule_offset, \
         message_v1, message_v2, audience_filter, variables, classification_tag, active, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (tenant_id, code) DO NOTHING RETURNING id",
    )
    .bind(&template.tenant_id)
    .bind(&template.code)
    .bind(&template.title)
    .bind(&template.anchor)
    .bind(&template.channel)
    .bind(&template.offset)
    .bind(&template.message_v1)
    .bind(&template.message_v2)
    .bind(audience)
    .bind(json_text(&template.variables)?)
    .bind(&template.classification_tag)
    .bind(template.active)
    .bind(ts(now))
    .fetch_optional(pool)
    .await
    .with_context(|| format!("insert template {}", template.code))?;
    Ok(row.map(|r| r.get::<i64, _>("id")))
}

/// Raw filter text write, for catalog edits that bypass JSON encoding.
#[instrument(skip_all)]
pub async fn set_template_audience_raw(
    pool: &Pool,
    tenant_id: &str,
    code: &str,
    raw: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE templates SET audience_filter = ? WHERE tenant_id = ? AND code = ?")
        .bind(raw)
        .bind(tenant_id)
        .bind(code)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_template_active(pool: &Pool, tenant_id: &str, code: &str, active: bool) -> Result<()> {
    sqlx::query("UPDATE templates SET active = ? WHERE tenant_id = ? AND code = ?")
        .bind(active)
        .bind(tenant_id)
        .bind(code)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_active_templates(pool: &Pool, tenant_id: &str) -> Result<Vec<Template>> {
    let rows = sqlx::query(
        "SELECT * FROM templates WHERE tenant_id = ? AND active = 1 ORDER BY created_at, id",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(template_from_row).collect()
}

#[instrument(skip_all)]
pub async fn get_template(pool: &Pool, tenant_id: &str, code: &str) -> Result<Option<Template>> {
    let row = sqlx::query("SELECT * FROM templates WHERE tenant_id = ? AND code = ?")
        .bind(tenant_id)
        .bind(code)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(template_from_row).transpose()
}

// ---------------------------------------------------------------------------
// tasks

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("payload")?;
    Ok(Task {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        subject_id: row.try_get("subject_id")?,
        template_code: row.try_get("template_code")?,
        anchor: row.try_get("anchor")?,
        scheduled_for: parse_ts(&row.try_get::<String, _>("scheduled_for")?)?,
        channel: row.try_get("channel")?,
        status: TaskStatus::parse(&status).ok_or_else(|| anyhow!("unknown task status '{status}'"))?,
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        variables_used: string_list(&row.try_get::<String, _>("variables_used")?),
        classification_tag: row.try_get("classification_tag")?,
        created_by: row.try_get("created_by")?,
        notes: row.try_get("notes")?,
        occurrence_id: row.try_get("occurrence_id")?,
        sent_at: parse_opt_ts(row.try_get("sent_at")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

async fn insert_log(conn: &mut SqliteConnection, entry: &LogEntry, now: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_logs (tenant_id, subject_id, task_id, action, channel, template_code, meta, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.tenant_id)
    .bind(&entry.subject_id)
    .bind(entry.task_id)
    .bind(&entry.action)
    .bind(&entry.channel)
    .bind(&entry.template_code)
    .bind(json_text(&entry.meta)?)
    .bind(ts(now))
    .execute(conn)
    .await
    .with_context(|| format!("insert task log '{}'", entry.action))?;
    Ok(())
}

/// Insert a task and its audit row atomically. Returns the task id.
#[instrument(skip_all)]
pub async fn insert_task_with_log(
    pool: &Pool,
    task: &NewTask,
    action: &str,
    meta: Value,
    now: DateTime<Utc>,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query(
        "INSERT INTO tasks (tenant_id, subject_id, template_code, anchor, scheduled_for, channel, \
         status, payload, variables_used, classification_tag, created_by, notes, occurrence_id, \
         created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&task.tenant_id)
    .bind(&task.subject_id)
    .bind(&task.template_code)
    .bind(&task.anchor)
    .bind(ts(task.scheduled_for))
    .bind(&task.channel)
    .bind(task.status.as_str())
    .bind(json_text(&task.payload)?)
    .bind(json_text(&task.variables_used)?)
    .bind(&task.classification_tag)
    .bind(&task.created_by)
    .bind(&task.notes)
    .bind(task.occurrence_id)
    .bind(ts(now))
    .bind(ts(now))
    .fetch_one(&mut *tx)
    .await
    .context("insert task")?;
    let id = row.get::<i64, _>("id");

    let entry = LogEntry {
        tenant_id: task.tenant_id.clone(),
        subject_id: task.subject_id.clone(),
        task_id: Some(id),
        action: action.to_string(),
        channel: Some(task.channel.clone()),
        template_code: Some(task.template_code.clone()),
        meta,
    };
    insert_log(&mut *tx, &entry, now).await?;
    tx.commit().await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn get_task(pool: &Pool, tenant_id: &str, task_id: i64) -> Result<Option<Task>> {
    let row = sqlx::query("SELECT * FROM tasks WHERE tenant_id = ? AND id = ?")
        .bind(tenant_id)
        .bind(task_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(task_from_row).transpose()
}

/// Tasks previously generated for the same subject/template/anchor with
/// `scheduled_for` in `[start, end)`, newest first.
#[instrument(skip_all)]
pub async fn generated_tasks_between(
    pool: &Pool,
    tenant_id: &str,
    subject_id: &str,
    template_code: &str,
    anchor: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<PriorTask>> {
    let sql = format!(
        "SELECT id, status, {GENERATED_BY} AS regenerable FROM tasks WHERE tenant_id = ? \
         AND subject_id = ? AND template_code = ? AND anchor = ? \
         AND scheduled_for >= ? AND scheduled_for < ? ORDER BY id DESC"
    );
    let rows = sqlx::query(&sql)
    .bind(tenant_id)
    .bind(subject_id)
    .bind(template_code)
    .bind(anchor)
    .bind(ts(start))
    .bind(ts(end))
    .fetch_all(pool)
    .await?;
    rows.iter().map(prior_task).collect()
}

/// Tasks previously generated for one incident by the same template,
/// regardless of day, newest first.
#[instrument(skip_all)]
pub async fn generated_tasks_for_occurrence(
    pool: &Pool,
    tenant_id: &str,
    subject_id: &str,
    template_code: &str,
    anchor: &str,
    occurrence_id: i64,
) -> Result<Vec<PriorTask>> {
    let sql = format!(
        "SELECT id, status, {GENERATED_BY} AS regenerable FROM tasks WHERE tenant_id = ? \
         AND subject_id = ? AND template_code = ? AND anchor = ? AND occurrence_id = ? \
         ORDER BY id DESC"
    );
    let rows = sqlx::query(&sql)
    .bind(tenant_id)
    .bind(subject_id)
    .bind(template_code)
    .bind(anchor)
    .bind(occurrence_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(prior_task).collect()
}

fn prior_task(row: &SqliteRow) -> Result<PriorTask> {
    let status: String = row.try_get("status")?;
    let status = TaskStatus::parse(&status).ok_or_else(|| anyhow!("unknown task status '{status}'"))?;
    Ok(PriorTask {
        id: row.try_get("id")?,
        status,
        regenerable: row.try_get::<i64, _>("regenerable")? != 0,
    })
}

/// Re-render an existing open task in place.
#[instrument(skip_all)]
pub async fn refresh_task_content(
    pool: &Pool,
    task_id: i64,
    scheduled_for: DateTime<Utc>,
    payload: &Value,
    variables_used: &[String],
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET scheduled_for = ?, payload = ?, variables_used = ?, updated_at = ? \
         WHERE id = ? AND status IN ('pending', 'due_today', 'snoozed')",
    )
    .bind(ts(scheduled_for))
    .bind(json_text(payload)?)
    .bind(json_text(&variables_used)?)
    .bind(ts(now))
    .bind(task_id)
    .execute(pool)
    .await
    .with_context(|| format!("refresh task {task_id}"))?;
    Ok(())
}

const OPEN: &str = "status IN ('pending', 'due_today', 'snoozed')";

/// Writers whose open rows a rebuild may delete and regenerate: the job and
/// a previous rebuild. Must match [`crate::model::CreatedBy::as_str`].
const GENERATED_BY: &str = "created_by IN ('job', 'manual_recalculate')";

/// Non-terminal tasks of a subject scheduled in `[start, end)`, optionally
/// ignoring the regenerable tasks of one anchor (used when projecting a
/// rebuild of that anchor).
#[instrument(skip_all)]
pub async fn count_open_tasks_between(
    pool: &Pool,
    tenant_id: &str,
    subject_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    ignore_anchor: Option<&str>,
) -> Result<i64> {
    let sql = format!(
        "SELECT COUNT(*) FROM tasks WHERE tenant_id = ? AND subject_id = ? \
         AND scheduled_for >= ? AND scheduled_for < ? \
         AND {OPEN} AND NOT (? IS NOT NULL AND anchor = ? AND {GENERATED_BY})"
    );
    let n = sqlx::query_scalar::<_, i64>(&sql)
        .bind(tenant_id)
        .bind(subject_id)
        .bind(ts(start))
        .bind(ts(end))
        .bind(ignore_anchor)
        .bind(ignore_anchor)
        .fetch_one(pool)
        .await?;
    Ok(n)
}

#[instrument(skip_all)]
pub async fn count_regenerable_tasks(pool: &Pool, tenant_id: &str, anchor: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM tasks WHERE tenant_id = ? AND anchor = ? AND {OPEN} AND {GENERATED_BY}");
    let n = sqlx::query_scalar::<_, i64>(&sql)
        .bind(tenant_id)
        .bind(anchor)
        .fetch_one(pool)
        .await?;
    Ok(n)
}

/// Delete the regenerable tasks of one anchor. Terminal rows and tasks a
/// user or an event trigger created are never touched.
#[instrument(skip_all)]
pub async fn delete_regenerable_tasks(pool: &Pool, tenant_id: &str, anchor: &str) -> Result<u64> {
    let sql = format!("DELETE FROM tasks WHERE tenant_id = ? AND anchor = ? AND {OPEN} AND {GENERATED_BY}");
    let res = sqlx::query(&sql)
        .bind(tenant_id)
        .bind(anchor)
        .execute(pool)
        .await
        .with_context(|| format!("delete open tasks for {anchor}"))?;
    Ok(res.rows_affected())
}

/// Persist a status change together with its audit row.
#[instrument(skip_all)]
pub async fn apply_status_change(
    pool: &Pool,
    task: &Task,
    status: TaskStatus,
    scheduled_for: DateTime<Utc>,
    notes: Option<&str>,
    sent_at: Option<DateTime<Utc>>,
    log: &LogEntry,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE tasks SET status = ?, scheduled_for = ?, notes = COALESCE(?, notes), \
         sent_at = COALESCE(?, sent_at), updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(status.as_str())
    .bind(ts(scheduled_for))
    .bind(notes)
    .bind(sent_at.map(ts))
    .bind(ts(now))
    .bind(task.id)
    .bind(task.status.as_str())
    .execute(&mut *tx)
    .await
    .with_context(|| format!("update task {}", task.id))?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("task {} changed concurrently", task.id));
    }
    insert_log(&mut *tx, log, now).await?;
    tx.commit().await?;
    Ok(())
}

/// Most recent audit row of a task.
#[instrument(skip_all)]
pub async fn last_task_log(pool: &Pool, tenant_id: &str, task_id: i64) -> Result<Option<LoggedAction>> {
    let row = sqlx::query(
        "SELECT action, meta, created_at FROM task_logs WHERE tenant_id = ? AND task_id = ? \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(tenant_id)
    .bind(task_id)
    .fetch_optional(pool)
    .await?;
    row.map(|row| {
        Ok(LoggedAction {
            action: row.try_get("action")?,
            meta: serde_json::from_str(&row.try_get::<String, _>("meta")?).unwrap_or(Value::Null),
            created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        })
    })
    .transpose()
}

/// Put a task back into an earlier open state, clearing `sent_at`.
#[instrument(skip_all)]
pub async fn restore_status(
    pool: &Pool,
    task: &Task,
    status: TaskStatus,
    scheduled_for: DateTime<Utc>,
    log: &LogEntry,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE tasks SET status = ?, scheduled_for = ?, sent_at = NULL, updated_at = ? \
         WHERE id = ? AND status = ?",
    )
    .bind(status.as_str())
    .bind(ts(scheduled_for))
    .bind(ts(now))
    .bind(task.id)
    .bind(task.status.as_str())
    .execute(&mut *tx)
    .await
    .with_context(|| format!("restore task {}", task.id))?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("task {} changed concurrently", task.id));
    }
    insert_log(&mut *tx, log, now).await?;
    tx.commit().await?;
    Ok(())
}

/// Snoozed tasks whose new date has arrived re-enter `pending`; pending tasks
/// scheduled before `end` (today or any missed day) become `due_today`.
/// Returns (reactivated, promoted).
#[instrument(skip_all)]
pub async fn promote_due(pool: &Pool, tenant_id: &str, end: DateTime<Utc>, now: DateTime<Utc>) -> Result<(u64, u64)> {
    let mut tx = pool.begin().await?;
    let reactivated = sqlx::query(
        "UPDATE tasks SET status = 'pending', updated_at = ? \
         WHERE tenant_id = ? AND status = 'snoozed' AND scheduled_for < ?",
    )
    .bind(ts(now))
    .bind(tenant_id)
    .bind(ts(end))
    .execute(&mut *tx)
    .await?
    .rows_affected();
    let promoted = sqlx::query(
        "UPDATE tasks SET status = 'due_today', updated_at = ? \
         WHERE tenant_id = ? AND status = 'pending' AND scheduled_for < ?",
    )
    .bind(ts(now))
    .bind(tenant_id)
    .bind(ts(end))
    .execute(&mut *tx)
    .await?
    .rows_affected();
    tx.commit().await?;
    Ok((reactivated, promoted))
}

fn push_task_filters<'a>(qb: &mut QueryBuilder<'a, Sqlite>, f: &'a TaskFilter) {
    qb.push(" WHERE tenant_id = ").push_bind(f.tenant_id.as_str());
    if let Some(status) = f.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    let text_filters = [
        ("anchor", &f.anchor),
        ("template_code", &f.template_code),
        ("channel", &f.channel),
        ("subject_id", &f.subject_id),
        ("classification_tag", &f.classification_tag),
    ];
    for (column, value) in text_filters {
        if let Some(value) = value {
            qb.push(format!(" AND {column} = ")).push_bind(value.as_str());
        }
    }
    let ranges = [
        ("scheduled_for", ">=", f.scheduled_from),
        ("scheduled_for", "<", f.scheduled_to),
        ("created_at", ">=", f.created_from),
        ("created_at", "<", f.created_to),
    ];
    for (column, op, value) in ranges {
        if let Some(value) = value {
            qb.push(format!(" AND {column} {op} ")).push_bind(ts(value));
        }
    }
}

async fn grouped_counts(pool: &Pool, filter: &TaskFilter, column: &str) -> Result<BTreeMap<String, i64>> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {column} AS k, COUNT(*) AS n FROM tasks"));
    push_task_filters(&mut qb, filter);
    qb.push(format!(" GROUP BY {column}"));
    let rows = qb.build().fetch_all(pool).await?;
    let mut out = BTreeMap::new();
    for row in rows {
        out.insert(row.try_get::<String, _>("k")?, row.try_get::<i64, _>("n")?);
    }
    Ok(out)
}

/// One page of tasks plus total count and status/anchor breakdowns of the
/// full filtered set.
#[instrument(skip_all)]
pub async fn query_tasks(
    pool: &Pool,
    filter: &TaskFilter,
    sort: SortKey,
    dir: SortDir,
    limit: i64,
    offset: i64,
) -> Result<TaskPageRows> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM tasks");
    push_task_filters(&mut qb, filter);
    let total = qb.build_query_scalar::<i64>().fetch_one(pool).await?;

    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM tasks");
    push_task_filters(&mut qb, filter);
    qb.push(format!(" ORDER BY {} {}, id {}", sort.column(), dir.sql(), dir.sql()));
    qb.push(" LIMIT ").push_bind(limit);
    qb.push(" OFFSET ").push_bind(offset);
    let rows = qb.build().fetch_all(pool).await?;
    let tasks = rows.iter().map(task_from_row).collect::<Result<Vec<_>>>()?;

    Ok(TaskPageRows {
        tasks,
        total,
        by_status: grouped_counts(pool, filter, "status").await?,
        by_anchor: grouped_counts(pool, filter, "anchor").await?,
    })
}

// ---------------------------------------------------------------------------
// analytics reads

/// Tasks created in `[start, end]` narrowed by the optional filters.
#[instrument(skip_all)]
pub async fn task_slices(
    pool: &Pool,
    tenant_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    anchor: Option<&str>,
    classification_tag: Option<&str>,
) -> Result<Vec<TaskSlice>> {
    let rows = sqlx::query(
        "SELECT anchor, classification_tag, status, channel, created_at FROM tasks \
         WHERE tenant_id = ? AND created_at >= ? AND created_at <= ? \
         AND (? IS NULL OR anchor = ?) AND (? IS NULL OR classification_tag = ?)",
    )
    .bind(tenant_id)
    .bind(ts(start))
    .bind(ts(end))
    .bind(anchor)
    .bind(anchor)
    .bind(classification_tag)
    .bind(classification_tag)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(TaskSlice {
                anchor: row.try_get("anchor")?,
                classification_tag: row.try_get("classification_tag")?,
                status: row.try_get("status")?,
                channel: row.try_get("channel")?,
                created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
            })
        })
        .collect()
}

/// Audit actions in `[start, end]`. Anchor/classification narrowing joins the
/// live task row, so logs of deleted tasks only count when unfiltered.
#[instrument(skip_all)]
pub async fn log_action_counts(
    pool: &Pool,
    tenant_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    anchor: Option<&str>,
    classification_tag: Option<&str>,
) -> Result<BTreeMap<String, i64>> {
    let rows = sqlx::query(
        "SELECT l.action AS action, COUNT(*) AS n FROM task_logs l \
         LEFT JOIN tasks t ON t.id = l.task_id \
         WHERE l.tenant_id = ? AND l.created_at >= ? AND l.created_at <= ? \
         AND (? IS NULL OR t.anchor = ?) AND (? IS NULL OR t.classification_tag = ?) \
         GROUP BY l.action",
    )
    .bind(tenant_id)
    .bind(ts(start))
    .bind(ts(end))
    .bind(anchor)
    .bind(anchor)
    .bind(classification_tag)
    .bind(classification_tag)
    .fetch_all(pool)
    .await?;
    let mut out = BTreeMap::new();
    for row in rows {
        out.insert(row.try_get::<String, _>("action")?, row.try_get::<i64, _>("n")?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// run stats & process lock

#[instrument(skip_all)]
pub async fn insert_run(
    pool: &Pool,
    run_id: &str,
    tenant_id: &str,
    kind: &str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    stats: &Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO run_stats (run_id, tenant_id, kind, started_at, finished_at, stats) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(run_id)
    .bind(tenant_id)
    .bind(kind)
    .bind(ts(started_at))
    .bind(ts(finished_at))
    .bind(json_text(stats)?)
    .execute(pool)
    .await
    .context("insert run stats")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn last_run(pool: &Pool, tenant_id: &str, kind: &str) -> Result<Option<Value>> {
    let raw: Option<String> = sqlx::query_scalar(
        "SELECT stats FROM run_stats WHERE tenant_id = ? AND kind = ? ORDER BY started_at DESC, id DESC LIMIT 1",
    )
    .bind(tenant_id)
    .bind(kind)
    .fetch_optional(pool)
    .await?;
    raw.map(|s| serde_json::from_str(&s).context("decode run stats"))
        .transpose()
}

#[instrument(skip_all)]
pub async fn lock_created_at(pool: &Pool, name: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = sqlx::query_scalar("SELECT created_at FROM process_locks WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    parse_opt_ts(raw)
}

#[instrument(skip_all)]
pub async fn put_lock(pool: &Pool, name: &str, now: DateTime<Utc>) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO process_locks (name, created_at) VALUES (?, ?)")
        .bind(name)
        .bind(ts(now))
        .execute(pool)
        .await
        .context("write process lock")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_lock(pool: &Pool, name: &str) -> Result<()> {
    sqlx::query("DELETE FROM process_locks WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await
        .context("delete process lock")?;
    Ok(())
}
