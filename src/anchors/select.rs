//! Subject eligibility per anchor, evaluated against the tenant-local today.
use crate::clock::LocalCalendar;
use crate::db::{self, Pool};
use crate::model::{Occurrence, Subject};
use anyhow::Result;
use chrono::{Datelike, Duration, NaiveDate};
use std::collections::HashMap;
use tracing::warn;

const ACTIVE: &str = "active";

/// A subject paired with the date its anchor fired on.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub subject: Subject,
    pub anchor_date: NaiveDate,
    pub occurrence: Option<Occurrence>,
}

impl Candidate {
    fn new(subject: Subject, anchor_date: NaiveDate) -> Self {
        Self {
            subject,
            anchor_date,
            occurrence: None,
        }
    }
}

fn within(date: NaiveDate, today: NaiveDate, horizon_days: i64) -> bool {
    date >= today && date <= today + Duration::days(horizon_days)
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// Birthday in the given year; Feb 29 falls on Feb 28 in common years.
fn birthday_in(birth: NaiveDate, year: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, birth.month(), birth.day())
        .or_else(|| NaiveDate::from_ymd_opt(year, 2, 28))
}

/// First birthday on or after `today`.
pub fn next_birthday(birth: NaiveDate, today: NaiveDate) -> Option<NaiveDate> {
    let this_year = birthday_in(birth, today.year())?;
    if this_year >= today {
        Some(this_year)
    } else {
        birthday_in(birth, today.year() + 1)
    }
}

/// Whether a monthly cycle started on `start` comes round on `today`.
/// Start days past the end of a short month fire on its last day.
pub fn is_monthly_anniversary(start: NaiveDate, today: NaiveDate) -> bool {
    if start >= today {
        return false;
    }
    let last = days_in_month(today.year(), today.month());
    start.day().min(last) == today.day()
}

pub async fn sale_close(pool: &Pool, tenant_id: &str, calendar: &LocalCalendar, today: NaiveDate) -> Result<Vec<Candidate>> {
    let subjects = db::list_subjects(pool, tenant_id, Some(ACTIVE)).await?;
    Ok(subjects
        .into_iter()
        .filter(|s| calendar.local_date(s.created_at) == today)
        .map(|s| Candidate::new(s, today))
        .collect())
}

pub async fn first_workout(pool: &Pool, tenant_id: &str, today: NaiveDate, horizon_days: i64) -> Result<Vec<Candidate>> {
    let subjects = db::list_subjects(pool, tenant_id, None).await?;
    Ok(subjects
        .into_iter()
        .filter_map(|s| {
            let date = s.first_workout_date?;
            within(date, today, horizon_days).then(|| Candidate::new(s, date))
        })
        .collect())
}

pub async fn weekly_followup(pool: &Pool, tenant_id: &str, today: NaiveDate) -> Result<Vec<Candidate>> {
    let target = today - Duration::days(7);
    let subjects = db::list_subjects(pool, tenant_id, Some(ACTIVE)).await?;
    Ok(subjects
        .into_iter()
        .filter(|s| s.last_workout_date == Some(target))
        .map(|s| Candidate::new(s, target))
        .collect())
}

pub async fn monthly_review(pool: &Pool, tenant_id: &str, today: NaiveDate) -> Result<Vec<Candidate>> {
    let subjects = db::list_subjects(pool, tenant_id, Some(ACTIVE)).await?;
    Ok(subjects
        .into_iter()
        .filter(|s| {
            s.first_workout_date
                .map(|start| is_monthly_anniversary(start, today))
                .unwrap_or(false)
        })
        .map(|s| Candidate::new(s, today))
        .collect())
}

pub async fn birthday(pool: &Pool, tenant_id: &str, today: NaiveDate, horizon_days: i64) -> Result<Vec<Candidate>> {
    let subjects = db::list_subjects(pool, tenant_id, None).await?;
    Ok(subjects
        .into_iter()
        .filter_map(|s| {
            let next = next_birthday(s.birth_date?, today)?;
            within(next, today, horizon_days).then(|| Candidate::new(s, next))
        })
        .collect())
}

pub async fn renewal_window(pool: &Pool, tenant_id: &str, today: NaiveDate, horizon_days: i64) -> Result<Vec<Candidate>> {
    let subjects = db::list_subjects(pool, tenant_id, Some(ACTIVE)).await?;
    Ok(subjects
        .into_iter()
        .filter_map(|s| {
            let date = s.next_renewal_date?;
            within(date, today, horizon_days).then(|| Candidate::new(s, date))
        })
        .collect())
}

pub async fn occurrence_followup(
    pool: &Pool,
    tenant_id: &str,
    calendar: &LocalCalendar,
    today: NaiveDate,
) -> Result<Vec<Candidate>> {
    let (start, end) = calendar.day_bounds(today);
    let occurrences = db::occurrences_due_between(pool, tenant_id, start, end).await?;
    if occurrences.is_empty() {
        return Ok(Vec::new());
    }
    let subjects: HashMap<String, Subject> = db::list_subjects(pool, tenant_id, None)
        .await?
        .into_iter()
        .map(|s| (s.id.clone(), s))
        .collect();

    let mut out = Vec::with_capacity(occurrences.len());
    for occ in occurrences {
        let Some(subject) = subjects.get(&occ.subject_id).cloned() else {
            warn!(occurrence_id = occ.id, subject_id = %occ.subject_id, "occurrence references unknown subject");
            continue;
        };
        let anchor_date = occ.reminder_at.map(|r| calendar.local_date(r)).unwrap_or(today);
        out.push(Candidate {
            subject,
            anchor_date,
            occurrence: Some(occ),
        });
    }
    Ok(out)
}
