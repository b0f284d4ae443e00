//! Read-only rollups over tasks and their audit trail.
use crate::db;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::instrument;

/// Bucket name used for tasks without a classification tag.
const UNCLASSIFIED: &str = "unclassified";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Period {
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
    #[serde(rename = "90d")]
    Quarter,
    #[serde(rename = "1y")]
    Year,
}

impl Period {
    pub fn parse(token: &str) -> Option<Period> {
        match token.trim() {
            "7d" => Some(Period::Week),
            "30d" => Some(Period::Month),
            "90d" => Some(Period::Quarter),
            "1y" => Some(Period::Year),
            _ => None,
        }
    }

    pub fn days(&self) -> i64 {
        match self {
            Period::Week => 7,
            Period::Month => 30,
            Period::Quarter => 90,
            Period::Year => 365,
        }
    }

    /// Time-bucket label of a local date: days for short windows, ISO weeks
    /// for a quarter, months for a year.
    pub fn bucket(&self, date: NaiveDate) -> String {
        match self {
            Period::Week | Period::Month => date.format("%Y-%m-%d").to_string(),
            Period::Quarter => {
                let week = date.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            Period::Year => date.format("%Y-%m").to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsQuery {
    /// `7d`, `30d`, `90d` or `1y`; defaults to `30d`.
    pub period: Option<String>,
    pub anchor: Option<String>,
    pub classification_tag: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsReport {
    pub period: Period,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_tasks: u64,
    pub by_anchor: BTreeMap<String, u64>,
    pub by_classification: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
    pub by_bucket: BTreeMap<String, u64>,
    pub actions: BTreeMap<String, i64>,
    pub channels: BTreeMap<String, u64>,
}

#[instrument(skip_all, fields(tenant_id = %tenant_id))]
pub async fn summarize(engine: &Engine, tenant_id: &str, query: &AnalyticsQuery) -> EngineResult<AnalyticsReport> {
    let period = match query.period.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        Some(token) => Period::parse(token)
            .ok_or_else(|| EngineError::Validation(format!("unknown period '{token}'")))?,
        None => Period::Month,
    };
    let anchor = query.anchor.as_deref().filter(|a| !a.trim().is_empty());
    let tag = query.classification_tag.as_deref().filter(|t| !t.trim().is_empty());

    let end = engine.clock.now();
    let start = end - Duration::days(period.days());
    let slices = db::task_slices(&engine.pool, tenant_id, start, end, anchor, tag).await?;
    let actions = db::log_action_counts(&engine.pool, tenant_id, start, end, anchor, tag).await?;

    let mut report = AnalyticsReport {
        period,
        start,
        end,
        total_tasks: slices.len() as u64,
        by_anchor: BTreeMap::new(),
        by_classification: BTreeMap::new(),
        by_status: BTreeMap::new(),
        by_bucket: BTreeMap::new(),
        actions,
        channels: BTreeMap::new(),
    };
    for slice in slices {
        *report.by_anchor.entry(slice.anchor).or_default() += 1;
        let class = slice
            .classification_tag
            .unwrap_or_else(|| UNCLASSIFIED.to_string());
        *report.by_classification.entry(class).or_default() += 1;
        *report.by_status.entry(slice.status).or_default() += 1;
        *report.channels.entry(slice.channel).or_default() += 1;
        let local = engine.calendar.local_date(slice.created_at);
        *report.by_bucket.entry(period.bucket(local)).or_default() += 1;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_tokens() {
        assert_eq!(Period::parse("7d"), Some(Period::Week));
        assert_eq!(Period::parse("1y"), Some(Period::Year));
        assert_eq!(Period::parse("2w"), None);
        assert_eq!(Period::Quarter.days(), 90);
    }

    #[test]
    fn bucket_granularity() {
        let d = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert_eq!(Period::Week.bucket(d), "2026-01-01");
        assert_eq!(Period::Quarter.bucket(d), "2026-W01");
        assert_eq!(Period::Year.bucket(d), "2026-01");
        let d = NaiveDate::from_ymd_opt(2027, 1, 1).unwrap();
        assert_eq!(Period::Quarter.bucket(d), "2026-W53");
    }
}
