use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Largest offset (in days, either direction) a template may carry.
pub const MAX_OFFSET_DAYS: i64 = 365;

/// Business events a template or task is scheduled relative to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    SaleClose,
    FirstWorkout,
    WeeklyFollowup,
    MonthlyReview,
    Birthday,
    RenewalWindow,
    OccurrenceFollowup,
    Manual,
}

/// Every anchor with a strategy; sizes the default work queue of a batch run.
pub const SUPPORTED_ANCHORS: [Anchor; 8] = [
    Anchor::SaleClose,
    Anchor::FirstWorkout,
    Anchor::WeeklyFollowup,
    Anchor::MonthlyReview,
    Anchor::Birthday,
    Anchor::RenewalWindow,
    Anchor::OccurrenceFollowup,
    Anchor::Manual,
];

impl Anchor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Anchor::SaleClose => "sale_close",
            Anchor::FirstWorkout => "first_workout",
            Anchor::WeeklyFollowup => "weekly_followup",
            Anchor::MonthlyReview => "monthly_review",
            Anchor::Birthday => "birthday",
            Anchor::RenewalWindow => "renewal_window",
            Anchor::OccurrenceFollowup => "occurrence_followup",
            Anchor::Manual => "manual",
        }
    }

    pub fn parse(code: &str) -> Option<Anchor> {
        SUPPORTED_ANCHORS
            .iter()
            .copied()
            .find(|anchor| anchor.as_str() == code.trim())
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    DueToday,
    Snoozed,
    Sent,
    Skipped,
    Failed,
}

/// States a recalculation pass may delete and regenerate.
pub const OPEN_STATUSES: [TaskStatus; 3] =
    [TaskStatus::Pending, TaskStatus::DueToday, TaskStatus::Snoozed];

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::DueToday => "due_today",
            TaskStatus::Snoozed => "snoozed",
            TaskStatus::Sent => "sent",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s.trim() {
            "pending" => Some(TaskStatus::Pending),
            "due_today" => Some(TaskStatus::DueToday),
            "snoozed" => Some(TaskStatus::Snoozed),
            "sent" => Some(TaskStatus::Sent),
            "skipped" => Some(TaskStatus::Skipped),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Sent | TaskStatus::Skipped | TaskStatus::Failed)
    }

    /// Edges of the task state machine. `Snoozed -> Pending` is the re-entry
    /// edge taken once a new `scheduled_for` is assigned.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, DueToday) => true,
            (Pending | DueToday, Sent | Skipped | Failed | Snoozed) => true,
            (Snoozed, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who materialised a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreatedBy {
    Job,
    ManualRecalculate,
    /// Single-subject generation fired by a business event.
    Trigger,
    User(String),
}

impl CreatedBy {
    pub fn as_str(&self) -> &str {
        match self {
            CreatedBy::Job => "job",
            CreatedBy::ManualRecalculate => "manual_recalculate",
            CreatedBy::Trigger => "event_trigger",
            CreatedBy::User(id) => id.as_str(),
        }
    }

    /// Audit action recorded when a task is created by this actor.
    pub fn creation_action(&self) -> &'static str {
        match self {
            CreatedBy::ManualRecalculate => "recalculated",
            _ => "created",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OffsetError {
    #[error("offset '{0}' needs an explicit sign")]
    MissingSign(String),
    #[error("offset '{0}' is not of the form ±Nd")]
    Malformed(String),
    #[error("offset of {0} days exceeds ±{max}", max = MAX_OFFSET_DAYS)]
    OutOfRange(i64),
}

/// Parse a signed day offset such as `+7d`, `-3d` or `+0d`.
pub fn parse_offset(raw: &str) -> Result<i64, OffsetError> {
    let trimmed = raw.trim();
    let (sign, rest) = match trimmed.chars().next() {
        Some('+') => (1, &trimmed[1..]),
        Some('-') => (-1, &trimmed[1..]),
        Some(c) if c.is_ascii_digit() => return Err(OffsetError::MissingSign(raw.to_string())),
        _ => return Err(OffsetError::Malformed(raw.to_string())),
    };
    let digits = rest
        .strip_suffix('d')
        .filter(|d| !d.is_empty() && d.chars().all(|c| c.is_ascii_digit()))
        .ok_or_else(|| OffsetError::Malformed(raw.to_string()))?;
    let magnitude: i64 = digits
        .parse()
        .map_err(|_| OffsetError::Malformed(raw.to_string()))?;
    if magnitude > MAX_OFFSET_DAYS {
        return Err(OffsetError::OutOfRange(sign * magnitude));
    }
    Ok(sign * magnitude)
}

/// Anchor date shifted by the template offset.
pub fn compute_scheduled_date(anchor_date: NaiveDate, offset: &str) -> Result<NaiveDate, OffsetError> {
    let days = parse_offset(offset)?;
    Ok(anchor_date + Duration::days(days))
}

/// Predicate restricting which subjects a template applies to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AudienceFilter {
    /// Subject must carry at least one of these tags.
    pub tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    /// Subject status must be one of these.
    pub status: Vec<String>,
    pub trainer_id: Option<String>,
}

impl AudienceFilter {
    pub fn matches(&self, subject: &Subject) -> bool {
        if !self.tags.is_empty() && !self.tags.iter().any(|t| subject.tags.contains(t)) {
            return false;
        }
        if self.exclude_tags.iter().any(|t| subject.tags.contains(t)) {
            return false;
        }
        if !self.status.is_empty() && !self.status.iter().any(|s| s == &subject.status) {
            return false;
        }
        match &self.trainer_id {
            Some(trainer) => subject.trainer_id.as_deref() == Some(trainer.as_str()),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Template {
    pub id: i64,
    pub tenant_id: String,
    pub code: String,
    pub title: String,
    /// Raw anchor code as stored; see [`Template::anchor`].
    pub anchor: String,
    pub channel: String,
    pub offset: String,
    pub message_v1: String,
    pub message_v2: Option<String>,
    /// Raw filter document; `None` when the column is NULL.
    pub audience_filter: Option<Value>,
    pub variables: Vec<String>,
    pub classification_tag: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Template {
    pub fn anchor(&self) -> Option<Anchor> {
        Anchor::parse(&self.anchor)
    }

    pub fn offset_days(&self) -> Result<i64, OffsetError> {
        parse_offset(&self.offset)
    }

    /// Decode the audience filter. `Ok(None)` means "no filter".
    pub fn audience(&self) -> Result<Option<AudienceFilter>, String> {
        match &self.audience_filter {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| format!("audience filter of {} is unresolvable: {e}", self.code)),
        }
    }
}

/// Addressee of generated tasks. Read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subject {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: String,
    pub tags: Vec<String>,
    pub plan_name: Option<String>,
    pub trainer_id: Option<String>,
    pub trainer_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub first_workout_date: Option<NaiveDate>,
    pub last_workout_date: Option<NaiveDate>,
    pub birth_date: Option<NaiveDate>,
    pub next_renewal_date: Option<NaiveDate>,
}

impl Subject {
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }

    pub fn last_names(&self) -> String {
        self.name.split_whitespace().skip(1).collect::<Vec<_>>().join(" ")
    }
}

/// Incident recorded against a subject (absence, injury, complaint...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Occurrence {
    pub id: i64,
    pub tenant_id: String,
    pub subject_id: String,
    pub kind: String,
    pub description: Option<String>,
    pub reminder_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    pub tenant_id: String,
    pub subject_id: String,
    pub template_code: String,
    pub anchor: String,
    pub scheduled_for: DateTime<Utc>,
    pub channel: String,
    pub status: TaskStatus,
    pub payload: Value,
    pub variables_used: Vec<String>,
    pub classification_tag: Option<String>,
    pub created_by: String,
    pub notes: Option<String>,
    /// Incident a follow-up task was generated for.
    pub occurrence_id: Option<i64>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn subject(tags: &[&str], status: &str) -> Subject {
        Subject {
            id: "s1".into(),
            tenant_id: "t1".into(),
            name: "Ana Maria Souza".into(),
            email: None,
            phone: None,
            status: status.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            plan_name: None,
            trainer_id: Some("tr-1".into()),
            trainer_name: None,
            created_at: Utc::now(),
            first_workout_date: None,
            last_workout_date: None,
            birth_date: None,
            next_renewal_date: None,
        }
    }

    #[test]
    fn offsets_require_sign() {
        assert_eq!(parse_offset("+7d"), Ok(7));
        assert_eq!(parse_offset("-3d"), Ok(-3));
        assert_eq!(parse_offset("+0d"), Ok(0));
        assert!(matches!(parse_offset("7d"), Err(OffsetError::MissingSign(_))));
        assert!(matches!(parse_offset("+7"), Err(OffsetError::Malformed(_))));
        assert!(matches!(parse_offset("+d"), Err(OffsetError::Malformed(_))));
        assert!(matches!(parse_offset("soon"), Err(OffsetError::Malformed(_))));
        assert!(matches!(parse_offset("+400d"), Err(OffsetError::OutOfRange(400))));
        assert_eq!(
            parse_offset("-400d").unwrap_err().to_string(),
            "offset of -400 days exceeds ±365"
        );
        assert_eq!(parse_offset("3d").unwrap_err().to_string(), "offset '3d' needs an explicit sign");
    }

    #[test]
    fn scheduled_date_adds_offset() {
        let anchor = date(2026, 2, 25);
        assert_eq!(compute_scheduled_date(anchor, "+7d").unwrap(), date(2026, 3, 4));
        assert_eq!(compute_scheduled_date(anchor, "-3d").unwrap(), date(2026, 2, 22));
        assert_eq!(compute_scheduled_date(anchor, "+0d").unwrap(), anchor);
    }

    #[test]
    fn anchor_codes_roundtrip_through_parse() {
        for anchor in SUPPORTED_ANCHORS {
            assert_eq!(Anchor::parse(anchor.as_str()), Some(anchor));
        }
        assert_eq!(Anchor::parse("training_followup"), None);
    }

    #[test]
    fn terminal_states_are_final() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::DueToday));
        assert!(TaskStatus::DueToday.can_transition_to(TaskStatus::Sent));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Snoozed));
        assert!(TaskStatus::Snoozed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Snoozed.can_transition_to(TaskStatus::Sent));
        for terminal in [TaskStatus::Sent, TaskStatus::Skipped, TaskStatus::Failed] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(TaskStatus::Pending));
        }
    }

    #[test]
    fn audience_filter_matching() {
        let vip = subject(&["vip", "morning"], "active");
        let plain = subject(&[], "active");
        let inactive = subject(&["vip"], "inactive");

        let filter = AudienceFilter {
            tags: vec!["vip".into()],
            status: vec!["active".into()],
            ..Default::default()
        };
        assert!(filter.matches(&vip));
        assert!(!filter.matches(&plain));
        assert!(!filter.matches(&inactive));

        let exclude = AudienceFilter {
            exclude_tags: vec!["morning".into()],
            ..Default::default()
        };
        assert!(!exclude.matches(&vip));
        assert!(exclude.matches(&plain));

        let trainer = AudienceFilter {
            trainer_id: Some("tr-2".into()),
            ..Default::default()
        };
        assert!(!trainer.matches(&vip));
    }

    #[test]
    fn unknown_filter_keys_are_unresolvable() {
        let mut template = Template {
            id: 1,
            tenant_id: "t1".into(),
            code: "RENEW".into(),
            title: String::new(),
            anchor: "renewal_window".into(),
            channel: "whatsapp".into(),
            offset: "-7d".into(),
            message_v1: "hi".into(),
            message_v2: None,
            audience_filter: Some(serde_json::json!({"plan": "gold"})),
            variables: vec![],
            classification_tag: None,
            active: true,
            created_at: Utc::now(),
        };
        assert!(template.audience().is_err());
        template.audience_filter = Some(serde_json::json!({}));
        assert_eq!(template.audience().unwrap(), Some(AudienceFilter::default()));
        template.audience_filter = None;
        assert_eq!(template.audience().unwrap(), None);
    }

    #[test]
    fn subject_name_parts() {
        let s = subject(&[], "active");
        assert_eq!(s.first_name(), "Ana");
        assert_eq!(s.last_names(), "Maria Souza");
    }
}
