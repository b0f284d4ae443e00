//! Insert payloads, filters and view rows used by repositories.
//!
//! Keep these structs focused on the data crossing the SQL boundary. Business
//! rules live in higher layers.

use crate::model::{Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Template row as written by seeding and tests.
#[derive(Debug, Clone, Default)]
pub struct NewTemplate {
    pub tenant_id: String,
    pub code: String,
    pub title: String,
    pub anchor: String,
    pub channel: String,
    pub offset: String,
    pub message_v1: String,
    pub message_v2: Option<String>,
    pub audience_filter: Option<Value>,
    pub variables: Vec<String>,
    pub classification_tag: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct NewTask {
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
    pub occurrence_id: Option<i64>,
}

/// One audit row of `task_logs`.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub tenant_id: String,
    pub subject_id: String,
    pub task_id: Option<i64>,
    pub action: String,
    pub channel: Option<String>,
    pub template_code: Option<String>,
    pub meta: Value,
}

/// Earlier task for the same dedup key, as seen by generation.
#[derive(Debug, Clone, Copy)]
pub struct PriorTask {
    pub id: i64,
    pub status: TaskStatus,
    /// Written by the job or a rebuild, so a rebuild replaces it.
    pub regenerable: bool,
}

/// Audit row as read back for undo.
#[derive(Debug, Clone)]
pub struct LoggedAction {
    pub action: String,
    pub meta: Value,
    pub created_at: DateTime<Utc>,
}

/// Typed task predicate; every field narrows the result.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub tenant_id: String,
    pub status: Option<TaskStatus>,
    pub anchor: Option<String>,
    pub template_code: Option<String>,
    pub channel: Option<String>,
    pub subject_id: Option<String>,
    pub classification_tag: Option<String>,
    pub scheduled_from: Option<DateTime<Utc>>,
    pub scheduled_to: Option<DateTime<Utc>>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
}

/// Whitelisted sort columns.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    ScheduledFor,
    CreatedAt,
    UpdatedAt,
    Status,
    Anchor,
    TemplateCode,
}

impl SortKey {
    pub fn column(&self) -> &'static str {
        match self {
            SortKey::ScheduledFor => "scheduled_for",
            SortKey::CreatedAt => "created_at",
            SortKey::UpdatedAt => "updated_at",
            SortKey::Status => "status",
            SortKey::Anchor => "anchor",
            SortKey::TemplateCode => "template_code",
        }
    }

    pub fn parse(s: &str) -> Option<SortKey> {
        match s.trim() {
            "scheduled_for" => Some(SortKey::ScheduledFor),
            "created_at" => Some(SortKey::CreatedAt),
            "updated_at" => Some(SortKey::UpdatedAt),
            "status" => Some(SortKey::Status),
            "anchor" => Some(SortKey::Anchor),
            "template_code" => Some(SortKey::TemplateCode),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    pub fn sql(&self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

/// One page of tasks plus breakdowns over the whole filtered set.
#[derive(Debug, Clone, Default)]
pub struct TaskPageRows {
    pub tasks: Vec<Task>,
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub by_anchor: BTreeMap<String, i64>,
}

/// Columns the analytics rollup needs from each task.
#[derive(Debug, Clone)]
pub struct TaskSlice {
    pub anchor: String,
    pub classification_tag: Option<String>,
    pub status: String,
    pub channel: String,
    pub created_at: DateTime<Utc>,
}
