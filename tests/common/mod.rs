#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use relationship_engine::clock::FixedClock;
use relationship_engine::config::{self, Config};
use relationship_engine::db::{self, NewTemplate, Pool};
use relationship_engine::engine::Engine;
use relationship_engine::model::{Subject, Template};
use relationship_engine::registry::{MemoryTemplateCache, StoreTemplateSource, TemplateRegistry, TemplateSource};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TENANT: &str = "tenant-a";

pub async fn setup_pool() -> Pool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// 2026-03-10 12:00 UTC; the test calendar runs on UTC.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
}

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn test_config() -> Config {
    let mut cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.app.utc_offset_minutes = 0;
    cfg.security.cron_secret = "s3cret".into();
    cfg
}

/// Store-backed source that counts how often it is consulted.
#[derive(Clone)]
pub struct CountingSource {
    inner: StoreTemplateSource,
    pub calls: Arc<AtomicUsize>,
}

impl CountingSource {
    pub fn reads(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TemplateSource for CountingSource {
    async fn active_templates(&self, tenant_id: &str) -> Result<Vec<Template>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.active_templates(tenant_id).await
    }
}

pub struct Harness {
    pub pool: Pool,
    pub engine: Engine,
    pub source: CountingSource,
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

pub async fn harness_with(cfg: Config) -> Harness {
    let pool = setup_pool().await;
    let source = CountingSource {
        inner: StoreTemplateSource::new(pool.clone()),
        calls: Arc::new(AtomicUsize::new(0)),
    };
    let registry = TemplateRegistry::new(
        Arc::new(source.clone()),
        Arc::new(MemoryTemplateCache::new()),
        Duration::from_secs(300),
    );
    let engine = Engine::new(pool.clone(), registry, Arc::new(FixedClock(now())), &cfg);
    Harness { pool, engine, source }
}

/// Same store and registry with the clock frozen at `at`.
pub fn engine_at(engine: &Engine, at: DateTime<Utc>) -> Engine {
    Engine {
        clock: Arc::new(FixedClock(at)),
        ..engine.clone()
    }
}

pub fn subject(id: &str, name: &str) -> Subject {
    Subject {
        id: id.into(),
        tenant_id: TENANT.into(),
        name: name.into(),
        email: Some(format!("{id}@example.com")),
        phone: Some("+5511999990000".into()),
        status: "active".into(),
        tags: vec![],
        plan_name: Some("Mensal".into()),
        trainer_id: None,
        trainer_name: None,
        created_at: Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap(),
        first_workout_date: None,
        last_workout_date: None,
        birth_date: None,
        next_renewal_date: None,
    }
}

pub async fn add_subject(pool: &Pool, subject: Subject) -> Subject {
    db::insert_subject(pool, &subject).await.unwrap();
    subject
}

pub async fn add_template(
    pool: &Pool,
    code: &str,
    anchor: &str,
    offset: &str,
    body: &str,
    audience: Option<Value>,
) -> i64 {
    let template = NewTemplate {
        tenant_id: TENANT.into(),
        code: code.into(),
        title: format!("{code} title"),
        anchor: anchor.into(),
        channel: "whatsapp".into(),
        offset: offset.into(),
        message_v1: body.into(),
        audience_filter: audience,
        classification_tag: Some("relationship".into()),
        active: true,
        ..Default::default()
    };
    db::insert_template_if_absent(pool, &template, now() - chrono::Duration::days(30))
        .await
        .unwrap()
        .unwrap()
}

pub async fn add_occurrence(pool: &Pool, subject_id: &str, kind: &str, description: &str, reminder_at: DateTime<Utc>) -> i64 {
    db::insert_occurrence(
        pool,
        TENANT,
        subject_id,
        kind,
        Some(description),
        Some(reminder_at),
        now() - chrono::Duration::days(7),
    )
    .await
    .unwrap()
}

pub async fn count_rows(pool: &Pool, table: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap()
}
