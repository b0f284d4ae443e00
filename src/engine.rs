//! Explicitly constructed engine handle: store, template registry, clock and
//! settings shared by every workflow.
use crate::anchors::{DailyCap, GenerationSettings};
use crate::anchors::generate::StrategyContext;
use crate::clock::{Clock, LocalCalendar, SystemClock};
use crate::config::{Config, EngineSettings};
use crate::db::Pool;
use crate::lock::ProcessLock;
use crate::model::CreatedBy;
use crate::registry::{MemoryTemplateCache, StoreTemplateSource, TemplateRegistry};
use std::sync::Arc;
use std::time::Duration;

/// Name of the row guarding recalculation.
pub const RECALC_LOCK: &str = "relationship_recalculate";

#[derive(Clone)]
pub struct Engine {
    pub pool: Pool,
    pub registry: TemplateRegistry,
    pub clock: Arc<dyn Clock>,
    pub calendar: LocalCalendar,
    pub settings: EngineSettings,
    pub app_url: String,
}

impl Engine {
    pub fn new(
        pool: Pool,
        registry: TemplateRegistry,
        clock: Arc<dyn Clock>,
        cfg: &Config,
    ) -> Self {
        Self {
            pool,
            registry,
            clock,
            calendar: LocalCalendar::from_offset_minutes(cfg.app.utc_offset_minutes),
            settings: cfg.engine.clone(),
            app_url: cfg.app.app_url.clone(),
        }
    }

    /// Store-backed templates, in-memory cache and the system clock.
    pub fn from_config(pool: Pool, cfg: &Config) -> Self {
        let registry = TemplateRegistry::new(
            Arc::new(StoreTemplateSource::new(pool.clone())),
            Arc::new(MemoryTemplateCache::new()),
            Duration::from_secs(cfg.engine.template_cache_ttl_seconds),
        );
        Self::new(pool, registry, Arc::new(SystemClock), cfg)
    }

    pub fn recalc_lock(&self) -> ProcessLock {
        ProcessLock::new(
            self.pool.clone(),
            RECALC_LOCK,
            chrono::Duration::seconds(self.settings.lock_timeout_seconds),
        )
    }

    pub(crate) fn strategy_context(
        &self,
        tenant_id: &str,
        dry_run: bool,
        created_by: CreatedBy,
        assume_cleared: bool,
    ) -> StrategyContext {
        StrategyContext {
            pool: self.pool.clone(),
            tenant_id: tenant_id.to_string(),
            clock: self.clock.clone(),
            calendar: self.calendar,
            settings: GenerationSettings {
                max_tasks_per_subject_per_day: self.settings.max_tasks_per_subject_per_day,
                send_hour: self.settings.send_hour,
                app_url: self.app_url.clone(),
            },
            dry_run,
            created_by,
            assume_cleared,
            cap: Arc::new(DailyCap::new(self.settings.max_tasks_per_subject_per_day)),
        }
    }
}
