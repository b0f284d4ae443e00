//! One strategy per anchor code.
//!
//! Each variant knows which subjects are eligible for its event, which date
//! anchors the template offset, and which template shapes it accepts. Task
//! materialisation is shared in [`generate`].

pub mod generate;
pub mod select;

use crate::config::Horizons;
use crate::error::{EngineError, EngineResult};
use crate::model::{Anchor, AudienceFilter, Template};
use crate::stats::AnchorStats;
use anyhow::Result;
use generate::{StrategyContext, ValidTemplate};
use select::Candidate;
use std::time::Instant;
use tracing::{info, instrument, warn};

pub use generate::{DailyCap, GenerationSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorStrategy {
    SaleClose,
    FirstWorkout { horizon_days: i64 },
    WeeklyFollowup,
    MonthlyReview,
    Birthday { horizon_days: i64 },
    RenewalWindow { horizon_days: i64 },
    OccurrenceFollowup,
    Manual,
}

pub fn create_strategy(anchor: Anchor, horizons: &Horizons) -> AnchorStrategy {
    match anchor {
        Anchor::SaleClose => AnchorStrategy::SaleClose,
        Anchor::FirstWorkout => AnchorStrategy::FirstWorkout {
            horizon_days: horizons.first_workout_days,
        },
        Anchor::WeeklyFollowup => AnchorStrategy::WeeklyFollowup,
        Anchor::MonthlyReview => AnchorStrategy::MonthlyReview,
        Anchor::Birthday => AnchorStrategy::Birthday {
            horizon_days: horizons.birthday_days,
        },
        Anchor::RenewalWindow => AnchorStrategy::RenewalWindow {
            horizon_days: horizons.renewal_days,
        },
        Anchor::OccurrenceFollowup => AnchorStrategy::OccurrenceFollowup,
        Anchor::Manual => AnchorStrategy::Manual,
    }
}

/// Strategy for a raw anchor code; unsupported codes are a validation error.
pub fn create_strategy_for_code(code: &str, horizons: &Horizons) -> EngineResult<AnchorStrategy> {
    Anchor::parse(code)
        .map(|anchor| create_strategy(anchor, horizons))
        .ok_or_else(|| EngineError::Validation(format!("unsupported anchor '{code}'")))
}

impl AnchorStrategy {
    pub fn anchor(&self) -> Anchor {
        match self {
            AnchorStrategy::SaleClose => Anchor::SaleClose,
            AnchorStrategy::FirstWorkout { .. } => Anchor::FirstWorkout,
            AnchorStrategy::WeeklyFollowup => Anchor::WeeklyFollowup,
            AnchorStrategy::MonthlyReview => Anchor::MonthlyReview,
            AnchorStrategy::Birthday { .. } => Anchor::Birthday,
            AnchorStrategy::RenewalWindow { .. } => Anchor::RenewalWindow,
            AnchorStrategy::OccurrenceFollowup => Anchor::OccurrenceFollowup,
            AnchorStrategy::Manual => Anchor::Manual,
        }
    }

    /// Check a template can be processed by this strategy and decode its
    /// audience filter.
    pub fn validate_template(&self, template: &Template) -> Result<Option<AudienceFilter>, String> {
        if template.code.trim().is_empty() {
            return Err("template has an empty code".into());
        }
        if template.message_v1.trim().is_empty() {
            return Err(format!("{}: empty message body", template.code));
        }
        if template.channel.trim().is_empty() {
            return Err(format!("{}: empty channel", template.code));
        }
        if template.anchor() != Some(self.anchor()) {
            return Err(format!(
                "{}: anchor '{}' does not match {}",
                template.code,
                template.anchor,
                self.anchor()
            ));
        }
        template
            .offset_days()
            .map_err(|e| format!("{}: {e}", template.code))?;
        let audience = template.audience()?;
        if matches!(self, AnchorStrategy::RenewalWindow { .. }) && audience.is_none() {
            return Err(format!("{}: renewal templates need an audience filter", template.code));
        }
        Ok(audience)
    }

    async fn select(&self, ctx: &StrategyContext) -> Result<Vec<Candidate>> {
        let pool = &ctx.pool;
        let tenant = ctx.tenant_id.as_str();
        let today = ctx.calendar.local_date(ctx.clock.now());
        match *self {
            AnchorStrategy::SaleClose => select::sale_close(pool, tenant, &ctx.calendar, today).await,
            AnchorStrategy::FirstWorkout { horizon_days } => {
                select::first_workout(pool, tenant, today, horizon_days).await
            }
            AnchorStrategy::WeeklyFollowup => select::weekly_followup(pool, tenant, today).await,
            AnchorStrategy::MonthlyReview => select::monthly_review(pool, tenant, today).await,
            AnchorStrategy::Birthday { horizon_days } => {
                select::birthday(pool, tenant, today, horizon_days).await
            }
            AnchorStrategy::RenewalWindow { horizon_days } => {
                select::renewal_window(pool, tenant, today, horizon_days).await
            }
            AnchorStrategy::OccurrenceFollowup => {
                select::occurrence_followup(pool, tenant, &ctx.calendar, today).await
            }
            AnchorStrategy::Manual => Ok(Vec::new()),
        }
    }

    /// Templates this strategy can process; rejections are counted and
    /// reported in `stats`.
    pub fn accept_templates<'t>(&self, templates: &'t [Template], stats: &mut AnchorStats) -> Vec<ValidTemplate<'t>> {
        let mut valid = Vec::with_capacity(templates.len());
        for template in templates {
            match self.validate_template(template) {
                Ok(audience) => valid.push(ValidTemplate { template, audience }),
                Err(reason) => {
                    warn!(%reason, "template rejected");
                    stats.templates_rejected += 1;
                    stats.errors.push(reason);
                }
            }
        }
        stats.templates_processed = valid.len() as u64;
        valid
    }

    /// Validate templates, select subjects and materialise tasks. A selection
    /// failure aborts the anchor; per-item failures land in `errors`.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, anchor = %self.anchor()))]
    pub async fn process_anchor(&self, ctx: &StrategyContext, templates: &[Template]) -> Result<AnchorStats> {
        let started = Instant::now();
        let mut stats = AnchorStats::default();

        let valid = self.accept_templates(templates, &mut stats);
        if valid.is_empty() {
            stats.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(stats);
        }

        let candidates = self.select(ctx).await?;
        stats.students_found = candidates.len() as u64;
        generate::generate(ctx, self.anchor(), &valid, &candidates, &mut stats).await;

        stats.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            students = stats.students_found,
            created = stats.tasks_created,
            updated = stats.tasks_updated,
            skipped = stats.tasks_skipped,
            errors = stats.errors.len(),
            dry_run = ctx.dry_run,
            "anchor processed"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn template(anchor: &str, offset: &str) -> Template {
        Template {
            id: 1,
            tenant_id: "t1".into(),
            code: "T1".into(),
            title: "t".into(),
            anchor: anchor.into(),
            channel: "whatsapp".into(),
            offset: offset.into(),
            message_v1: "Oi [PrimeiroNome]".into(),
            message_v2: None,
            audience_filter: None,
            variables: vec![],
            classification_tag: None,
            active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn factory_is_exhaustive_over_codes() {
        let horizons = Horizons::default();
        for anchor in crate::model::SUPPORTED_ANCHORS {
            assert_eq!(create_strategy(anchor, &horizons).anchor(), anchor);
        }
        assert_eq!(
            create_strategy_for_code("renewal_window", &horizons).unwrap(),
            AnchorStrategy::RenewalWindow { horizon_days: 30 }
        );
        let err = create_strategy_for_code("nope", &horizons).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn validation_rejects_bad_templates() {
        let birthday = create_strategy(Anchor::Birthday, &Horizons::default());
        assert!(birthday.validate_template(&template("birthday", "+0d")).is_ok());
        assert!(birthday.validate_template(&template("birthday", "0d")).is_err());
        assert!(birthday.validate_template(&template("birthday", "+999d")).is_err());
        assert!(birthday.validate_template(&template("sale_close", "+0d")).is_err());

        let mut empty = template("birthday", "+0d");
        empty.message_v1 = "  ".into();
        assert!(birthday.validate_template(&empty).is_err());

        let renewal = create_strategy(Anchor::RenewalWindow, &Horizons::default());
        assert!(renewal.validate_template(&template("renewal_window", "-7d")).is_err());
        let mut filtered = template("renewal_window", "-7d");
        filtered.audience_filter = Some(json!({ "status": ["active"] }));
        assert!(renewal.validate_template(&filtered).unwrap().is_some());
        filtered.audience_filter = Some(json!({ "unknown": 1 }));
        assert!(renewal.validate_template(&filtered).is_err());
    }
}
