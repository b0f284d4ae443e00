//! Advisory, time-boxed process lock backed by one row per name.
//!
//! Acquisition is read-then-write and therefore not linearizable: two callers
//! racing inside the same instant can both observe a free lock and proceed.
//! A row older than the timeout is stale and silently replaced.
use crate::db::{self, Pool};
use crate::error::{EngineError, EngineResult};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

pub struct ProcessLock {
    pool: Pool,
    name: &'static str,
    timeout: Duration,
}

impl ProcessLock {
    pub fn new(pool: Pool, name: &'static str, timeout: Duration) -> Self {
        Self { pool, name, timeout }
    }

    /// Age in seconds of a lock still within its timeout, if any.
    pub async fn held_age(&self, now: DateTime<Utc>) -> Result<Option<i64>> {
        let Some(created_at) = db::lock_created_at(&self.pool, self.name).await? else {
            return Ok(None);
        };
        let age = now - created_at;
        if age < self.timeout {
            Ok(Some(age.num_seconds().max(0)))
        } else {
            Ok(None)
        }
    }

    pub async fn acquire(&self, now: DateTime<Utc>) -> EngineResult<()> {
        if let Some(age_secs) = self.held_age(now).await? {
            warn!(lock = self.name, age_secs, "lock held");
            return Err(EngineError::LockHeld { age_secs });
        }
        db::put_lock(&self.pool, self.name, now).await?;
        info!(lock = self.name, "lock acquired");
        Ok(())
    }

    pub async fn release(&self) -> Result<()> {
        db::delete_lock(&self.pool, self.name).await?;
        info!(lock = self.name, "lock released");
        Ok(())
    }
}
