//! Read-through cache of active templates per tenant.
use crate::db::{self, Pool};
use crate::model::Template;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

/// Where templates are read from on a cache miss.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn active_templates(&self, tenant_id: &str) -> Result<Vec<Template>>;
}

/// Templates read straight from the `templates` table.
#[derive(Clone)]
pub struct StoreTemplateSource {
    pool: Pool,
}

impl StoreTemplateSource {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateSource for StoreTemplateSource {
    async fn active_templates(&self, tenant_id: &str) -> Result<Vec<Template>> {
        db::list_active_templates(&self.pool, tenant_id).await
    }
}

/// Cache layer. Failures are reported but never block reads.
#[async_trait]
pub trait TemplateCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<Template>>>;
    async fn set(&self, key: &str, templates: Vec<Template>, ttl: Duration) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryTemplateCache {
    entries: RwLock<HashMap<String, (Instant, Vec<Template>)>>,
}

impl MemoryTemplateCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TemplateCache for MemoryTemplateCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<Template>>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(expires_at, _)| Instant::now() < *expires_at)
            .map(|(_, templates)| templates.clone()))
    }

    async fn set(&self, key: &str, templates: Vec<Template>, ttl: Duration) -> Result<()> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .write()
            .await
            .insert(key.to_string(), (expires_at, templates));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

pub fn cache_key(tenant_id: &str) -> String {
    format!("relationship-templates:{tenant_id}")
}

#[derive(Clone)]
pub struct TemplateRegistry {
    source: Arc<dyn TemplateSource>,
    cache: Arc<dyn TemplateCache>,
    ttl: Duration,
}

impl TemplateRegistry {
    pub fn new(source: Arc<dyn TemplateSource>, cache: Arc<dyn TemplateCache>, ttl: Duration) -> Self {
        Self { source, cache, ttl }
    }

    /// Active templates of a tenant ordered by creation. A source error
    /// propagates; a cache error is logged and treated as a miss.
    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    pub async fn fetch_active_templates(&self, tenant_id: &str, force_refresh: bool) -> Result<Vec<Template>> {
        let key = cache_key(tenant_id);
        if !force_refresh {
            match self.cache.get(&key).await {
                Ok(Some(templates)) => {
                    debug!(count = templates.len(), "template cache hit");
                    return Ok(templates);
                }
                Ok(None) => {}
                Err(err) => warn!(?err, "template cache read failed; reading source"),
            }
        }

        let templates = self.source.active_templates(tenant_id).await?;
        if let Err(err) = self.cache.set(&key, templates.clone(), self.ttl).await {
            warn!(?err, "template cache write failed");
        }
        Ok(templates)
    }

    pub async fn invalidate(&self, tenant_id: &str) {
        if let Err(err) = self.cache.remove(&cache_key(tenant_id)).await {
            warn!(?err, "template cache invalidation failed");
        }
    }
}
