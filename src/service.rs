//! Read and management operations exposed over HTTP.
//!
//! Each method maps to one route in [`crate::api`]; the router only
//! translates requests and errors.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::config::ServeConfig;
use crate::feed::{render_rss, RenderError};
use crate::processor::{FeedProcessor, RefilterOutcome};
use crate::scheduler::{ScheduleEntry, Scheduler, SchedulerError};
use crate::sources::{SourceCatalog, SourceError, SourceSet};
use crate::storage::{DatabaseError, FeedRecord, ItemStats, Store};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Feed not found: {0}")]
    NotFound(String),

    #[error("Source is disabled: {0}")]
    SourceDisabled(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Sources(#[from] SourceError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

impl From<SchedulerError> for ServiceError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::UnknownSource(id) => ServiceError::NotFound(id),
            SchedulerError::SourceDisabled(id) => ServiceError::SourceDisabled(id),
            other => ServiceError::Unavailable(other.to_string()),
        }
    }
}

/// A stored feed plus whether it is still configured.
#[derive(Debug, Clone, Serialize)]
pub struct FeedSummary {
    #[serde(flatten)]
    pub feed: FeedRecord,
    /// `None` when the source is no longer in the sources file
    pub enabled: Option<bool>,
    pub schedule: Option<ScheduleEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedDetails {
    pub feed: FeedRecord,
    pub stats: ItemStats,
    pub schedule: Option<ScheduleEntry>,
    pub configured: bool,
    pub enabled: Option<bool>,
    pub rule_count: usize,
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub sources: usize,
    pub enabled: usize,
    pub registered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TriggerResult {
    /// False when a run was already queued or running
    pub queued: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub sources: usize,
    pub enabled: usize,
    pub feeds: usize,
    pub uptime_secs: u64,
}

pub struct FeedService {
    store: Arc<dyn Store>,
    catalog: Arc<SourceCatalog>,
    scheduler: Arc<Scheduler>,
    processor: Arc<FeedProcessor>,
    serve: ServeConfig,
    started: Instant,
}

impl FeedService {
    pub fn new(
        store: Arc<dyn Store>,
        catalog: Arc<SourceCatalog>,
        scheduler: Arc<Scheduler>,
        processor: Arc<FeedProcessor>,
        serve: ServeConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            scheduler,
            processor,
            serve,
            started: Instant::now(),
        }
    }

    /// Render a feed's admitted items as RSS 2.0.
    pub async fn get_feed(&self, external_id: &str) -> Result<String, ServiceError> {
        let feed = self.find_feed(external_id).await?;
        let items = self.store.list_items(feed.id).await?;
        Ok(render_rss(&feed, &items, self.serve.max_items)?)
    }

    pub async fn list_feeds(&self) -> Result<Vec<FeedSummary>, ServiceError> {
        let set = self.catalog.snapshot();
        let feeds = self.store.list_feeds().await?;
        Ok(feeds
            .into_iter()
            .map(|feed| FeedSummary {
                enabled: set.get(&feed.external_id).map(|s| s.enabled),
                schedule: self.scheduler.entry(&feed.external_id),
                feed,
            })
            .collect())
    }

    pub async fn get_feed_details(&self, external_id: &str) -> Result<FeedDetails, ServiceError> {
        let feed = self.find_feed(external_id).await?;
        let stats = self.store.item_stats(feed.id).await?;
        let set = self.catalog.snapshot();
        let source = set.get(external_id);
        Ok(FeedDetails {
            schedule: self.scheduler.entry(external_id),
            configured: source.is_some(),
            enabled: source.map(|s| s.enabled),
            rule_count: source.map_or(0, |s| s.rules.len()),
            interval_secs: source.and_then(|s| s.interval).map(|d| d.as_secs()),
            stats,
            feed,
        })
    }

    /// Queue an immediate run of one source.
    pub async fn reload_feed(&self, external_id: &str) -> Result<TriggerResult, ServiceError> {
        let queued = self.scheduler.trigger_now(external_id).await?;
        tracing::info!(source = %external_id, queued, "Manual reload requested");
        Ok(TriggerResult { queued })
    }

    /// Re-apply the source's current rules to its stored items.
    pub async fn refilter(&self, external_id: &str) -> Result<RefilterOutcome, ServiceError> {
        let set = self.catalog.snapshot();
        let source = set
            .get(external_id)
            .ok_or_else(|| ServiceError::NotFound(external_id.to_string()))?;
        Ok(self.processor.refilter(source).await?)
    }

    /// Re-read the sources file, install it and register every source.
    ///
    /// A file that fails to load leaves the current snapshot in place.
    pub async fn reload_sources(&self) -> Result<ReloadSummary, ServiceError> {
        let set = self.catalog.reload()?;
        let registered = self.register_sources(&set).await?;
        Ok(ReloadSummary {
            sources: set.len(),
            enabled: set.enabled_count(),
            registered,
        })
    }

    /// Register every source of `set` so it is listed before its first run.
    pub async fn register_sources(&self, set: &SourceSet) -> Result<usize, ServiceError> {
        let mut registered = 0;
        for source in set.iter() {
            self.processor.register(source).await?;
            registered += 1;
        }
        Ok(registered)
    }

    pub async fn health(&self) -> Result<Health, ServiceError> {
        let set = self.catalog.snapshot();
        let feeds = self.store.list_feeds().await?.len();
        Ok(Health {
            status: "ok",
            sources: set.len(),
            enabled: set.enabled_count(),
            feeds,
            uptime_secs: self.started.elapsed().as_secs(),
        })
    }

    async fn find_feed(&self, external_id: &str) -> Result<FeedRecord, ServiceError> {
        self.store
            .get_feed(external_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(external_id.to_string()))
    }
}
