//! Operations exposed to the CLI and Lambda entry points.
//!
//! Collection runs are serialized by the advisory lock. While a run is in
//! progress a heartbeat keeps the lock fresh; when it ends a terminal status
//! is written whatever the outcome, and only then is the lock released.

use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::lock::{AdvisoryLock, COLLECT_LOCK_KEY, owner_token};
use crate::models::{Config, RUN_PARTITION, RunRecord};
use crate::pipeline::{Collector, RunReport};
use crate::services::CachedImage;
use crate::sources::SourceRegistry;
use crate::storage::{EntityStore, Stores};
use crate::utils::http::create_async_client;

/// Result of asking for a collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    /// Nothing was requested
    Idle,
    Started,
    AlreadyInProgress,
}

impl StartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartStatus::Idle => "idle",
            StartStatus::Started => "started",
            StartStatus::AlreadyInProgress => "already in progress",
        }
    }
}

/// Split a comma-separated id list, dropping blanks.
pub fn parse_ids(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect()
}

/// Entry point for collection and cache maintenance.
#[derive(Clone)]
pub struct Trigger {
    collector: Arc<Collector>,
    lock: AdvisoryLock,
    table: Arc<dyn EntityStore>,
}

impl Trigger {
    pub fn new(collector: Collector, lock: AdvisoryLock, table: Arc<dyn EntityStore>) -> Self {
        Self {
            collector: Arc::new(collector),
            lock,
            table,
        }
    }

    /// Wire a trigger from configuration and opened stores.
    pub fn from_config(config: &Config, stores: &Stores, registry: SourceRegistry) -> Result<Self> {
        let collector = Collector::new(config, stores, registry)?;
        let lock = AdvisoryLock::new(
            stores.admin.clone(),
            COLLECT_LOCK_KEY,
            config.lock.stale_after_ms,
        );
        Ok(Self::new(collector, lock, stores.table.clone()))
    }

    /// Open the configured stores and build every source.
    pub async fn open(config: &Config) -> Result<Self> {
        let stores = Stores::open(&config.storage).await?;
        Self::open_with(config, &stores)
    }

    /// Build sources and wiring over already opened stores.
    pub fn open_with(config: &Config, stores: &Stores) -> Result<Self> {
        let client = create_async_client(&config.collector)?;
        let registry = SourceRegistry::from_config(config, client, stores.table.clone())?;
        log::info!("Registered {} sources", registry.len());
        Self::from_config(config, stores, registry)
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    /// Start a run in the background and return immediately.
    ///
    /// The outcome is reported through the status line and run history.
    pub async fn start(&self) -> StartStatus {
        match self.spawn().await {
            Some(_) => StartStatus::Started,
            None => StartStatus::AlreadyInProgress,
        }
    }

    /// Start a run in the background, returning its task.
    ///
    /// Returns `None` if another run holds the lock. Callers that must outlive
    /// the run (a CLI process) await the handle; dropping it detaches the run.
    pub async fn spawn(&self) -> Option<JoinHandle<Result<RunReport>>> {
        let owner = owner_token();
        if !self.lock.acquire(&owner).await {
            log::info!("Collection already in progress");
            return None;
        }
        self.collector.status().set("in progress").await;

        let this = self.clone();
        Some(tokio::spawn(async move { this.run_locked(&owner).await }))
    }

    /// Run a collection to completion.
    ///
    /// Returns `Ok(None)` without running if another run holds the lock.
    pub async fn run_now(&self) -> Result<Option<RunReport>> {
        let owner = owner_token();
        if !self.lock.acquire(&owner).await {
            log::info!("Collection already in progress");
            return Ok(None);
        }
        self.collector.status().set("in progress").await;
        self.run_locked(&owner).await.map(Some)
    }

    async fn run_locked(&self, owner: &str) -> Result<RunReport> {
        let heartbeat = tokio::spawn(heartbeat(self.lock.clone(), owner.to_string()));

        let result = self.collector.run().await;
        heartbeat.abort();

        let status = match &result {
            Ok(report) => format!("Done {}", report.feed.faults.join("\n")),
            Err(e) => {
                log::error!("Collection failed: {}", e);
                format!("Failed: {e}")
            }
        };
        // Terminal status first: once the lock is free the run counts as over
        self.collector.status().set(status.trim_end()).await;
        self.lock.release(owner).await;
        result
    }

    /// The last status line.
    pub async fn status(&self) -> String {
        self.collector.status().get().await
    }

    /// Whether a run currently holds the lock.
    pub async fn is_running(&self) -> bool {
        self.lock.is_locked().await
    }

    /// Drop the cached listings of the given sources.
    ///
    /// Returns the status line written.
    pub async fn invalidate(&self, source_ids: &[String]) -> String {
        for id in source_ids {
            self.collector.events().invalidate(id).await;
        }
        let status = format!("Invalidated cache for: {}", source_ids.join(", "));
        self.collector.status().set(&status).await;
        status
    }

    pub async fn purge_images(&self) -> Result<usize> {
        let removed = self.collector.images().purge().await?;
        self.collector
            .status()
            .set(&format!("Done purge {removed}"))
            .await;
        Ok(removed)
    }

    /// Fetch one image into the cache while holding the collection lock.
    ///
    /// Returns `Ok(None)` if a run holds the lock.
    pub async fn cache_image(&self, url: &str) -> Result<Option<CachedImage>> {
        let owner = owner_token();
        if !self.lock.acquire(&owner).await {
            log::info!("Collection in progress, not caching {}", url);
            return Ok(None);
        }
        let result = self.collector.images().get_or_fetch(url).await;
        if let Ok(cached) = &result {
            self.collector
                .status()
                .set(&format!("Done {}", cached.name))
                .await;
        }
        self.lock.release(&owner).await;
        Ok(Some(result?))
    }

    pub async fn purge_events(&self) -> usize {
        self.collector.events().purge_all().await
    }

    /// Most recent runs, newest first.
    pub async fn history(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let entities: Vec<_> = self
            .table
            .list_partition(RUN_PARTITION)
            .try_collect()
            .await?;

        let mut records: Vec<RunRecord> = entities
            .iter()
            .filter_map(|e| match RunRecord::from_entity(e) {
                Ok(record) => Some(record),
                Err(err) => {
                    log::warn!("Skipping unreadable run record {}: {}", e.row_key, err);
                    None
                }
            })
            .collect();
        records.sort_by(|a, b| b.started.cmp(&a.started));
        records.truncate(limit);
        Ok(records)
    }
}

/// Refresh the lock every third of its window until aborted.
async fn heartbeat(lock: AdvisoryLock, owner: String) {
    let period = Duration::from_millis((lock.stale_after_ms() / 3).max(1) as u64);
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !lock.refresh(&owner).await {
            log::warn!("Lost collection lock for {}", owner);
            return;
        }
    }
}
