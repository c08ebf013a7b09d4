// src/pipeline/collect.rs

//! One collection run: fetch every source, fall back to cached listings,
//! merge, cache images and publish the feed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use futures::stream::{FuturesUnordered, StreamExt};

use crate::error::{AppError, Result};
use crate::models::{Config, Feed, RUN_PARTITION, RunOutcome, RunRecord, Show, detect_platform};
use crate::pipeline::merge::merge_shows;
use crate::pipeline::status::StatusReporter;
use crate::services::{EventCache, ImageCache};
use crate::sources::{SourceHandler, SourceRegistry};
use crate::storage::{BlobStore, EntityStore, Stores};
use crate::utils::now_ms;

/// Key of the published feed in the json namespace.
pub const FEED_KEY: &str = "events.json";

/// Mutable state of a single run.
#[derive(Debug, Default)]
pub struct RunContext {
    faults: Vec<String>,
    to_do: BTreeSet<String>,
}

impl RunContext {
    /// Start a run with every source outstanding.
    pub fn new<I, S>(source_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            faults: Vec::new(),
            to_do: source_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fault(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{}", message);
        self.faults.push(message);
    }

    /// Mark a source as having produced shows.
    pub fn complete(&mut self, source_id: &str) {
        self.to_do.remove(source_id);
    }

    pub fn faults(&self) -> &[String] {
        &self.faults
    }

    pub fn to_do(&self) -> &BTreeSet<String> {
        &self.to_do
    }

    fn remaining(&self) -> String {
        self.to_do.iter().cloned().collect::<Vec<_>>().join(" ")
    }
}

/// Result of one source after fallback.
struct SourceOutcome {
    index: usize,
    id: String,
    shows: Vec<Show>,
    fault: Option<String>,
    from_cache: bool,
}

impl SourceOutcome {
    fn done(&self) -> bool {
        !self.shows.is_empty()
    }
}

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub feed: Feed,
    pub started: i64,
    pub finished: i64,
}

impl RunReport {
    pub fn record(&self) -> RunRecord {
        RunRecord {
            started: self.started,
            finished: self.finished,
            shows: self.feed.shows.len(),
            faults: self.feed.faults.clone(),
            to_do: self.feed.to_do.iter().cloned().collect(),
            outcome: RunOutcome::Completed,
            error: None,
        }
    }
}

/// Orchestrates collection runs.
#[derive(Clone)]
pub struct Collector {
    registry: SourceRegistry,
    events: EventCache,
    images: ImageCache,
    feed_store: Arc<dyn BlobStore>,
    table: Arc<dyn EntityStore>,
    status: StatusReporter,
    source_timeout: Duration,
    public_prefix: String,
    history_keep: usize,
}

impl Collector {
    pub fn new(config: &Config, stores: &Stores, registry: SourceRegistry) -> Result<Self> {
        Ok(Self {
            registry,
            events: EventCache::new(stores.json.clone()),
            images: ImageCache::new(stores.pix.clone(), &config.collector, &config.image)?,
            feed_store: stores.json.clone(),
            table: stores.table.clone(),
            status: StatusReporter::new(stores.admin.clone()),
            source_timeout: Duration::from_secs(config.collector.source_timeout_secs),
            public_prefix: config.image.public_prefix.clone(),
            history_keep: config.history.keep,
        })
    }

    /// Override the per-source timeout.
    pub fn with_source_timeout(mut self, timeout: Duration) -> Self {
        self.source_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventCache {
        &self.events
    }

    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    /// Run one collection and record its outcome in the run history.
    ///
    /// Only a failure to write the feed is returned as an error; source and
    /// image problems end up in the feed's `faults`.
    pub async fn run(&self) -> Result<RunReport> {
        let started = now_ms();
        match self.execute(started).await {
            Ok(report) => {
                self.record(report.record()).await;
                Ok(report)
            }
            Err(e) => {
                self.record(RunRecord {
                    started,
                    finished: now_ms(),
                    shows: 0,
                    faults: Vec::new(),
                    to_do: Vec::new(),
                    outcome: RunOutcome::Failed,
                    error: Some(e.to_string()),
                })
                .await;
                Err(e)
            }
        }
    }

    async fn execute(&self, started: i64) -> Result<RunReport> {
        let handlers = self.registry.handlers();
        let mut ctx = RunContext::new(handlers.iter().map(|h| h.id().to_string()));
        log::info!("Collecting from {} sources", handlers.len());
        self.status
            .set(&format!("Remaining sources: {}", ctx.remaining()))
            .await;

        // Fetch every source concurrently; fallback happens inside each task
        let mut listings: Vec<Vec<Show>> = vec![Vec::new(); handlers.len()];
        let mut outcomes: FuturesUnordered<_> = handlers
            .iter()
            .enumerate()
            .map(|(index, handler)| self.resolve(index, Arc::clone(handler)))
            .collect();

        while let Some(outcome) = outcomes.next().await {
            if let Some(fault) = &outcome.fault {
                ctx.fault(fault.clone());
            }
            if outcome.done() {
                ctx.complete(&outcome.id);
                let status = if outcome.from_cache {
                    format!(
                        "Using cached events for {}. Remaining: {}",
                        outcome.id,
                        ctx.remaining()
                    )
                } else {
                    format!("Remaining sources: {}", ctx.remaining())
                };
                self.status.set(&status).await;
            }
            listings[outcome.index] = outcome.shows;
        }
        drop(outcomes);

        let mut shows = merge_shows(listings);
        let categories = Feed::tally(&shows);
        log::info!("Merged {} shows", shows.len());

        self.cache_images(&mut shows, &mut ctx).await;

        let feed = Feed {
            promoters: self.registry.labels().into_iter().collect::<BTreeMap<_, _>>(),
            categories,
            shows,
            to_do: ctx.to_do().clone(),
            faults: ctx.faults().to_vec(),
            date: now_ms(),
            platform: detect_platform().to_string(),
        };

        let json = serde_json::to_vec_pretty(&feed)?;
        self.feed_store
            .put(FEED_KEY, "application/json", &json)
            .await
            .map_err(|e| AppError::persist(format!("writing {FEED_KEY}: {e}")))?;
        log::info!(
            "Saved {} shows to {} ({} faults)",
            feed.shows.len(),
            FEED_KEY,
            feed.faults.len()
        );

        Ok(RunReport {
            feed,
            started,
            finished: now_ms(),
        })
    }

    /// Fetch one source, applying the cache fallback.
    async fn resolve(&self, index: usize, handler: Arc<dyn SourceHandler>) -> SourceOutcome {
        let id = handler.id().to_string();
        let fetched = match tokio::time::timeout(self.source_timeout, handler.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(id.clone())),
        };

        let outcome = |shows: Vec<Show>, fault: Option<String>, from_cache: bool| SourceOutcome {
            index,
            id: id.clone(),
            shows,
            fault,
            from_cache,
        };

        match fetched {
            Ok(mut shows) if !shows.is_empty() => {
                tag(&mut shows, &id);
                log::info!("{}: {} shows", id, shows.len());
                self.events.set(&id, &shows).await;
                outcome(shows, None, false)
            }
            Ok(_) => match self.cached(&id).await {
                Some(shows) => outcome(shows, None, true),
                None => outcome(
                    Vec::new(),
                    Some(format!("No events from {id} (fresh or cached)")),
                    false,
                ),
            },
            Err(e) => match self.cached(&id).await {
                Some(shows) => outcome(
                    shows,
                    Some(format!("Error getting {id}, using cache: {e}")),
                    true,
                ),
                None => outcome(Vec::new(), Some(format!("Getting {id} {e}")), false),
            },
        }
    }

    async fn cached(&self, id: &str) -> Option<Vec<Show>> {
        let mut shows = self.events.get(id).await.filter(|s| !s.is_empty())?;
        tag(&mut shows, id);
        log::info!("{}: using {} cached shows", id, shows.len());
        Some(shows)
    }

    /// Replace each show's image with its cached copy, one at a time.
    async fn cache_images(&self, shows: &mut [Show], ctx: &mut RunContext) {
        let total = shows.len();
        for (i, show) in shows.iter_mut().enumerate() {
            show.imagesource = show.image.clone();
            if !show.image.is_empty() {
                match self.images.get_or_fetch(&show.image).await {
                    Ok(cached) => show.image = format!("{}{}", self.public_prefix, cached.name),
                    Err(e) => ctx.fault(format!("Image for {}: {}", show.title, e)),
                }
            }
            self.status
                .set(&format!("Converting images: {} / {}", i + 1, total))
                .await;
        }
        self.status
            .set(&format!("Converted {total} images"))
            .await;
    }

    async fn record(&self, record: RunRecord) {
        let entity = match record.to_entity() {
            Ok(entity) => entity,
            Err(e) => {
                log::warn!("Encoding run record failed: {}", e);
                return;
            }
        };
        if let Err(e) = self.table.upsert_entity(entity).await {
            log::warn!("Saving run record failed: {}", e);
            return;
        }
        if let Err(e) = self.prune_history().await {
            log::warn!("Pruning run history failed: {}", e);
        }
    }

    /// Delete all but the newest `history_keep` run records.
    async fn prune_history(&self) -> Result<()> {
        let mut row_keys: Vec<String> = self
            .table
            .list_partition(RUN_PARTITION)
            .map_ok(|entity| entity.row_key)
            .try_collect()
            .await?;
        if row_keys.len() <= self.history_keep {
            return Ok(());
        }
        // Row keys are zero-padded start times
        row_keys.sort();
        let stale = row_keys.len() - self.history_keep;
        for row_key in &row_keys[..stale] {
            self.table.delete_entity(RUN_PARTITION, row_key).await?;
        }
        log::debug!("Pruned {} run records", stale);
        Ok(())
    }
}

fn tag(shows: &mut [Show], promoter: &str) {
    for show in shows {
        show.promoter = promoter.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;
    use crate::storage::Entry;
    use async_trait::async_trait;

    /// Handler returning a canned result.
    struct Canned {
        id: &'static str,
        result: std::result::Result<Vec<Show>, String>,
        delay: Option<Duration>,
    }

    impl Canned {
        fn shows(id: &'static str, count: usize) -> Arc<Self> {
            let shows = (0..count)
                .map(|i| Show {
                    title: format!("{id} show {i}"),
                    venue: format!("{id} venue"),
                    dt: (i as i64 + 1) * 1000,
                    ..Show::default()
                })
                .collect();
            Arc::new(Self {
                id,
                result: Ok(shows),
                delay: None,
            })
        }

        fn failing(id: &'static str) -> Arc<Self> {
            Arc::new(Self {
                id,
                result: Err("connection refused".to_string()),
                delay: None,
            })
        }

        fn slow(id: &'static str) -> Arc<Self> {
            Arc::new(Self {
                id,
                result: Ok(Vec::new()),
                delay: Some(Duration::from_secs(30)),
            })
        }
    }

    #[async_trait]
    impl SourceHandler for Canned {
        fn id(&self) -> &str {
            self.id
        }

        fn label(&self) -> &str {
            self.id
        }

        async fn fetch(&self) -> Result<Vec<Show>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.result
                .clone()
                .map_err(|message| AppError::source(self.id, message))
        }
    }

    fn registry(handlers: Vec<Arc<Canned>>) -> SourceRegistry {
        let mut registry = SourceRegistry::new();
        for handler in handlers {
            registry.register(handler);
        }
        registry
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.image.resolve_dns = false;
        config.image.allowed_hosts = vec!["127.0.0.1".to_string()];
        config
    }

    async fn seed_cache(stores: &Stores, id: &str, count: usize) {
        let shows: Vec<Show> = (0..count)
            .map(|i| Show {
                title: format!("cached {id} {i}"),
                dt: 500 + i as i64,
                category: Category::Film,
                ..Show::default()
            })
            .collect();
        assert!(EventCache::new(stores.json.clone()).set(id, &shows).await);
    }

    #[tokio::test]
    async fn test_fallback_policy_end_to_end() {
        let stores = Stores::in_memory();
        seed_cache(&stores, "quiet", 3).await;

        let collector = Collector::new(
            &test_config(),
            &stores,
            registry(vec![
                Canned::shows("busy", 5),
                Canned::shows("quiet", 0),
                Canned::failing("broken"),
            ]),
        )
        .unwrap();

        let report = collector.run().await.unwrap();
        let feed = &report.feed;

        assert_eq!(feed.shows.len(), 8);
        assert_eq!(feed.to_do, BTreeSet::from(["broken".to_string()]));
        assert_eq!(feed.faults.len(), 1);
        assert!(feed.faults[0].starts_with("Getting broken"));
        assert_eq!(feed.categories.get(&Category::Film), Some(&3));
        assert_eq!(feed.categories.get(&Category::Live), Some(&5));
        assert_eq!(feed.promoters.len(), 3);

        // Cached shows are tagged with their source and sort first
        assert!(feed.shows[..3].iter().all(|s| s.promoter == "quiet"));
        assert!(feed.shows[3..].iter().all(|s| s.promoter == "busy"));

        // The feed is persisted
        let saved: Feed =
            serde_json::from_slice(&stores.json.get(FEED_KEY).await.unwrap()).unwrap();
        assert_eq!(saved, report.feed);

        // Fresh results were written through to the cache
        let cached = collector.events().get("busy").await.unwrap();
        assert_eq!(cached.len(), 5);

        // One completed run record
        let runs: Vec<_> = stores.table.list_entities().try_collect().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].partition_key, RUN_PARTITION);
        let record = RunRecord::from_entity(&runs[0]).unwrap();
        assert_eq!(record.outcome, RunOutcome::Completed);
        assert_eq!(record.shows, 8);
    }

    #[tokio::test]
    async fn test_run_can_be_spawned() {
        let stores = Stores::in_memory();
        let collector = Arc::new(
            Collector::new(
                &test_config(),
                &stores,
                registry(vec![Canned::shows("busy", 2), Canned::failing("broken")]),
            )
            .unwrap(),
        );

        let task = {
            let collector = Arc::clone(&collector);
            tokio::spawn(async move { collector.run().await })
        };
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.feed.shows.len(), 2);
    }

    #[tokio::test]
    async fn test_run_history_is_pruned() {
        let stores = Stores::in_memory();
        for started in 1..=5 {
            let old = RunRecord {
                started,
                finished: started,
                shows: 0,
                faults: Vec::new(),
                to_do: Vec::new(),
                outcome: RunOutcome::Completed,
                error: None,
            };
            stores.table.upsert_entity(old.to_entity().unwrap()).await.unwrap();
        }
        stores
            .table
            .upsert_entity(crate::storage::Entity::new("page", "111"))
            .await
            .unwrap();

        let mut config = test_config();
        config.history.keep = 3;
        let collector =
            Collector::new(&config, &stores, registry(vec![Canned::shows("busy", 1)])).unwrap();
        let report = collector.run().await.unwrap();

        let runs: Vec<RunRecord> = stores
            .table
            .list_partition(RUN_PARTITION)
            .map_ok(|e| RunRecord::from_entity(&e).unwrap())
            .try_collect()
            .await
            .unwrap();
        let started: Vec<i64> = runs.iter().map(|r| r.started).collect();
        assert_eq!(started, vec![4, 5, report.started]);
        assert!(stores.table.get_entity("page", "111").await.is_some());
    }

    #[tokio::test]
    async fn test_error_with_cache_is_a_fault_but_done() {
        let stores = Stores::in_memory();
        seed_cache(&stores, "broken", 2).await;

        let collector =
            Collector::new(&test_config(), &stores, registry(vec![Canned::failing("broken")]))
                .unwrap();
        let report = collector.run().await.unwrap();

        assert_eq!(report.feed.shows.len(), 2);
        assert!(report.feed.to_do.is_empty());
        assert_eq!(report.feed.faults.len(), 1);
        assert!(
            report.feed.faults[0].starts_with("Error getting broken, using cache:"),
            "{}",
            report.feed.faults[0]
        );
    }

    #[tokio::test]
    async fn test_empty_without_cache() {
        let stores = Stores::in_memory();
        let collector =
            Collector::new(&test_config(), &stores, registry(vec![Canned::shows("quiet", 0)]))
                .unwrap();
        let report = collector.run().await.unwrap();

        assert!(report.feed.shows.is_empty());
        assert_eq!(
            report.feed.faults,
            vec!["No events from quiet (fresh or cached)".to_string()]
        );
        assert!(collector.events().get("quiet").await.is_none());
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let stores = Stores::in_memory();
        let collector = Collector::new(
            &test_config(),
            &stores,
            registry(vec![Canned::slow("slow"), Canned::shows("fast", 1)]),
        )
        .unwrap()
        .with_source_timeout(Duration::from_millis(50));

        let report = collector.run().await.unwrap();
        assert_eq!(report.feed.shows.len(), 1);
        assert_eq!(report.feed.to_do, BTreeSet::from(["slow".to_string()]));
        assert!(report.feed.faults[0].contains("timed out"));
    }

    #[tokio::test]
    async fn test_images_are_rewritten() {
        use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
        use std::io::Cursor;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mut png = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 40, Rgb([1, 2, 3])))
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok.png"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(png, "image/png"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let good = format!("{}/ok.png", server.uri());
        let bad = format!("{}/missing.png", server.uri());
        let handler = Arc::new(Canned {
            id: "pics",
            result: Ok(vec![
                Show {
                    title: "With picture".to_string(),
                    image: good.clone(),
                    dt: 1,
                    ..Show::default()
                },
                Show {
                    title: "Broken picture".to_string(),
                    image: bad.clone(),
                    dt: 2,
                    ..Show::default()
                },
                Show {
                    title: "No picture".to_string(),
                    dt: 3,
                    ..Show::default()
                },
            ]),
            delay: None,
        });

        let stores = Stores::in_memory();
        let collector = Collector::new(&test_config(), &stores, registry(vec![handler])).unwrap();
        let report = collector.run().await.unwrap();
        let shows = &report.feed.shows;

        assert!(shows[0].image.starts_with("/pix/"));
        assert_eq!(shows[0].imagesource, good);
        assert!(stores.pix.has(&shows[0].image["/pix/".len()..]).await.is_some());

        assert_eq!(shows[1].image, bad);
        assert_eq!(shows[1].imagesource, bad);
        assert!(shows[2].image.is_empty());

        assert_eq!(report.feed.faults.len(), 1);
        assert!(report.feed.faults[0].contains("Broken picture"));
        assert_eq!(collector.status().get().await, "Converted 3 images");
    }

    /// Store whose writes always fail.
    struct ReadOnly;

    #[async_trait]
    impl BlobStore for ReadOnly {
        async fn read(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn write(&self, _key: &str, _content_type: &str, _bytes: &[u8]) -> Result<()> {
            Err(AppError::storage("read-only"))
        }
        async fn stat(&self, _key: &str) -> Result<Option<Entry>> {
            Ok(None)
        }
        async fn remove(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        async fn list(&self, _prefix: &str) -> Result<Vec<Entry>> {
            Ok(Vec::new())
        }
        fn describe(&self) -> String {
            "read-only".to_string()
        }
    }

    #[tokio::test]
    async fn test_persist_failure_is_returned_and_recorded() {
        let stores = Stores {
            json: Arc::new(ReadOnly),
            ..Stores::in_memory()
        };
        let collector =
            Collector::new(&test_config(), &stores, registry(vec![Canned::shows("busy", 2)]))
                .unwrap();

        let err = collector.run().await.unwrap_err();
        assert!(matches!(err, AppError::Persist(_)));

        let runs: Vec<_> = stores.table.list_entities().try_collect().await.unwrap();
        let record = RunRecord::from_entity(&runs[0]).unwrap();
        assert_eq!(record.outcome, RunOutcome::Failed);
        assert!(record.error.unwrap().contains("read-only"));
    }
}
