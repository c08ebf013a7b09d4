//! Structured entity storage.
//!
//! Entities are keyed by `partitionKey` + `rowKey` and carry a JSON object of
//! properties. Used for run history and for the social pages read by the
//! page-events source.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::{AppError, Result};

/// One stored entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "partitionKey")]
    pub partition_key: String,

    #[serde(rename = "rowKey")]
    pub row_key: String,

    #[serde(flatten)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl Entity {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            properties: serde_json::Map::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    pub fn str_property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(|v| v.as_str())
    }

    fn check_keys(&self) -> Result<()> {
        if self.partition_key.is_empty() || self.row_key.is_empty() {
            return Err(AppError::validation(
                "entity partitionKey and rowKey must be non-empty",
            ));
        }
        Ok(())
    }
}

/// Trait for structured storage backends.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetch one entity. Missing entities and backend failures give `None`.
    async fn get_entity(&self, partition_key: &str, row_key: &str) -> Option<Entity>;

    /// Insert or replace an entity.
    async fn upsert_entity(&self, entity: Entity) -> Result<()>;

    /// Stream every entity in the table.
    fn list_entities(&self) -> BoxStream<'_, Result<Entity>>;

    /// Stream the entities of one partition, in row key order.
    ///
    /// The default scans the table; backends with a partition index override
    /// it.
    fn list_partition(&self, partition_key: &str) -> BoxStream<'_, Result<Entity>> {
        let partition_key = partition_key.to_string();
        self.list_entities()
            .try_filter(move |e| future::ready(e.partition_key == partition_key))
            .boxed()
    }

    /// Delete an entity; missing entities are not an error.
    async fn delete_entity(&self, partition_key: &str, row_key: &str) -> Result<()>;
}

type Rows = BTreeMap<(String, String), Entity>;

/// In-memory entity table.
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    rows: Arc<RwLock<Rows>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for MemoryTable {
    async fn get_entity(&self, partition_key: &str, row_key: &str) -> Option<Entity> {
        self.rows
            .read()
            .await
            .get(&(partition_key.to_string(), row_key.to_string()))
            .cloned()
    }

    async fn upsert_entity(&self, entity: Entity) -> Result<()> {
        entity.check_keys()?;
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        self.rows.write().await.insert(key, entity);
        Ok(())
    }

    fn list_entities(&self) -> BoxStream<'_, Result<Entity>> {
        stream::once(async move {
            let rows: Vec<Result<Entity>> =
                self.rows.read().await.values().cloned().map(Ok).collect();
            stream::iter(rows)
        })
        .flatten()
        .boxed()
    }

    fn list_partition(&self, partition_key: &str) -> BoxStream<'_, Result<Entity>> {
        let partition_key = partition_key.to_string();
        stream::once(async move {
            let rows: Vec<Result<Entity>> = self
                .rows
                .read()
                .await
                .range((partition_key.clone(), String::new())..)
                .take_while(|((pk, _), _)| *pk == partition_key)
                .map(|(_, entity)| Ok(entity.clone()))
                .collect();
            stream::iter(rows)
        })
        .flatten()
        .boxed()
    }

    async fn delete_entity(&self, partition_key: &str, row_key: &str) -> Result<()> {
        self.rows
            .write()
            .await
            .remove(&(partition_key.to_string(), row_key.to_string()));
        Ok(())
    }
}

/// Entity table kept in a single JSON file.
///
/// Every operation loads and rewrites the whole file under a process-local
/// mutex. Fine for the handful of pages and run records a local deployment
/// keeps.
#[derive(Debug, Clone)]
pub struct LocalTable {
    path: PathBuf,
    guard: Arc<Mutex<()>>,
}

impl LocalTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Arc::new(Mutex::new(())),
        }
    }

    async fn load(&self) -> Result<Vec<Entity>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    async fn save(&self, rows: &[Entity]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(rows)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl EntityStore for LocalTable {
    async fn get_entity(&self, partition_key: &str, row_key: &str) -> Option<Entity> {
        let _guard = self.guard.lock().await;
        match self.load().await {
            Ok(rows) => rows
                .into_iter()
                .find(|e| e.partition_key == partition_key && e.row_key == row_key),
            Err(e) => {
                log::warn!("Reading table {:?} failed: {}", self.path, e);
                None
            }
        }
    }

    async fn upsert_entity(&self, entity: Entity) -> Result<()> {
        entity.check_keys()?;
        let _guard = self.guard.lock().await;
        let mut rows = self.load().await?;
        match rows.iter_mut().find(|e| {
            e.partition_key == entity.partition_key && e.row_key == entity.row_key
        }) {
            Some(existing) => *existing = entity,
            None => rows.push(entity),
        }
        self.save(&rows).await
    }

    fn list_entities(&self) -> BoxStream<'_, Result<Entity>> {
        stream::once(async move {
            let _guard = self.guard.lock().await;
            let rows: Vec<Result<Entity>> = match self.load().await {
                Ok(rows) => rows.into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(rows)
        })
        .flatten()
        .boxed()
    }

    async fn delete_entity(&self, partition_key: &str, row_key: &str) -> Result<()> {
        let _guard = self.guard.lock().await;
        let mut rows = self.load().await?;
        let before = rows.len();
        rows.retain(|e| !(e.partition_key == partition_key && e.row_key == row_key));
        if rows.len() != before {
            self.save(&rows).await?;
        }
        Ok(())
    }
}
