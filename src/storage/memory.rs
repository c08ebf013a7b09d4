//! In-memory storage backend.
//!
//! Holds objects for the life of the process. Used by tests and by
//! deployments that only need the feed for one run.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::storage::{BlobStore, Entry};

#[derive(Debug, Clone)]
struct Object {
    content_type: String,
    bytes: Vec<u8>,
    modified_at: DateTime<Utc>,
}

/// In-memory byte store for one namespace.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    name: String,
    objects: Arc<RwLock<BTreeMap<String, Object>>>,
}

impl MemoryStorage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Content type recorded for an object.
    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| o.content_type.clone())
    }

    fn entry(name: &str, object: &Object) -> Entry {
        Entry {
            name: name.to_string(),
            length: Some(object.bytes.len() as u64),
            modified_at: Some(object.modified_at),
        }
    }
}

#[async_trait]
impl BlobStore for MemoryStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.read().await.get(key).map(|o| o.bytes.clone()))
    }

    async fn write(&self, key: &str, content_type: &str, bytes: &[u8]) -> Result<()> {
        self.objects.write().await.insert(
            key.to_string(),
            Object {
                content_type: content_type.to_string(),
                bytes: bytes.to_vec(),
                modified_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn stat(&self, key: &str) -> Result<Option<Entry>> {
        Ok(self
            .objects
            .read()
            .await
            .get(key)
            .map(|o| Self::entry(key, o)))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>> {
        Ok(self
            .objects
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, object)| Self::entry(name, object))
            .collect())
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }
}
