//! Per-source fallback cache of the last non-empty event list.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::Show;
use crate::storage::BlobStore;
use crate::utils::now_ms;

const KEY_PREFIX: &str = "cache-";

/// Stored form of one source's cached events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCacheEntry {
    pub events: Vec<Show>,

    /// Epoch milliseconds when the entry was written
    pub cached: i64,

    pub count: usize,
}

/// Storage key for a source's cache entry.
pub fn cache_key(source_id: &str) -> String {
    format!("{KEY_PREFIX}{source_id}.json")
}

/// Event cache backed by the json namespace.
#[derive(Clone)]
pub struct EventCache {
    store: Arc<dyn BlobStore>,
}

impl EventCache {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    /// Cached events for a source. Missing or corrupt entries give `None`.
    pub async fn get(&self, source_id: &str) -> Option<Vec<Show>> {
        let key = cache_key(source_id);
        let bytes = self.store.get(&key).await?;
        match serde_json::from_slice::<EventCacheEntry>(&bytes) {
            Ok(entry) => Some(entry.events),
            Err(e) => {
                log::warn!("Ignoring corrupt event cache {}: {}", key, e);
                None
            }
        }
    }

    /// Replace a source's cached events.
    ///
    /// Empty lists are never cached, so a source that temporarily returns
    /// nothing keeps its last good listing. Returns whether an entry was
    /// written.
    pub async fn set(&self, source_id: &str, events: &[Show]) -> bool {
        if events.is_empty() {
            return false;
        }
        let entry = EventCacheEntry {
            events: events.to_vec(),
            cached: now_ms(),
            count: events.len(),
        };
        let json = match serde_json::to_vec(&entry) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("Serializing event cache for {} failed: {}", source_id, e);
                return false;
            }
        };
        match self
            .store
            .put(&cache_key(source_id), "application/json", &json)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Writing event cache for {} failed: {}", source_id, e);
                false
            }
        }
    }

    /// Drop a source's cached events.
    pub async fn invalidate(&self, source_id: &str) {
        match self.store.delete(&cache_key(source_id)).await {
            Ok(()) => log::info!("Invalidated event cache for {}", source_id),
            Err(e) => log::warn!("Invalidating event cache for {} failed: {}", source_id, e),
        }
    }

    /// Drop every source's cached events. Returns the number removed.
    pub async fn purge_all(&self) -> usize {
        let entries = match self.store.list(KEY_PREFIX).await {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Listing event caches failed: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries {
            match self.store.delete(&entry.name).await {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("Deleting {} failed: {}", entry.name, e),
            }
        }
        log::info!("Purged {} event caches", removed);
        removed
    }
}
