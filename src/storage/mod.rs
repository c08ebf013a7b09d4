//! Storage abstractions shared by every cache and the feed writer.
//!
//! Two kinds of store, each with interchangeable backends chosen once at
//! startup from [`StorageConfig`]:
//!
//! - [`BlobStore`]: named byte objects in one namespace (local directory,
//!   memory, or an S3 prefix).
//! - [`EntityStore`]: `partitionKey`/`rowKey` entities (local JSON table,
//!   memory, or DynamoDB).
//!
//! ## Namespaces
//!
//! ```text
//! {root}/
//! ├── status.txt            # Last progress/status line
//! ├── collect.lock          # Advisory lock record
//! ├── json/
//! │   ├── events.json       # The published feed
//! │   └── cache-{id}.json   # Per-source fallback events
//! └── pix/
//!     └── {hash}.jpg        # Resized images
//! ```

pub mod local;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;
pub mod table;
#[cfg(feature = "dynamodb")]
pub mod dynamo;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::models::{BlobBackend, StorageConfig, TableBackend};
use crate::utils::security::sanitize_key;

// Re-export for convenience
pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use table::{Entity, EntityStore, LocalTable, MemoryTable};

/// Namespace for resized images.
pub const PIX_NAMESPACE: &str = "pix";
/// Namespace for the feed and per-source event caches.
pub const JSON_NAMESPACE: &str = "json";

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Full name within the namespace, including any extension
    pub name: String,
    pub length: Option<u64>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl Entry {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            length: None,
            modified_at: None,
        }
    }
}

/// Trait for byte storage backends.
///
/// Backends implement the raw operations (`read`, `write`, `stat`, `remove`,
/// `list`); callers use the provided methods, which sanitize keys and give
/// reads "absent" semantics instead of errors.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read an object's bytes, `None` if missing.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Create or overwrite an object.
    async fn write(&self, key: &str, content_type: &str, bytes: &[u8]) -> Result<()>;

    /// Exact-name metadata lookup.
    async fn stat(&self, key: &str) -> Result<Option<Entry>>;

    /// Remove an object; missing objects are not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// List objects whose name starts with `prefix`, in name order.
    async fn list(&self, prefix: &str) -> Result<Vec<Entry>>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Read an object. Invalid keys, missing keys and backend failures all
    /// resolve to `None`.
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let key = match sanitize_key(key) {
            Ok(key) => key,
            Err(e) => {
                log::warn!("Refusing read from {}: {}", self.describe(), e);
                return None;
            }
        };
        match self.read(key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Read of {} from {} failed: {}", key, self.describe(), e);
                None
            }
        }
    }

    /// Read an object as UTF-8 text.
    async fn get_string(&self, key: &str) -> Option<String> {
        let bytes = self.get(key).await?;
        String::from_utf8(bytes).ok()
    }

    /// Store an object, overwriting any existing one.
    async fn put(&self, key: &str, content_type: &str, bytes: &[u8]) -> Result<()> {
        let key = sanitize_key(key).map_err(|e| AppError::validation(e.to_string()))?;
        self.write(key, content_type, bytes).await
    }

    /// Find an object by exact name or, when `key` has no extension, by the
    /// first object whose name starts with it.
    async fn has(&self, key: &str) -> Option<Entry> {
        let key = sanitize_key(key).ok()?;
        match self.stat(key).await {
            Ok(Some(entry)) => return Some(entry),
            Ok(None) => {}
            Err(e) => {
                log::warn!("Lookup of {} in {} failed: {}", key, self.describe(), e);
                return None;
            }
        }
        if key.contains('.') {
            return None;
        }
        match self.list(key).await {
            Ok(entries) => entries.into_iter().next(),
            Err(e) => {
                log::warn!("Listing {} in {} failed: {}", key, self.describe(), e);
                None
            }
        }
    }

    /// Delete an object.
    async fn delete(&self, key: &str) -> Result<()> {
        let key = sanitize_key(key).map_err(|e| AppError::validation(e.to_string()))?;
        self.remove(key).await
    }

    /// Delete every object in the namespace except dotfiles.
    ///
    /// Returns the number of objects removed.
    async fn purge(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in self.list("").await? {
            if entry.name.starts_with('.') {
                continue;
            }
            self.remove(&entry.name).await?;
            removed += 1;
        }
        log::info!("Purged {} objects from {}", removed, self.describe());
        Ok(removed)
    }
}

/// The stores used by one process, opened once at startup.
#[derive(Clone)]
pub struct Stores {
    /// Resized images
    pub pix: Arc<dyn BlobStore>,
    /// Feed document and event caches
    pub json: Arc<dyn BlobStore>,
    /// Status line and lock record
    pub admin: Arc<dyn BlobStore>,
    /// Structured entities (run history, social pages)
    pub table: Arc<dyn EntityStore>,
}

impl Stores {
    /// Open the configured backends.
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        let (pix, json, admin) = match config.backend {
            BlobBackend::Local => {
                let root = PathBuf::from(&config.root);
                (
                    Arc::new(LocalStorage::new(root.join(PIX_NAMESPACE))) as Arc<dyn BlobStore>,
                    Arc::new(LocalStorage::new(root.join(JSON_NAMESPACE))) as Arc<dyn BlobStore>,
                    Arc::new(LocalStorage::new(root)) as Arc<dyn BlobStore>,
                )
            }
            BlobBackend::Memory => (
                Arc::new(MemoryStorage::new(PIX_NAMESPACE)) as Arc<dyn BlobStore>,
                Arc::new(MemoryStorage::new(JSON_NAMESPACE)) as Arc<dyn BlobStore>,
                Arc::new(MemoryStorage::new("admin")) as Arc<dyn BlobStore>,
            ),
            BlobBackend::S3 => open_s3(config).await?,
        };

        let table: Arc<dyn EntityStore> = match config.table_backend {
            TableBackend::Local => Arc::new(LocalTable::new(
                PathBuf::from(&config.root).join(format!("{}.table.json", config.table_name)),
            )),
            TableBackend::Memory => Arc::new(MemoryTable::new()),
            TableBackend::Dynamodb => open_dynamo(config).await?,
        };

        log::info!(
            "Storage: images in {}, feed in {}, admin in {}",
            pix.describe(),
            json.describe(),
            admin.describe()
        );

        Ok(Self {
            pix,
            json,
            admin,
            table,
        })
    }

    /// Fresh in-memory stores.
    pub fn in_memory() -> Self {
        Self {
            pix: Arc::new(MemoryStorage::new(PIX_NAMESPACE)),
            json: Arc::new(MemoryStorage::new(JSON_NAMESPACE)),
            admin: Arc::new(MemoryStorage::new("admin")),
            table: Arc::new(MemoryTable::new()),
        }
    }
}

type BlobTriple = (Arc<dyn BlobStore>, Arc<dyn BlobStore>, Arc<dyn BlobStore>);

#[cfg(feature = "s3")]
async fn open_s3(config: &StorageConfig) -> Result<BlobTriple> {
    let s3 = s3::S3Storage::from_env(&config.bucket, &config.prefix).await;
    Ok((
        Arc::new(s3.with_namespace(PIX_NAMESPACE)),
        Arc::new(s3.with_namespace(JSON_NAMESPACE)),
        Arc::new(s3),
    ))
}

#[cfg(not(feature = "s3"))]
async fn open_s3(_config: &StorageConfig) -> Result<BlobTriple> {
    Err(AppError::config(
        "storage.backend = \"s3\" requires the 's3' feature",
    ))
}

#[cfg(feature = "dynamodb")]
async fn open_dynamo(config: &StorageConfig) -> Result<Arc<dyn EntityStore>> {
    Ok(Arc::new(
        dynamo::DynamoTable::from_env(&config.table_name).await,
    ))
}

#[cfg(not(feature = "dynamodb"))]
async fn open_dynamo(_config: &StorageConfig) -> Result<Arc<dyn EntityStore>> {
    Err(AppError::config(
        "storage.table_backend = \"dynamodb\" requires the 'dynamodb' feature",
    ))
}
