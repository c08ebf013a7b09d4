//! Local filesystem storage implementation.
//!
//! One directory per namespace; each object is a file named after its key.
//! Used for development and single-host deployments. Serverless deployments
//! should use `S3Storage`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::storage::{BlobStore, Entry};

/// Local filesystem storage backend.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root_dir: PathBuf,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    /// Get the full path for a relative key.
    fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    /// Write bytes atomically (write to temp, then rename).
    ///
    /// The temp file is a dotfile so a concurrent purge or listing skips it.
    async fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.root_dir).await?;

        let path = self.path(key);
        let tmp = self.path(&format!(".{key}.tmp"));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    fn entry_from_metadata(name: String, metadata: &std::fs::Metadata) -> Entry {
        Entry {
            name,
            length: Some(metadata.len()),
            modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
        }
    }
}

fn not_found(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound
}

#[async_trait]
impl BlobStore for LocalStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if not_found(&e) => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    async fn write(&self, key: &str, _content_type: &str, bytes: &[u8]) -> Result<()> {
        self.write_bytes(key, bytes).await
    }

    async fn stat(&self, key: &str) -> Result<Option<Entry>> {
        match tokio::fs::metadata(self.path(key)).await {
            Ok(metadata) if metadata.is_file() => {
                Ok(Some(Self::entry_from_metadata(key.to_string(), &metadata)))
            }
            Ok(_) => Ok(None),
            Err(e) if not_found(&e) => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if not_found(&e) => Ok(()),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>> {
        let mut dir = match tokio::fs::read_dir(&self.root_dir).await {
            Ok(dir) => dir,
            Err(e) if not_found(&e) => return Ok(Vec::new()),
            Err(e) => return Err(AppError::Io(e)),
        };

        let mut entries = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let Ok(name) = item.file_name().into_string() else {
                continue;
            };
            if !name.starts_with(prefix) {
                continue;
            }
            let metadata = item.metadata().await?;
            if metadata.is_file() {
                entries.push(Self::entry_from_metadata(name, &metadata));
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn describe(&self) -> String {
        display_path(&self.root_dir)
    }
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}
