//! Configuration loading for the CLI and Lambda deployments.

use std::path::Path;

use crate::error::{AppError, Result};
use crate::models::{BlobBackend, Config, StorageConfig, TableBackend};
use crate::storage::BlobStore;

/// Name of the configuration object in the admin namespace.
pub const CONFIG_KEY: &str = "config.toml";

/// Load configuration from a TOML file, apply environment overrides and
/// validate.
///
/// A missing or unreadable file falls back to defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = Config::load_or_default(path);
    config.apply_env();
    config.validate()?;
    Ok(config)
}

/// Storage settings for the Lambda: S3 blobs, DynamoDB entities, locations
/// from the environment.
pub fn lambda_storage() -> StorageConfig {
    let mut config = Config {
        storage: StorageConfig {
            backend: BlobBackend::S3,
            table_backend: TableBackend::Dynamodb,
            ..StorageConfig::default()
        },
        ..Config::default()
    };
    config.apply_env();
    config.storage
}

/// Load `config.toml` from a store.
///
/// `storage` always wins over whatever the stored file says, since the store
/// was opened with it. A missing object yields defaults.
pub async fn load_from_store(store: &dyn BlobStore, storage: StorageConfig) -> Result<Config> {
    let mut config = match store.get_string(CONFIG_KEY).await {
        Some(text) => Config::parse(&text).map_err(|e| {
            AppError::config(format!("{} in {}: {}", CONFIG_KEY, store.describe(), e))
        })?,
        None => {
            log::warn!(
                "No {} in {}, using default configuration",
                CONFIG_KEY,
                store.describe()
            );
            Config::default()
        }
    };
    config.apply_env();
    config.storage = storage;
    config.validate()?;
    log::info!(
        "Loaded configuration with {} sources",
        config.sources.len()
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceKind;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_load_config_falls_back() {
        let config = load_config(Path::new("/nonexistent/gigfeed.toml")).unwrap();
        assert!(config.sources.is_empty());
        assert_eq!(config.lock.stale_after_ms, 3000);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[image]
target_width = 320

[[sources]]
id = "feed"
kind = "json"
url = "https://example.com/shows.json"
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.image.target_width, 320);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].kind, SourceKind::Json);
    }

    #[test]
    fn test_load_config_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[[sources]]
id = "dup"
kind = "json"
url = "https://example.com/a.json"

[[sources]]
id = "dup"
kind = "json"
url = "https://example.com/b.json"
"#,
        )
        .unwrap();

        assert!(matches!(load_config(&path), Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_load_from_store() {
        let store = MemoryStorage::new("admin");
        let storage = StorageConfig {
            backend: BlobBackend::Memory,
            table_backend: TableBackend::Memory,
            ..StorageConfig::default()
        };

        let config = load_from_store(&store, storage.clone()).await.unwrap();
        assert!(config.sources.is_empty());

        store
            .put(
                CONFIG_KEY,
                "application/toml",
                b"[storage]\nbackend = \"local\"\n\n[lock]\nstale_after_ms = 5000\n",
            )
            .await
            .unwrap();
        let config = load_from_store(&store, storage).await.unwrap();
        assert_eq!(config.lock.stale_after_ms, 5000);
        assert_eq!(config.storage.backend, BlobBackend::Memory);

        store
            .put(CONFIG_KEY, "application/toml", b"[lock\n")
            .await
            .unwrap();
        let err = load_from_store(&store, StorageConfig::default()).await;
        assert!(matches!(err, Err(AppError::Config(_))));
    }
}
