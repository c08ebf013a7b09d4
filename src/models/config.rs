//! Application configuration structures.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{Category, ListingSelectors};
use crate::services::cache_key;
use crate::utils::security::sanitize_key;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP and collection behavior settings
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Image cache limits and output settings
    #[serde(default)]
    pub image: ImageConfig,

    /// Advisory lock settings
    #[serde(default)]
    pub lock: LockConfig,

    /// Run history retention
    #[serde(default)]
    pub history: HistoryConfig,

    /// Storage backend selection
    #[serde(default)]
    pub storage: StorageConfig,

    /// Event sources to collect from
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Override settings from environment variables.
    ///
    /// Used where no config file is bundled (Lambda).
    pub fn apply_env(&mut self) {
        if let Some(secs) = env_parse("GIGFEED_SOURCE_TIMEOUT_SECS") {
            self.collector.source_timeout_secs = secs;
        }
        if let Some(secs) = env_parse("GIGFEED_HTTP_TIMEOUT_SECS") {
            self.collector.timeout_secs = secs;
        }
        if let Some(ms) = env_parse("GIGFEED_LOCK_STALE_MS") {
            self.lock.stale_after_ms = ms;
        }
        if let Some(keep) = env_parse("GIGFEED_HISTORY_KEEP") {
            self.history.keep = keep;
        }
        if let Some(width) = env_parse("GIGFEED_IMAGE_WIDTH") {
            self.image.target_width = width;
        }
        if let Ok(bucket) = std::env::var("S3_BUCKET") {
            self.storage.bucket = bucket;
        }
        if let Ok(prefix) = std::env::var("S3_PREFIX") {
            self.storage.prefix = prefix;
        }
        if let Ok(table) = std::env::var("TABLE_NAME") {
            self.storage.table_name = table;
        }
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.collector.user_agent.trim().is_empty() {
            return Err(AppError::validation("collector.user_agent is empty"));
        }
        if self.collector.timeout_secs == 0 {
            return Err(AppError::validation("collector.timeout_secs must be > 0"));
        }
        if self.collector.source_timeout_secs == 0 {
            return Err(AppError::validation(
                "collector.source_timeout_secs must be > 0",
            ));
        }
        if self.image.target_width == 0 {
            return Err(AppError::validation("image.target_width must be > 0"));
        }
        if self.image.max_bytes == 0 || self.image.max_dimension == 0 {
            return Err(AppError::validation("image limits must be > 0"));
        }
        if self.lock.stale_after_ms == 0 {
            return Err(AppError::validation("lock.stale_after_ms must be > 0"));
        }
        if self.history.keep == 0 {
            return Err(AppError::validation("history.keep must be > 0"));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            // The id must also fit inside the event cache's key
            sanitize_key(&cache_key(&source.id)).map_err(|_| {
                AppError::validation(format!("source id '{}' is not a safe key", source.id))
            })?;
            if !seen.insert(source.id.as_str()) {
                return Err(AppError::validation(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }
            if source.kind != SourceKind::PageEvents && source.url.trim().is_empty() {
                return Err(AppError::validation(format!(
                    "source '{}' has no url",
                    source.id
                )));
            }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// HTTP client and collection behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Per-request HTTP timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Upper bound on one source's whole fetch, in seconds
    #[serde(default = "defaults::source_timeout")]
    pub source_timeout_secs: u64,

    /// Maximum description length kept on a show
    #[serde(default = "defaults::text_length")]
    pub text_length: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            source_timeout_secs: defaults::source_timeout(),
            text_length: defaults::text_length(),
        }
    }
}

/// Image cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Width of stored thumbnails in pixels
    #[serde(default = "defaults::target_width")]
    pub target_width: u32,

    /// Largest accepted download in bytes
    #[serde(default = "defaults::max_bytes")]
    pub max_bytes: u64,

    /// Largest accepted width or height in pixels
    #[serde(default = "defaults::max_dimension")]
    pub max_dimension: u32,

    /// Prefix prepended to cache names when rewriting show images
    #[serde(default = "defaults::public_prefix")]
    pub public_prefix: String,

    /// Check resolved addresses of hostnames against blocked ranges
    #[serde(default = "defaults::resolve_dns")]
    pub resolve_dns: bool,

    /// Hosts exempt from address checks
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            target_width: defaults::target_width(),
            max_bytes: defaults::max_bytes(),
            max_dimension: defaults::max_dimension(),
            public_prefix: defaults::public_prefix(),
            resolve_dns: defaults::resolve_dns(),
            allowed_hosts: Vec::new(),
        }
    }
}

/// Advisory lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Age after which a lock record is treated as expired
    #[serde(default = "defaults::stale_after_ms")]
    pub stale_after_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: defaults::stale_after_ms(),
        }
    }
}

/// Run history retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Number of most recent run records kept in the structured store
    #[serde(default = "defaults::history_keep")]
    pub keep: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            keep: defaults::history_keep(),
        }
    }
}

/// Byte store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobBackend {
    Local,
    Memory,
    S3,
}

/// Structured store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableBackend {
    Local,
    Memory,
    Dynamodb,
}

/// Storage backend selection and locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "defaults::blob_backend")]
    pub backend: BlobBackend,

    #[serde(default = "defaults::table_backend")]
    pub table_backend: TableBackend,

    /// Root directory for local storage
    #[serde(default = "defaults::root")]
    pub root: String,

    /// S3 bucket name
    #[serde(default = "defaults::bucket")]
    pub bucket: String,

    /// S3 key prefix
    #[serde(default = "defaults::prefix")]
    pub prefix: String,

    /// Table name for the structured store
    #[serde(default = "defaults::table_name")]
    pub table_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: defaults::blob_backend(),
            table_backend: defaults::table_backend(),
            root: defaults::root(),
            bucket: defaults::bucket(),
            prefix: defaults::prefix(),
            table_name: defaults::table_name(),
        }
    }
}

/// How a source's listing is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// HTML page scraped with CSS selectors
    Html,
    /// Endpoint returning a JSON array of shows
    Json,
    /// Social-platform events for pages registered in the table store
    PageEvents,
}

/// One configured event source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Stable identifier, also used as the promoter tag
    pub id: String,

    /// Display label
    #[serde(default)]
    pub label: String,

    pub kind: SourceKind,

    /// Listing URL, or API base for page events
    #[serde(default)]
    pub url: String,

    /// Venue name applied when rows don't carry one
    #[serde(default)]
    pub venue: String,

    /// Fixed category; inferred from text when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,

    /// chrono format string for row dates (e.g. "%d/%m/%Y %H:%M")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_format: Option<String>,

    /// Selectors for HTML sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selectors: Option<ListingSelectors>,
}

impl SourceConfig {
    /// Label to display, falling back to the id.
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

mod defaults {
    use super::{BlobBackend, TableBackend};

    // Collector defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; gigfeed/0.1)".into()
    }
    pub fn timeout() -> u64 {
        30
    }
    pub fn source_timeout() -> u64 {
        60
    }
    pub fn text_length() -> usize {
        200
    }

    // Image defaults
    pub fn target_width() -> u32 {
        300
    }
    pub fn max_bytes() -> u64 {
        10 * 1024 * 1024
    }
    pub fn max_dimension() -> u32 {
        10_000
    }
    pub fn public_prefix() -> String {
        "/pix/".into()
    }
    pub fn resolve_dns() -> bool {
        true
    }

    // Lock defaults
    pub fn stale_after_ms() -> u64 {
        3000
    }

    pub fn history_keep() -> usize {
        50
    }

    // Storage defaults
    pub fn blob_backend() -> BlobBackend {
        BlobBackend::Local
    }
    pub fn table_backend() -> TableBackend {
        TableBackend::Local
    }
    pub fn root() -> String {
        "client".into()
    }
    pub fn bucket() -> String {
        "gigfeed-events".into()
    }
    pub fn prefix() -> String {
        "client".into()
    }
    pub fn table_name() -> String {
        "gigfeed".into()
    }
}
