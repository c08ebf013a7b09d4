//! Event sources.
//!
//! Every venue or feed the collector reads is a [`SourceHandler`]. Handlers
//! are registered in a [`SourceRegistry`], whose insertion order is the order
//! shows are merged in.

mod html;
mod json;
mod page_events;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::error::{AppError, Result};
use crate::models::{Config, SourceConfig, SourceKind};
use crate::storage::EntityStore;

pub use html::HtmlSource;
pub use json::JsonSource;
pub use page_events::{PAGE_PARTITION, PageEventsSource};

/// A source of show listings.
#[async_trait]
pub trait SourceHandler: Send + Sync {
    /// Stable identifier, used as the promoter tag and cache key.
    fn id(&self) -> &str;

    /// Display label.
    fn label(&self) -> &str;

    /// Fetch the current listing.
    async fn fetch(&self) -> Result<Vec<crate::models::Show>>;
}

/// Handlers in registration order.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    handlers: Vec<Arc<dyn SourceHandler>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build handlers for every configured source.
    pub fn from_config(
        config: &Config,
        client: reqwest::Client,
        table: Arc<dyn EntityStore>,
    ) -> Result<Self> {
        let mut registry = Self::new();
        let text_length = config.collector.text_length;
        for source in &config.sources {
            let handler: Arc<dyn SourceHandler> = match source.kind {
                SourceKind::Html => {
                    Arc::new(HtmlSource::new(source.clone(), client.clone(), text_length)?)
                }
                SourceKind::Json => {
                    Arc::new(JsonSource::new(source.clone(), client.clone(), text_length)?)
                }
                SourceKind::PageEvents => Arc::new(PageEventsSource::new(
                    source.clone(),
                    client.clone(),
                    table.clone(),
                    text_length,
                )),
            };
            registry.register(handler);
        }
        Ok(registry)
    }

    /// Add a handler. A handler with an id already present replaces the old
    /// one in place.
    pub fn register(&mut self, handler: Arc<dyn SourceHandler>) {
        match self.handlers.iter_mut().find(|h| h.id() == handler.id()) {
            Some(slot) => *slot = handler,
            None => self.handlers.push(handler),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn SourceHandler>> {
        self.handlers.iter().find(|h| h.id() == id)
    }

    pub fn handlers(&self) -> &[Arc<dyn SourceHandler>] {
        &self.handlers
    }

    /// `(id, label)` pairs in registration order.
    pub fn labels(&self) -> Vec<(String, String)> {
        self.handlers
            .iter()
            .map(|h| (h.id().to_string(), h.label().to_string()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Wrap a handler error with the source id.
pub(crate) fn source_error(source: &SourceConfig, e: impl std::fmt::Display) -> AppError {
    AppError::source(&source.id, e)
}

/// Parse a listing date to epoch milliseconds, 0 when it can't be read.
///
/// With a format, the text is read as a timezone-naive date-time (or a bare
/// date, taken at midnight). Without one, only RFC 3339 is recognised.
pub(crate) fn parse_when(raw: &str, format: Option<&str>) -> i64 {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.timestamp_millis();
    }
    let Some(format) = format else {
        return 0;
    };
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
        return naive.and_utc().timestamp_millis();
    }
    NaiveDate::parse_from_str(raw, format)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
        .unwrap_or(0)
}
