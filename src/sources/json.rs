//! JSON listing endpoints.
//!
//! Accepts either a bare array of show objects or a document with a `shows`
//! array (such as another instance's `events.json`).

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::error::Result;
use crate::models::{Category, Show, SourceConfig, truncate_text};
use crate::sources::{SourceHandler, source_error};
use crate::utils::http::fetch_text;
use crate::utils::resolve_url;

#[derive(Deserialize)]
#[serde(untagged)]
enum Listing {
    Shows(Vec<Show>),
    Feed { shows: Vec<Show> },
}

/// An endpoint serving show-shaped JSON.
pub struct JsonSource {
    config: SourceConfig,
    base_url: Url,
    client: Client,
    text_length: usize,
}

impl JsonSource {
    pub fn new(config: SourceConfig, client: Client, text_length: usize) -> Result<Self> {
        let base_url = Url::parse(&config.url)?;
        Ok(Self {
            config,
            base_url,
            client,
            text_length,
        })
    }

    /// Parse and normalize a listing body.
    pub fn parse_listing(&self, body: &str) -> Result<Vec<Show>> {
        let listing: Listing =
            serde_json::from_str(body).map_err(|e| source_error(&self.config, e))?;
        let shows = match listing {
            Listing::Shows(shows) | Listing::Feed { shows } => shows,
        };

        Ok(shows
            .into_iter()
            .filter(|show| !show.title.trim().is_empty())
            .map(|show| self.normalize(show))
            .collect())
    }

    fn normalize(&self, mut show: Show) -> Show {
        if show.venue.is_empty() {
            show.venue = self.config.venue.clone();
        }
        if let Some(category) = self.config.category {
            show.category = category;
        } else if show.category == Category::Live {
            show.category = Category::infer(&show.title, &show.text);
        }
        if !show.url.is_empty() {
            show.url = resolve_url(&self.base_url, &show.url);
        }
        if !show.image.is_empty() && !show.image.starts_with("//") {
            show.image = resolve_url(&self.base_url, &show.image);
        }
        show.text = truncate_text(&show.text, self.text_length);
        // Promoter and image source are set by the collector
        show.promoter.clear();
        show.imagesource.clear();
        show
    }
}

#[async_trait]
impl SourceHandler for JsonSource {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn label(&self) -> &str {
        self.config.display_label()
    }

    async fn fetch(&self) -> Result<Vec<Show>> {
        let body = fetch_text(&self.client, &self.config.url)
            .await
            .map_err(|e| source_error(&self.config, e))?;
        self.parse_listing(&body)
    }
}
