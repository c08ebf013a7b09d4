//! Events published on social-platform pages.
//!
//! Pages are entities in the `page` partition of the structured store, with
//! properties `page_name`, `access_token` and optional `enabled`. The row key
//! is the page id. Each enabled page's upcoming events are read from a
//! Graph-API style endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use futures::TryStreamExt;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::Deserialize;

use crate::error::Result;
use crate::models::{Category, Show, SourceConfig, truncate_text};
use crate::sources::{SourceHandler, source_error};
use crate::storage::{Entity, EntityStore};

/// Partition holding registered pages.
pub const PAGE_PARTITION: &str = "page";

const DEFAULT_API_BASE: &str = "https://graph.facebook.com/v18.0";
const EVENT_FIELDS: &str = "id,name,description,start_time,end_time,cover,place";
const PAGE_CONCURRENCY: usize = 4;

#[derive(Debug, Deserialize)]
struct EventsResponse {
    #[serde(default)]
    data: Vec<PageEvent>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct PageEvent {
    id: String,
    name: Option<String>,
    description: Option<String>,
    start_time: Option<String>,
    cover: Option<Cover>,
    place: Option<Place>,
}

#[derive(Debug, Deserialize)]
struct Cover {
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Place {
    name: Option<String>,
}

/// A registered page.
#[derive(Debug, Clone)]
struct Page {
    id: String,
    name: String,
    token: String,
}

impl Page {
    fn from_entity(entity: &Entity) -> Option<Self> {
        if entity.partition_key != PAGE_PARTITION {
            return None;
        }
        if entity.properties.get("enabled").and_then(|v| v.as_bool()) == Some(false) {
            return None;
        }
        let id = entity
            .str_property("page_id")
            .unwrap_or(&entity.row_key)
            .to_string();
        Some(Self {
            name: entity.str_property("page_name").unwrap_or(&id).to_string(),
            token: entity.str_property("access_token").unwrap_or("").to_string(),
            id,
        })
    }
}

/// Upcoming events from every enabled page.
pub struct PageEventsSource {
    config: SourceConfig,
    client: Client,
    table: Arc<dyn EntityStore>,
    text_length: usize,
}

impl PageEventsSource {
    pub fn new(
        config: SourceConfig,
        client: Client,
        table: Arc<dyn EntityStore>,
        text_length: usize,
    ) -> Self {
        Self {
            config,
            client,
            table,
            text_length,
        }
    }

    fn api_base(&self) -> &str {
        let url = self.config.url.trim_end_matches('/');
        if url.is_empty() { DEFAULT_API_BASE } else { url }
    }

    async fn pages(&self) -> Result<Vec<Page>> {
        let entities: Vec<Entity> = self
            .table
            .list_partition(PAGE_PARTITION)
            .try_collect()
            .await?;
        Ok(entities.iter().filter_map(Page::from_entity).collect())
    }

    async fn fetch_page(&self, page: &Page) -> Result<Vec<Show>> {
        let url = format!("{}/{}/events", self.api_base(), page.id);
        let mut request = self.client.get(&url).query(&[
            ("fields", EVENT_FIELDS),
            ("time_filter", "upcoming"),
            ("limit", "50"),
        ]);
        // Token goes in a header so it never shows up in logged request URLs
        if !page.token.is_empty() {
            request = request.bearer_auth(&page.token);
        }
        let body = request.send().await?.text().await?;
        let response: EventsResponse = serde_json::from_str(&body)?;

        if let Some(error) = response.error {
            return Err(source_error(
                &self.config,
                format!("API error for {}: {}", page.name, error.message),
            ));
        }

        Ok(response
            .data
            .into_iter()
            .map(|event| self.to_show(event, page))
            .collect())
    }

    fn to_show(&self, event: PageEvent, page: &Page) -> Show {
        let title = event
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| "Untitled Event".to_string());
        let description = event.description.unwrap_or_default();
        let start = event
            .start_time
            .as_deref()
            .and_then(|s| DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z").ok());

        Show {
            category: self
                .config
                .category
                .unwrap_or_else(|| Category::infer(&title, &description)),
            venue: event
                .place
                .and_then(|p| p.name)
                .unwrap_or_else(|| page.name.clone()),
            date: start
                .map(|dt| dt.format("%a %-d %b, %H:%M").to_string())
                .unwrap_or_default(),
            dt: start.map(|dt| dt.timestamp_millis()).unwrap_or(0),
            image: event.cover.and_then(|c| c.source).unwrap_or_default(),
            url: format!("https://facebook.com/events/{}", event.id),
            text: truncate_text(&description, self.text_length),
            title,
            ..Show::default()
        }
    }
}

#[async_trait]
impl SourceHandler for PageEventsSource {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn label(&self) -> &str {
        self.config.display_label()
    }

    /// A failing page is logged and skipped; the others still count.
    async fn fetch(&self) -> Result<Vec<Show>> {
        let pages = self
            .pages()
            .await
            .map_err(|e| source_error(&self.config, e))?;
        if pages.is_empty() {
            log::info!("{}: no pages registered", self.config.id);
            return Ok(Vec::new());
        }

        let results: Vec<_> = stream::iter(pages)
            .map(|page| async move {
                let result = self.fetch_page(&page).await;
                (page, result)
            })
            .buffer_unordered(PAGE_CONCURRENCY)
            .collect()
            .await;

        let mut shows = Vec::new();
        for (page, result) in results {
            match result {
                Ok(events) => {
                    log::info!("{}: {} events from {}", self.config.id, events.len(), page.name);
                    shows.extend(events);
                }
                Err(e) => log::warn!("{}: skipping page {}: {}", self.config.id, page.name, e),
            }
        }
        Ok(shows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceKind;
    use crate::storage::MemoryTable;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(url: &str) -> SourceConfig {
        SourceConfig {
            id: "social".to_string(),
            label: "Social pages".to_string(),
            kind: SourceKind::PageEvents,
            url: url.to_string(),
            venue: String::new(),
            category: None,
            date_format: None,
            selectors: None,
        }
    }

    async fn table_with_pages() -> Arc<MemoryTable> {
        let table = Arc::new(MemoryTable::new());
        table
            .upsert_entity(
                Entity::new(PAGE_PARTITION, "111")
                    .with("page_name", "Barn Folk")
                    .with("access_token", "tok1"),
            )
            .await
            .unwrap();
        table
            .upsert_entity(
                Entity::new(PAGE_PARTITION, "222")
                    .with("page_name", "Old Page")
                    .with("enabled", false),
            )
            .await
            .unwrap();
        table
            .upsert_entity(Entity::new("run", "000000000000001"))
            .await
            .unwrap();
        table
    }

    #[tokio::test]
    async fn test_fetches_enabled_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/111/events"))
            .and(header("authorization", "Bearer tok1"))
            .and(query_param("time_filter", "upcoming"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"data": [
                    {"id": "9", "name": "Cinema Sunday", "description": "A film",
                     "start_time": "2025-02-14T19:30:00+0000",
                     "cover": {"source": "https://cdn.example.com/c.jpg"}},
                    {"id": "10", "place": {"name": "The Barn"}}
                ]}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let handler = PageEventsSource::new(
            source(&server.uri()),
            Client::new(),
            table_with_pages().await,
            200,
        );
        let mut shows = handler.fetch().await.unwrap();
        shows.sort_by_key(|s| s.dt);

        assert_eq!(shows.len(), 2);
        assert_eq!(shows[0].title, "Untitled Event");
        assert_eq!(shows[0].venue, "The Barn");
        assert_eq!(shows[1].category, Category::Film);
        assert_eq!(shows[1].venue, "Barn Folk");
        assert_eq!(shows[1].dt, 1_739_561_400_000);
        assert_eq!(shows[1].date, "Fri 14 Feb, 19:30");
        assert_eq!(shows[1].url, "https://facebook.com/events/9");
        assert_eq!(shows[1].image, "https://cdn.example.com/c.jpg");

        let requests = server.received_requests().await.unwrap();
        assert!(
            requests
                .iter()
                .all(|r| !r.url.as_str().contains("tok1"))
        );
    }

    #[tokio::test]
    async fn test_api_error_skips_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"error": {"message": "token expired"}}"#),
            )
            .mount(&server)
            .await;

        let handler = PageEventsSource::new(
            source(&server.uri()),
            Client::new(),
            table_with_pages().await,
            200,
        );
        assert!(handler.fetch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_pages_is_empty() {
        let handler = PageEventsSource::new(
            source(""),
            Client::new(),
            Arc::new(MemoryTable::new()),
            200,
        );
        assert!(handler.fetch().await.unwrap().is_empty());
        assert_eq!(handler.api_base(), DEFAULT_API_BASE);
    }
}
