// src/sources/html.rs

//! HTML listing pages scraped with CSS selectors.

use async_trait::async_trait;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{Category, ListingSelectors, Show, SourceConfig, truncate_text};
use crate::sources::{SourceHandler, parse_when, source_error};
use crate::utils::http::fetch_text;
use crate::utils::resolve_url;

/// Compiled row selectors, built per fetch since `Html` parsing is synchronous.
struct Compiled {
    row: Selector,
    title: Selector,
    date: Selector,
    link: Option<Selector>,
    image: Option<Selector>,
    text: Option<Selector>,
    venue: Option<Selector>,
}

/// A venue whose listing page is a list of repeated HTML rows.
pub struct HtmlSource {
    config: SourceConfig,
    selectors: ListingSelectors,
    base_url: Url,
    client: Client,
    text_length: usize,
}

impl HtmlSource {
    /// Create a handler, checking the URL and every selector up front.
    pub fn new(config: SourceConfig, client: Client, text_length: usize) -> Result<Self> {
        let base_url = Url::parse(&config.url)?;
        let selectors = config
            .selectors
            .clone()
            .unwrap_or_else(ListingSelectors::fallback);
        Self::compile(&selectors)?;

        Ok(Self {
            config,
            selectors,
            base_url,
            client,
            text_length,
        })
    }

    fn compile(selectors: &ListingSelectors) -> Result<Compiled> {
        let optional = |s: &Option<String>| s.as_deref().map(parse_selector).transpose();
        Ok(Compiled {
            row: parse_selector(&selectors.row_selector)?,
            title: parse_selector(&selectors.title_selector)?,
            date: parse_selector(&selectors.date_selector)?,
            link: optional(&selectors.link_selector)?,
            image: optional(&selectors.image_selector)?,
            text: optional(&selectors.text_selector)?,
            venue: optional(&selectors.venue_selector)?,
        })
    }

    /// Parse a listing page into shows.
    ///
    /// Rows without a title or date element are skipped.
    pub fn parse_listing(&self, html: &str) -> Result<Vec<Show>> {
        let compiled = Self::compile(&self.selectors)?;
        let document = Html::parse_document(html);

        let shows: Vec<Show> = document
            .select(&compiled.row)
            .filter_map(|row| self.parse_row(&row, &compiled))
            .collect();

        log::debug!("{}: {} rows parsed", self.config.id, shows.len());
        Ok(shows)
    }

    fn parse_row(&self, row: &ElementRef, sel: &Compiled) -> Option<Show> {
        let title_elem = row.select(&sel.title).next()?;
        let date_elem = row.select(&sel.date).next()?;

        let title = collapse_whitespace(&title_elem.text().collect::<String>());
        if title.is_empty() {
            return None;
        }
        let date = collapse_whitespace(&date_elem.text().collect::<String>());
        let dt = date_elem
            .value()
            .attr("datetime")
            .map(|iso| parse_when(iso, None))
            .filter(|&dt| dt != 0)
            .unwrap_or_else(|| parse_when(&date, self.config.date_format.as_deref()));

        let link = sel
            .link
            .as_ref()
            .and_then(|s| row.select(s).next())
            .unwrap_or(title_elem)
            .value()
            .attr(&self.selectors.attr_name)
            .map(|href| resolve_url(&self.base_url, href))
            .unwrap_or_default();

        let image = sel
            .image
            .as_ref()
            .and_then(|s| row.select(s).next())
            .and_then(|img| img.value().attr(&self.selectors.image_attr))
            .map(|src| resolve_url(&self.base_url, src))
            .unwrap_or_default();

        let raw_text = sel
            .text
            .as_ref()
            .and_then(|s| row.select(s).next())
            .map(|e| collapse_whitespace(&e.text().collect::<String>()))
            .unwrap_or_default();

        let venue = sel
            .venue
            .as_ref()
            .and_then(|s| row.select(s).next())
            .map(|e| collapse_whitespace(&e.text().collect::<String>()))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| self.config.venue.clone());

        let category = self
            .config
            .category
            .unwrap_or_else(|| Category::infer(&title, &raw_text));

        Some(Show {
            title,
            venue,
            date,
            dt,
            image,
            imagesource: String::new(),
            url: link,
            text: truncate_text(&raw_text, self.text_length),
            category,
            promoter: String::new(),
        })
    }
}

#[async_trait]
impl SourceHandler for HtmlSource {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn label(&self) -> &str {
        self.config.display_label()
    }

    async fn fetch(&self) -> Result<Vec<Show>> {
        let html = fetch_text(&self.client, &self.config.url)
            .await
            .map_err(|e| source_error(&self.config, e))?;
        self.parse_listing(&html)
    }
}

fn parse_selector(s: &str) -> Result<Selector> {
    Selector::parse(s).map_err(|e| AppError::selector(s, format!("{e:?}")))
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
