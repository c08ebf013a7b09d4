// src/models/selectors.rs

//! CSS selectors for scraping a venue's listing page.

use serde::{Deserialize, Serialize};

/// CSS selectors for scraping a venue listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListingSelectors {
    /// Selector for each event in the listing
    pub row_selector: String,

    /// Selector for the title element within a row
    pub title_selector: String,

    /// Selector for the date element within a row
    pub date_selector: String,

    /// Selector for the link element (defaults to the title element)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_selector: Option<String>,

    /// Selector for the event image within a row
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_selector: Option<String>,

    /// Selector for the description within a row
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_selector: Option<String>,

    /// Selector for a per-row venue name (multi-venue promoters)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue_selector: Option<String>,

    /// HTML attribute name for extracting links (usually "href")
    #[serde(default = "default_attr_name")]
    pub attr_name: String,

    /// HTML attribute name for extracting images (usually "src")
    #[serde(default = "default_image_attr")]
    pub image_attr: String,
}

fn default_attr_name() -> String {
    "href".to_string()
}

fn default_image_attr() -> String {
    "src".to_string()
}

impl Default for ListingSelectors {
    fn default() -> Self {
        Self::fallback()
    }
}

impl ListingSelectors {
    /// Generic selectors matching the common "article card" listing layout.
    pub fn fallback() -> Self {
        Self {
            row_selector: "article".to_string(),
            title_selector: "h2 a, h3 a".to_string(),
            date_selector: "time".to_string(),
            link_selector: None,
            image_selector: Some("img".to_string()),
            text_selector: Some("p".to_string()),
            venue_selector: None,
            attr_name: default_attr_name(),
            image_attr: default_image_attr(),
        }
    }
}
