//! Show (event listing) data structure.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

static FILM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"film|cinema|movie|screening").expect("valid film regex"));
static QUIZ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"quiz|trivia").expect("valid quiz regex"));
static BROADCAST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"broadcast|ntlive|nt live|live stream").expect("valid broadcast regex")
});

/// Kind of event a show is.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Film,
    Quiz,
    Broadcast,
    #[default]
    Live,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Film => "film",
            Category::Quiz => "quiz",
            Category::Broadcast => "broadcast",
            Category::Live => "live",
        }
    }

    /// Classify an event from its free-text title and description.
    ///
    /// Most listings are live performances, so anything unmatched is `Live`.
    pub fn infer(title: &str, description: &str) -> Self {
        let text = format!("{title} {description}").to_lowercase();

        if FILM_RE.is_match(&text) {
            Category::Film
        } else if QUIZ_RE.is_match(&text) {
            Category::Quiz
        } else if BROADCAST_RE.is_match(&text) {
            Category::Broadcast
        } else {
            Category::Live
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event listing produced by a source handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Show {
    /// Event title
    pub title: String,

    /// Venue display name
    pub venue: String,

    /// Human-readable date
    pub date: String,

    /// Start time in epoch milliseconds, 0 when unknown
    pub dt: i64,

    /// Image URL, or a cache-relative path once rewritten
    pub image: String,

    /// Original image URL before caching
    pub imagesource: String,

    /// Link to the event page
    pub url: String,

    /// Truncated description
    pub text: String,

    /// Event category
    pub category: Category,

    /// Identifier of the source that produced the show
    pub promoter: String,
}

impl Show {
    /// Whether `other` should be merged into `self` when adjacent in sorted order.
    ///
    /// Venues are compared on their first six characters only, since sources
    /// spell the same hall differently ("Hall", "Hall Moylgrove", ...).
    pub fn is_duplicate_of(&self, other: &Show) -> bool {
        self.title == other.title
            && venue_prefix(&self.venue) == venue_prefix(&other.venue)
            && self.image == other.image
    }
}

fn venue_prefix(venue: &str) -> String {
    venue.chars().take(6).collect()
}

/// Truncate text to at most `max` user-perceived characters.
pub fn truncate_text(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.graphemes(true).count() <= max {
        return trimmed.to_string();
    }
    trimmed.graphemes(true).take(max).collect()
}
