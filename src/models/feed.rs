//! The persisted feed document.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{Category, Show};

/// Aggregate written once per successful collection run.
///
/// Each run replaces the previous document entirely.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Feed {
    /// Source id to display label
    pub promoters: BTreeMap<String, String>,

    /// Number of shows per category
    pub categories: BTreeMap<Category, usize>,

    /// Merged shows, ascending by start time
    pub shows: Vec<Show>,

    /// Sources that produced nothing, fresh or cached
    #[serde(rename = "toDo")]
    pub to_do: BTreeSet<String>,

    /// Diagnostics collected during the run
    pub faults: Vec<String>,

    /// Epoch milliseconds when the feed was assembled
    pub date: i64,

    /// Hosting platform the run executed on
    pub platform: String,
}

impl Feed {
    /// Count shows per category.
    pub fn tally(shows: &[Show]) -> BTreeMap<Category, usize> {
        let mut categories = BTreeMap::new();
        for show in shows {
            *categories.entry(show.category).or_insert(0) += 1;
        }
        categories
    }
}

/// Detect the hosting platform from the environment.
pub fn detect_platform() -> &'static str {
    if std::env::var_os("AWS_LAMBDA_FUNCTION_NAME").is_some() {
        "aws"
    } else if std::env::var_os("AZURE_FUNCTIONS_ENVIRONMENT").is_some()
        || std::env::var_os("WEBSITE_INSTANCE_ID").is_some()
    {
        "azure"
    } else {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally() {
        let shows = vec![
            Show {
                category: Category::Film,
                ..Show::default()
            },
            Show::default(),
            Show::default(),
        ];
        let tally = Feed::tally(&shows);
        assert_eq!(tally.get(&Category::Film), Some(&1));
        assert_eq!(tally.get(&Category::Live), Some(&2));
        assert_eq!(tally.get(&Category::Quiz), None);
    }

    #[test]
    fn test_feed_field_names() {
        let mut feed = Feed::default();
        feed.to_do.insert("torch".to_string());
        feed.categories.insert(Category::Quiz, 3);

        let json = serde_json::to_value(&feed).unwrap();
        assert_eq!(json["toDo"], serde_json::json!(["torch"]));
        assert_eq!(json["categories"]["quiz"], 3);
    }
}
