//! Merging per-source listings into one ordered list.

use crate::models::Show;

/// Concatenate listings in the given order, sort by start time and drop
/// adjacent duplicates.
///
/// The sort is stable, so shows with equal `dt` keep source order. A show is
/// dropped when it duplicates the last show kept (see
/// [`Show::is_duplicate_of`]); duplicates that don't end up adjacent after
/// sorting are both kept.
pub fn merge_shows(listings: Vec<Vec<Show>>) -> Vec<Show> {
    let mut shows: Vec<Show> = listings.into_iter().flatten().collect();
    shows.sort_by_key(|show| show.dt);
    shows.dedup_by(|current, kept| current.is_duplicate_of(kept));
    shows
}
