//! The collection pipeline.
//!
//! - `collect`: the `Collector` orchestrating one run
//! - `merge`: sorting and adjacent dedup of merged listings
//! - `status`: the persistent progress line

pub mod collect;
pub mod merge;
pub mod status;

pub use collect::{Collector, FEED_KEY, RunContext, RunReport};
pub use merge::merge_shows;
pub use status::{STATUS_KEY, StatusReporter};
