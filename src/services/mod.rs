//! Caches used by the collection pipeline.
//!
//! - Event cache (`EventCache`): last good listing per source
//! - Image cache (`ImageCache`): resized copies of show images

mod event_cache;
mod image_cache;

pub use event_cache::{EventCache, EventCacheEntry, cache_key};
pub use image_cache::{CachedImage, ImageCache, ImageError, cache_stem};
