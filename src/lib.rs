//! gigfeed: collects event listings from many venues into one cached feed.
//!
//! A run fetches every configured source concurrently, falls back to each
//! source's cached listing on failure, merges and deduplicates the results,
//! re-hosts images through a resizing cache and publishes `events.json`.
//! Runs are serialized with an advisory lock in shared storage.

pub mod config;
pub mod error;
#[cfg(feature = "lambda")]
pub mod lambda;
pub mod lock;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod sources;
pub mod storage;
pub mod trigger;
pub mod utils;
