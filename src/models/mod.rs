// src/models/mod.rs

//! Domain models for the collector.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod config;
mod feed;
mod run;
mod selectors;
mod show;

// Re-export all public types
pub use config::{
    BlobBackend, CollectorConfig, Config, HistoryConfig, ImageConfig, LockConfig, SourceConfig,
    SourceKind, StorageConfig, TableBackend,
};
pub use feed::{Feed, detect_platform};
pub use run::{RUN_PARTITION, RunOutcome, RunRecord};
pub use selectors::ListingSelectors;
pub use show::{Category, Show, truncate_text};
