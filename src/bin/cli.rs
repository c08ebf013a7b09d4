//! gigfeed CLI
//!
//! Local execution entry point. For AWS Lambda, use `gigfeed-lambda`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use gigfeed::{
    config::load_config,
    error::{AppError, Result},
    models::Feed,
    pipeline::FEED_KEY,
    storage::{BlobStore, Stores},
    trigger::{StartStatus, Trigger, parse_ids},
};

/// gigfeed - Venue Event Feed Collector
#[derive(Parser, Debug)]
#[command(
    name = "gigfeed",
    version,
    about = "Collects event listings from many venues into one cached feed"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "gigfeed.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a collection and wait for it to finish
    Collect,

    /// Start a collection, waiting only so the process outlives it
    Start,

    /// Show the last status line
    Status,

    /// Drop the cached listings of some sources
    Invalidate {
        /// Comma-separated source ids
        ids: String,
    },

    /// Delete every cached image
    PurgeImages,

    /// Delete every cached source listing
    PurgeEvents,

    /// Show recent runs
    History {
        /// Number of runs to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Validate the configuration file
    Validate,

    /// Show configured sources and the current feed
    Info,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if matches!(cli.command, Command::Validate) {
        log::info!("Validating {}...", cli.config.display());
        let config = gigfeed::models::Config::load(&cli.config)?;
        if let Err(e) = config.validate() {
            log::error!("Config validation failed: {}", e);
            return Err(e);
        }
        log::info!("✓ Config OK ({} sources)", config.sources.len());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    log::info!("Loaded configuration from {}", cli.config.display());

    let stores = Stores::open(&config.storage).await?;
    let trigger = Trigger::open_with(&config, &stores)?;

    match cli.command {
        Command::Collect => {
            let Some(report) = trigger.run_now().await? else {
                log::warn!("Collection already in progress");
                return Ok(());
            };
            log::info!(
                "Collected {} shows in {}ms",
                report.feed.shows.len(),
                report.finished - report.started
            );
            for fault in &report.feed.faults {
                log::warn!("{}", fault);
            }
        }

        Command::Start => {
            let Some(handle) = trigger.spawn().await else {
                println!("{}", StartStatus::AlreadyInProgress.as_str());
                return Ok(());
            };
            println!("{}", StartStatus::Started.as_str());
            // The run is a task on this runtime; exiting would cancel it
            match handle.await {
                Ok(Ok(report)) => log::debug!("Run finished with {} shows", report.feed.shows.len()),
                Ok(Err(e)) => log::warn!("Run failed: {}", e),
                Err(e) => log::error!("Run task aborted: {}", e),
            }
            println!("{}", trigger.status().await);
        }

        Command::Status => {
            println!("{}", trigger.status().await);
        }

        Command::Invalidate { ids } => {
            let ids = parse_ids(&ids);
            if ids.is_empty() {
                return Err(AppError::validation("no source ids given"));
            }
            println!("{}", trigger.invalidate(&ids).await);
        }

        Command::PurgeImages => {
            let removed = trigger.purge_images().await?;
            log::info!("Removed {} images", removed);
        }

        Command::PurgeEvents => {
            let removed = trigger.purge_events().await;
            log::info!("Removed {} cached listings", removed);
        }

        Command::History { limit } => {
            for record in trigger.history(limit).await? {
                println!(
                    "{}  {:?}  {} shows, {} faults{}",
                    chrono::DateTime::from_timestamp_millis(record.started)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| record.started.to_string()),
                    record.outcome,
                    record.shows,
                    record.faults.len(),
                    record
                        .error
                        .map(|e| format!(" ({e})"))
                        .unwrap_or_default()
                );
            }
        }

        Command::Validate => {}

        Command::Info => {
            log::info!("Storage: {}", stores.json.describe());
            for (id, label) in trigger.collector().registry().labels() {
                log::info!("Source {}: {}", id, label);
            }

            match stores.json.get_string(FEED_KEY).await {
                Some(text) => match serde_json::from_str::<Feed>(&text) {
                    Ok(feed) => {
                        log::info!("Feed: {} shows, {} faults", feed.shows.len(), feed.faults.len());
                        if let Some(updated) = chrono::DateTime::from_timestamp_millis(feed.date) {
                            log::info!("Last updated: {}", updated.to_rfc3339());
                        }
                    }
                    Err(e) => log::warn!("Feed is unreadable: {}", e),
                },
                None => log::info!("No feed collected yet."),
            }
            log::info!("Status: {}", trigger.status().await);
        }
    }

    Ok(())
}
