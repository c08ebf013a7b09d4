//! AWS Lambda entry point for gigfeed
//!
//! Deploy with `cargo lambda build --release --features lambda`.
//! Storage locations come from `S3_BUCKET`, `S3_PREFIX` and `TABLE_NAME`;
//! everything else from `config.toml` in the bucket's admin namespace.

use gigfeed::config::{lambda_storage, load_from_store};
use gigfeed::lambda::handler;
use gigfeed::storage::Stores;
use gigfeed::trigger::Trigger;
use lambda_runtime::{Error as LambdaError, LambdaEvent, service_fn};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the AWS Lambda function.
#[tokio::main]
async fn main() -> Result<(), LambdaError> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("gigfeed Lambda starting...");

    // Built once per cold start and shared by warm invocations
    let storage = lambda_storage();
    let stores = Stores::open(&storage).await?;
    let config = load_from_store(stores.admin.as_ref(), storage).await?;
    let trigger = Trigger::open_with(&config, &stores)?;

    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| {
        let trigger = trigger.clone();
        async move { handler(&trigger, event).await }
    }))
    .await
}
