use aws_config::SdkConfig;
use aws_sdk_dynamodb::Client as DynamoDbClient;
use lambda_runtime::{Error, LambdaEvent};
use std::sync::Arc;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::events::TelemetryEvent;
use crate::store::{DynTableStore, DynamoTableStore};

pub mod aggregate;
pub mod bucket;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod process;
pub mod store;

pub fn set_up_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .init();
}

/// Build the process-wide store handle. Created once at startup and shared
/// across invocations.
pub fn set_up_store(sdk_config: &SdkConfig, config: &Config) -> DynTableStore {
    Arc::new(DynamoTableStore::new(
        DynamoDbClient::new(sdk_config),
        config.table_name.clone(),
    ))
}

// lambda handler
pub async fn function_handler(
    store: &DynTableStore,
    config: &Config,
    evt: LambdaEvent<TelemetryEvent>,
) -> Result<(), Error> {
    info!("Handling lambda invocation");

    let summary = process::handle_batch(store, config, evt.payload).await?;

    info!(
        "Processed {} messages: {} records upserted, {} failed, {} messages skipped",
        summary.messages,
        summary.records_upserted,
        summary.records_failed,
        summary.messages_skipped
    );

    Ok(())
}
