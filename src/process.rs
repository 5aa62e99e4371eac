use lambda_runtime::Error;
use tracing::{info, warn};

use crate::aggregate::{self, Aggregation};
use crate::config::Config;
use crate::dispatch::UpsertDispatcher;
use crate::events::TelemetryEvent;
use crate::store::DynTableStore;

/// Per-invocation accounting, logged at the handler boundary.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub messages: usize,
    pub messages_skipped: usize,
    pub records_upserted: usize,
    pub records_failed: usize,
}

/// Run one batch through the pipeline: resolve points, fold them into
/// per-bucket records, commit the records.
///
/// Per-message and per-record failures are logged and counted but never
/// fail the invocation; only an unreachable store does, handing the batch
/// back to the transport for redelivery (safe, because the upserts are
/// idempotent merges).
pub async fn handle_batch(
    store: &DynTableStore,
    config: &Config,
    event: TelemetryEvent,
) -> Result<BatchSummary, Error> {
    let mut summary = BatchSummary {
        messages: event.messages.len(),
        ..Default::default()
    };

    let (points, unreadable) = event.into_points();
    for skip in &unreadable {
        warn!(
            index = skip.index,
            field_id = %skip.field_id,
            "dropping message with unreadable timestamp"
        );
    }

    let Aggregation { records, skipped } = aggregate::aggregate(points, config.window_seconds);
    for skip in &skipped {
        warn!(field_id = %skip.field_id, error = %skip.reason, "dropping message");
    }
    summary.messages_skipped = unreadable.len() + skipped.len();

    if records.is_empty() {
        info!("no records to upsert");
        return Ok(summary);
    }

    let dispatcher = UpsertDispatcher::new(store.clone(), config.retry.clone(), config.max_in_flight);
    let outcomes = dispatcher.dispatch(records.into_values().collect()).await?;

    for outcome in &outcomes {
        match &outcome.result {
            Ok(()) => {
                info!(key = %outcome.key, attempts = outcome.attempts, "record upserted");
                summary.records_upserted += 1;
            }
            Err(error) => {
                warn!(
                    key = %outcome.key,
                    attempts = outcome.attempts,
                    error = %error,
                    "record failed"
                );
                summary.records_failed += 1;
            }
        }
    }

    Ok(summary)
}
