use std::time::Duration;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{debug, warn};

use crate::aggregate::AggregatedRecord;
use crate::bucket::BucketKey;
use crate::store::{DynTableStore, StoreError};

/// Bounded exponential backoff for transient store errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt after `attempt` (1-based): doubles per
    /// attempt, capped at `max_backoff`.
    fn backoff(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(doublings))
            .min(self.max_backoff)
    }
}

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: StoreError },
    #[error(transparent)]
    Permanent(StoreError),
}

/// Result of committing one aggregated record.
#[derive(Debug)]
pub struct UpsertOutcome {
    pub key: BucketKey,
    pub attempts: u32,
    pub result: Result<(), UpsertError>,
}

impl UpsertOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Commits aggregated records to the store, a bounded number in flight at a
/// time, with per-record retry.
pub struct UpsertDispatcher {
    store: DynTableStore,
    retry: RetryPolicy,
    max_in_flight: usize,
}

impl UpsertDispatcher {
    pub fn new(store: DynTableStore, retry: RetryPolicy, max_in_flight: usize) -> Self {
        UpsertDispatcher {
            store,
            retry,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Commit every record and return one outcome per record, positionally
    /// aligned with the input. Records never share a bucket key within one
    /// batch (the aggregation map collapsed them), so they are dispatched
    /// concurrently and one record's failure never aborts another's upsert.
    /// The whole call fails only when the store is unreachable for the
    /// table-existence check.
    pub async fn dispatch(
        &self,
        records: Vec<AggregatedRecord>,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        self.store.ensure_table().await?;

        let mut outcomes: Vec<(usize, UpsertOutcome)> =
            stream::iter(records.into_iter().enumerate())
                .map(|(position, record)| async move {
                    (position, self.upsert_with_retry(record).await)
                })
                .buffer_unordered(self.max_in_flight)
                .collect()
                .await;

        outcomes.sort_by_key(|(position, _)| *position);
        Ok(outcomes.into_iter().map(|(_, outcome)| outcome).collect())
    }

    async fn upsert_with_retry(&self, record: AggregatedRecord) -> UpsertOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.store.upsert_merge(&record.key, &record.fields).await {
                Ok(()) => {
                    debug!(key = %record.key, attempts, "record upserted");
                    return UpsertOutcome {
                        key: record.key,
                        attempts,
                        result: Ok(()),
                    };
                }
                Err(err) if err.is_transient() && attempts < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempts);
                    warn!(
                        key = %record.key,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient upsert failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_transient() => {
                    return UpsertOutcome {
                        key: record.key,
                        attempts,
                        result: Err(UpsertError::RetriesExhausted {
                            attempts,
                            last: err,
                        }),
                    };
                }
                Err(err) => {
                    return UpsertOutcome {
                        key: record.key,
                        attempts,
                        result: Err(UpsertError::Permanent(err)),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::TableStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};

    /// Store that fails a record's first N upserts with a throttle, or
    /// always with a permanent error, and counts attempts per partition.
    #[derive(Default)]
    struct ScriptedStore {
        throttle_first: HashMap<String, u32>,
        permanent: Vec<String>,
        unavailable: bool,
        attempts: Mutex<HashMap<String, u32>>,
    }

    #[async_trait]
    impl TableStore for ScriptedStore {
        async fn ensure_table(&self) -> Result<(), StoreError> {
            if self.unavailable {
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            Ok(())
        }

        async fn upsert_merge(
            &self,
            key: &BucketKey,
            _fields: &BTreeMap<String, Value>,
        ) -> Result<(), StoreError> {
            let mut attempts = self.attempts.lock().unwrap();
            let seen = attempts.entry(key.partition_key.clone()).or_insert(0);
            *seen += 1;

            if self.permanent.contains(&key.partition_key) {
                return Err(StoreError::Permanent(
                    "ValidationException: bad payload".to_string(),
                ));
            }
            let throttles = self
                .throttle_first
                .get(&key.partition_key)
                .copied()
                .unwrap_or(0);
            if *seen <= throttles {
                return Err(StoreError::Transient(
                    "ThrottlingException: slow down".to_string(),
                ));
            }
            Ok(())
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn record(partition: &str, row: &str, field: &str, value: Value) -> AggregatedRecord {
        AggregatedRecord {
            key: BucketKey {
                partition_key: partition.to_string(),
                row_key: row.to_string(),
            },
            fields: BTreeMap::from([(field.to_string(), value)]),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
        assert_eq!(retry.backoff(3), Duration::from_millis(800));
        assert_eq!(retry.backoff(6), Duration::from_millis(5000));
        assert_eq!(retry.backoff(31), Duration::from_millis(5000));
    }

    #[test_log::test(tokio::test)]
    async fn test_succeeds_after_transient_failures() {
        let store = Arc::new(ScriptedStore {
            throttle_first: HashMap::from([("Room1-SensorA".to_string(), 2)]),
            ..Default::default()
        });
        let dispatcher = UpsertDispatcher::new(store.clone(), fast_retry(5), 4);

        let outcomes = dispatcher
            .dispatch(vec![record("Room1-SensorA", "1704067200", "temp", json!(22.0))])
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_success());
        assert_eq!(outcomes[0].attempts, 3);
        assert_eq!(store.attempts.lock().unwrap()["Room1-SensorA"], 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_retries_exhausted_after_max_attempts() {
        let store = Arc::new(ScriptedStore {
            throttle_first: HashMap::from([("Room1-SensorA".to_string(), 10)]),
            ..Default::default()
        });
        let dispatcher = UpsertDispatcher::new(store.clone(), fast_retry(3), 4);

        let outcomes = dispatcher
            .dispatch(vec![record("Room1-SensorA", "1704067200", "temp", json!(22.0))])
            .await
            .unwrap();

        assert_eq!(outcomes[0].attempts, 3);
        assert!(matches!(
            outcomes[0].result,
            Err(UpsertError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(store.attempts.lock().unwrap()["Room1-SensorA"], 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_permanent_error_is_not_retried() {
        let store = Arc::new(ScriptedStore {
            permanent: vec!["Room1-SensorA".to_string()],
            ..Default::default()
        });
        let dispatcher = UpsertDispatcher::new(store.clone(), fast_retry(5), 4);

        let outcomes = dispatcher
            .dispatch(vec![record("Room1-SensorA", "1704067200", "temp", json!(22.0))])
            .await
            .unwrap();

        assert_eq!(outcomes[0].attempts, 1);
        assert!(matches!(
            outcomes[0].result,
            Err(UpsertError::Permanent(_))
        ));
        assert_eq!(store.attempts.lock().unwrap()["Room1-SensorA"], 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_one_failure_leaves_other_records_untouched() {
        let store = Arc::new(ScriptedStore {
            permanent: vec!["Room2-SensorB".to_string()],
            ..Default::default()
        });
        let dispatcher = UpsertDispatcher::new(store.clone(), fast_retry(5), 4);

        let records = vec![
            record("Room1-SensorA", "1704067200", "temp", json!(1)),
            record("Room2-SensorB", "1704067200", "temp", json!(2)),
            record("Room3-SensorC", "1704067200", "temp", json!(3)),
        ];
        let outcomes = dispatcher.dispatch(records).await.unwrap();

        // Outcomes stay positionally aligned with the input.
        assert_eq!(outcomes[0].key.partition_key, "Room1-SensorA");
        assert_eq!(outcomes[1].key.partition_key, "Room2-SensorB");
        assert_eq!(outcomes[2].key.partition_key, "Room3-SensorC");
        assert!(outcomes[0].is_success());
        assert!(!outcomes[1].is_success());
        assert!(outcomes[2].is_success());
    }

    #[test_log::test(tokio::test)]
    async fn test_unreachable_store_fails_whole_dispatch() {
        let store = Arc::new(ScriptedStore {
            unavailable: true,
            ..Default::default()
        });
        let dispatcher = UpsertDispatcher::new(store, fast_retry(5), 4);

        let result = dispatcher
            .dispatch(vec![record("Room1-SensorA", "1704067200", "temp", json!(1))])
            .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[test_log::test(tokio::test)]
    async fn test_empty_dispatch_is_empty() {
        let store = Arc::new(ScriptedStore::default());
        let dispatcher = UpsertDispatcher::new(store, fast_retry(5), 4);
        let outcomes = dispatcher.dispatch(Vec::new()).await.unwrap();
        assert!(outcomes.is_empty());
    }
}
