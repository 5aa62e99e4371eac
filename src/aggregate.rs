use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::bucket::{self, BucketKey, KeyError};

/// One incoming fact: a single field reading for one device at one instant.
#[derive(Debug, Clone)]
pub struct PointUpdate {
    pub device_location: String,
    pub device_name: String,
    pub field_id: String,
    pub field_value: Value,
    pub timestamp: DateTime<Utc>,
}

/// All fields destined for one bucket, merged from the points of one batch.
/// Never merged across batches in memory; cross-batch merging is the
/// store's upsert-merge.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedRecord {
    pub key: BucketKey,
    pub fields: BTreeMap<String, Value>,
}

/// A point excluded from aggregation because its key could not be derived.
#[derive(Debug)]
pub struct SkippedPoint {
    pub field_id: String,
    pub reason: KeyError,
}

#[derive(Debug, Default)]
pub struct Aggregation {
    pub records: HashMap<BucketKey, AggregatedRecord>,
    pub skipped: Vec<SkippedPoint>,
}

/// Fold a batch of point-updates into one record per bucket.
///
/// Arrival order decides conflicts: the last point in the batch for a given
/// (bucket, field) pair wins, regardless of its timestamp value. Points
/// whose key derivation fails are excluded and reported in `skipped`; they
/// never fail the rest of the batch. An empty batch is an empty result.
pub fn aggregate(points: Vec<PointUpdate>, window_seconds: i64) -> Aggregation {
    let mut out = Aggregation::default();

    for point in points {
        let key = match bucket::derive_key(
            &point.device_location,
            &point.device_name,
            point.timestamp,
            window_seconds,
        ) {
            Ok(key) => key,
            Err(reason) => {
                out.skipped.push(SkippedPoint {
                    field_id: point.field_id,
                    reason,
                });
                continue;
            }
        };

        out.records
            .entry(key.clone())
            .or_insert_with(|| AggregatedRecord {
                key,
                fields: BTreeMap::new(),
            })
            .fields
            .insert(point.field_id, point.field_value);
    }

    out
}
