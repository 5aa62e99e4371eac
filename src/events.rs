use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::aggregate::PointUpdate;

/// One telemetry batch as delivered by the streaming transport.
///
/// Device metadata arrives out of band, positionally aligned with the
/// payloads: `properties_array[i]` describes the device behind
/// `messages[i]`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    #[serde(default)]
    pub messages: Vec<TelemetryMessage>,
    #[serde(default)]
    pub properties_array: Vec<DeviceProperties>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryMessage {
    #[serde(rename = "id")]
    pub field_id: String,
    #[serde(rename = "v")]
    pub field_value: Value,
    #[serde(rename = "t")]
    pub timestamp: Value,
}

/// Device twin enrichment attached to each message by the ingestion
/// service.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProperties {
    #[serde(default)]
    pub device_location: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
}

/// A message dropped before aggregation because its timestamp could not be
/// read as an instant.
#[derive(Debug)]
pub struct SkippedMessage {
    pub index: usize,
    pub field_id: String,
}

impl TelemetryEvent {
    /// Pair each payload with its positional device metadata and parse the
    /// timestamps. Messages without a readable timestamp land in the skip
    /// list; missing metadata resolves to an empty identity, which key
    /// derivation rejects per message downstream.
    pub fn into_points(self) -> (Vec<PointUpdate>, Vec<SkippedMessage>) {
        let TelemetryEvent {
            messages,
            properties_array,
        } = self;

        let mut points = Vec::with_capacity(messages.len());
        let mut skipped = Vec::new();

        for (index, message) in messages.into_iter().enumerate() {
            let Some(timestamp) = parse_timestamp(&message.timestamp) else {
                skipped.push(SkippedMessage {
                    index,
                    field_id: message.field_id,
                });
                continue;
            };

            let properties = properties_array.get(index).cloned().unwrap_or_default();
            points.push(PointUpdate {
                device_location: properties.device_location.unwrap_or_default(),
                device_name: properties.device_name.unwrap_or_default(),
                field_id: message.field_id,
                field_value: message.field_value,
                timestamp,
            });
        }

        (points, skipped)
    }
}

/// Accepts RFC 3339 strings (offsets honored, normalized to UTC) or numeric
/// epoch milliseconds.
pub fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|instant| instant.with_timezone(&Utc)),
        Value::Number(number) => {
            let millis = number
                .as_i64()
                .or_else(|| number.as_f64().map(|float| float as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}
