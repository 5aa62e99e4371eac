use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("missing or empty device identity")]
    MissingDeviceIdentity,
}

/// Composite identity of one aggregation window for one device.
///
/// An explicit pair with structural equality rather than a delimiter-joined
/// string, so a device named `a-b` in location `c` can never collide with a
/// device named `b` in location `a`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub partition_key: String,
    pub row_key: String,
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition_key, self.row_key)
    }
}

/// Map a device identity and an instant to the bucket it belongs to.
///
/// The partition key is `<location>-<name>`; the row key is the start of the
/// enclosing window, in epoch seconds, rendered as a decimal string. Windows
/// are half-open `[start, start + window_seconds)`, contiguous and
/// non-overlapping, so two instants within one window always derive the same
/// key for the same device.
pub fn derive_key(
    device_location: &str,
    device_name: &str,
    timestamp: DateTime<Utc>,
    window_seconds: i64,
) -> Result<BucketKey, KeyError> {
    if device_location.is_empty() || device_name.is_empty() {
        return Err(KeyError::MissingDeviceIdentity);
    }

    // div_euclid floors toward negative infinity, so pre-epoch instants land
    // in the correct window too.
    let bucket_start = timestamp.timestamp().div_euclid(window_seconds) * window_seconds;

    Ok(BucketKey {
        partition_key: format!("{}-{}", device_location, device_name),
        row_key: bucket_start.to_string(),
    })
}
