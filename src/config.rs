use std::env;
use std::num::ParseIntError;
use std::time::Duration;

use crate::dispatch::RetryPolicy;

/// Environment-provided settings, loaded once at startup.
///
/// `OutputTableName` and `TableUpdateInterval` are the app-setting names
/// the deployment provisions; the remaining knobs bound the dispatch path.
pub struct Config {
    pub table_name: String,
    pub window_seconds: i64,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

impl Config {
    pub fn load_from_env() -> Result<Config, String> {
        let update_interval = env::var("TableUpdateInterval")
            .unwrap_or("5".to_string())
            .parse::<i64>()
            .map_err(|e: ParseIntError| {
                format!("error parsing TableUpdateInterval to int - {}", e)
            })?;
        if update_interval < 1 {
            return Err(format!(
                "TableUpdateInterval must be at least 1 minute, got {}",
                update_interval
            ));
        }

        let conf = Config {
            table_name: env::var("OutputTableName").unwrap_or("OutputTable".to_string()),

            window_seconds: 60 * update_interval,

            max_in_flight: env::var("MAX_IN_FLIGHT_UPSERTS")
                .unwrap_or("10".to_string())
                .parse::<usize>()
                .map_err(|e| format!("Error parsing MAX_IN_FLIGHT_UPSERTS to usize - {}", e))?,

            retry: RetryPolicy {
                max_attempts: env::var("UPSERT_MAX_ATTEMPTS")
                    .unwrap_or("5".to_string())
                    .parse::<u32>()
                    .map_err(|e| format!("Error parsing UPSERT_MAX_ATTEMPTS to u32 - {}", e))?,
                initial_backoff: Duration::from_millis(
                    env::var("UPSERT_INITIAL_BACKOFF_MS")
                        .unwrap_or("200".to_string())
                        .parse::<u64>()
                        .map_err(|e| {
                            format!("Error parsing UPSERT_INITIAL_BACKOFF_MS to u64 - {}", e)
                        })?,
                ),
                max_backoff: Duration::from_millis(
                    env::var("UPSERT_MAX_BACKOFF_MS")
                        .unwrap_or("5000".to_string())
                        .parse::<u64>()
                        .map_err(|e| {
                            format!("Error parsing UPSERT_MAX_BACKOFF_MS to u64 - {}", e)
                        })?,
                ),
            },
        };

        Ok(conf)
    }
}
