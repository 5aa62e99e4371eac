use aws_config::BehaviorVersion;
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use telemetry_table_shipper::config;
use telemetry_table_shipper::events::TelemetryEvent;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Error> {
    telemetry_table_shipper::set_up_logging();

    info!(
        "Initializing {} version {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = config::Config::load_from_env()?;
    let aws_config = aws_config::load_defaults(BehaviorVersion::v2023_11_09()).await;
    let store = telemetry_table_shipper::set_up_store(&aws_config, &config);

    run(service_fn(|request: LambdaEvent<TelemetryEvent>| {
        telemetry_table_shipper::function_handler(&store, &config, request)
    }))
    .await
}
