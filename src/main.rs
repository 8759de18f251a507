//! MQTT IoT gateway
//!
//! Forwards device data to the highest-priority connected MQTT broker and
//! routes broker messages back to devices.
//!
//! Module structure:
//! - `domain/` - Message envelope, topic rules, will payload decoding
//! - `io/` - MQTT transport and concrete devices (dummy, serial)
//! - `services/` - Broker lifecycle, failover selection, the gateway loop
//! - `infra/` - Config, validation, TLS, errors, metrics

use anyhow::Context;
use clap::Parser;
use iot_gateway::infra::Config;
use iot_gateway::services::Gateway;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Interval between metrics summaries in the log
const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// MQTT IoT gateway with broker failover
#[derive(Parser, Debug)]
#[command(name = "iot-gateway", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/gateway.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG selects the level, default INFO
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    info!("iot-gateway starting");

    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config))?;

    info!(
        config_file = %config.config_file(),
        gateway = %config.gateway_name(),
        brokers = ?config.broker_names(),
        devices = config.devices().len(),
        "config_loaded"
    );

    let gateway = Gateway::from_config(&config);
    let handle = gateway.spawn();

    // Periodic metrics summary
    let metrics = handle.metrics();
    let reporter = tokio::spawn(async move {
        let mut interval = tokio::time::interval(METRICS_LOG_INTERVAL);
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics.report().log();
        }
    });

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown_signal_received");

    handle.stop().await;
    reporter.abort();

    info!("iot-gateway shutdown complete");
    Ok(())
}
