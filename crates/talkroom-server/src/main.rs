//! # Talkroom Server
//!
//! Realtime presence and broadcast server for talkrooms.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! talkroom
//!
//! # Run with a config file
//! TALKROOM_CONFIG=/path/to/talkroom.toml talkroom
//!
//! # Run with environment variables
//! TALKROOM_PORT=8000 TALKROOM_HOST=0.0.0.0 talkroom
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use config::{LogConfig, LogFormat};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let registry = tracing_subscriber::registry().with(filter);

    match log.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::load()?;

    init_tracing(&config.log);

    tracing::info!(
        app_name = %config.app_name,
        environment = %config.environment,
        "Starting talkroom server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
