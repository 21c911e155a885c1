//! # Herald Server
//!
//! Realtime broadcast server with presence channels.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! herald
//!
//! # Run with a specific config file
//! HERALD_CONFIG=/path/to/herald.toml herald
//!
//! # Override the bind address
//! HERALD_PORT=6001 HERALD_HOST=0.0.0.0 herald
//! ```

mod api;
mod config;
mod dispatch;
mod handlers;
mod metrics;
mod store;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Herald server on {}:{}", config.host, config.port);
    if config.dev_mode {
        tracing::info!("Running in dev mode");
    }

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
