//! hmq - message broker
//!
//! Accepts producer connections over the hmq remoting protocol and appends
//! their messages to a segmented commit log.

use hmq_broker::{BrokerConfig, BrokerController, CONFIG_ENV};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // A config file that was asked for must load; otherwise run on defaults
    let config = match BrokerConfig::load() {
        Ok(config) => {
            if let Ok(path) = std::env::var(CONFIG_ENV) {
                tracing::info!("Loaded config from {}", path);
            }
            config
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting hmq broker");
    tracing::info!("  Listen address: {}", config.server.listen_addr);
    tracing::info!("  Commit log: {}", config.store.data_dir.display());
    tracing::info!("  Flush policy: {:?}", config.store.flush_policy);
    tracing::info!("  Send message threads: {}", config.send_message_threads);
    tracing::info!("  Channel max idle: {}ms", config.server.channel_max_idle_ms);

    let broker = BrokerController::new(config)?;
    let report = broker.store().recovery_report();
    if report.bytes_truncated > 0 {
        tracing::warn!(
            "Recovery truncated {} bytes across {} segments",
            report.bytes_truncated,
            report.segments
        );
    }

    broker.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping broker...");

    broker.shutdown()?;
    tracing::info!("Broker stopped");
    Ok(())
}
