//! hubcore - standalone hub process
//!
//! Loads configuration, brings the hub up and keeps it running until Ctrl-C,
//! then prints the exported audit log to stdout.

use hubcore::{Hub, HubConfig};

#[tokio::main]
async fn main() -> hubcore::Result<()> {
    let config = match HubConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: {}; falling back to defaults", e);
            HubConfig::default()
        }
    };

    hubcore::logging::init_logging(&config.logging_config())?;
    tracing::info!(
        health_endpoint = config.health_endpoint.as_deref().unwrap_or("-"),
        auto_health_check = config.auto_health_check,
        "Starting hubcore"
    );

    let hub = Hub::try_new(config)?;
    hub.init();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, shutting down");

    hub.shutdown();
    println!("{}", hub.audit().export_json()?);
    Ok(())
}
