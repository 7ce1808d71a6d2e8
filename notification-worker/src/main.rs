//! Notification service binary.
//!
//! Loads configuration from the environment, wires the shipped email
//! handlers and runs the service until SIGINT or SIGTERM.

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info};

use notifier::config::LogFormat;
use notifier::{telemetry, Config, HandlerCatalog, LogMailer, Service};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            telemetry::init(LogFormat::Json);
            error!(error = %e, error_class = "config", "config_invalid");
            std::process::exit(1);
        }
    };

    telemetry::init(config.log_format);
    info!(
        port = config.port,
        bindings = config.bindings.len(),
        prefetch_count = config.prefetch_count,
        max_in_flight = config.max_in_flight,
        max_handler_retries = config.max_handler_retries,
        "config_loaded"
    );

    let catalog = HandlerCatalog::with_email_handlers(
        Arc::new(LogMailer),
        &config.sender_email,
        &config.client_url,
    );

    let service = match Service::new(config, &catalog) {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, error_class = "config", handlers = ?catalog.names(), "config_invalid");
            std::process::exit(1);
        }
    };

    service.run(shutdown_signal()).await
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
