// cookiemonster-server - Service wiring and the admin HTTP API
//
// Builds the whole pipeline out of a RuntimeConfig: store -> jar ->
// registries -> retrieval manager -> processor pool -> monitors -> API,
// then runs it with graceful shutdown.

use anyhow::{Context as AnyhowContext, Result};
use tokio::signal;
use tracing::info;

mod handlers;
mod init;
mod service;

pub use service::{Service, ServiceBuilder};

use cookiemonster_config::RuntimeConfig;

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}

/// Entry point for the packaged service.
pub async fn run_with_config(config: RuntimeConfig) -> Result<()> {
    init::init_tracing(&config);
    cookiemonster_config::validate(&config).context("invalid configuration")?;

    let service = Service::builder(config)
        .build()
        .await
        .context("failed to build service")?;

    service.run_until(shutdown_signal()).await
}
