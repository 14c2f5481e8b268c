use anyhow::{Context, Result};
use clap::Parser;
use cookiemonster_config::RuntimeConfig;
use std::path::PathBuf;

/// File-update processing service with a rule pipeline
#[derive(Parser)]
#[command(name = "cookiemonster")]
#[command(version)]
#[command(about = "File-update processing service with a rule pipeline", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Admin API port (overrides config file)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Directory scanned for file updates (overrides config file)
    #[arg(short, long, value_name = "DIR")]
    source: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Build tokio runtime and run async service
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Step 1: Load base configuration
    let mut config = if let Some(config_path) = &cli.config {
        RuntimeConfig::load_from_path(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        RuntimeConfig::load_or_default().context("Failed to load configuration")?
    };

    // Step 2: Apply CLI overrides (highest priority)
    apply_cli_overrides(&mut config, &cli);

    // Step 3: Run with resolved config
    cookiemonster_server::run_with_config(config).await
}

fn apply_cli_overrides(config: &mut RuntimeConfig, cli: &Cli) {
    if let Some(port) = cli.port {
        config.api.port = port;
    }
    if let Some(source) = &cli.source {
        config.retrieval.source_dir = Some(source.to_string_lossy().to_string());
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
}
