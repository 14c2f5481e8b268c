// Initialization utilities
//
// Tracing setup and storage backend construction from RuntimeConfig.

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::info;

use cookiemonster_config::{LogFormat, RuntimeConfig};
use cookiemonster_store::{DocumentStore, FsStore, MemoryStore};

/// Initialize tracing/logging from RuntimeConfig
pub(crate) fn init_tracing(config: &RuntimeConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_new(&config.logging.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    // A second init (tests build several services) is harmless.
    let result = match config.logging.format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Build the document store selected by `cookiejar.store_url`.
pub(crate) fn init_store(config: &RuntimeConfig) -> Result<Arc<dyn DocumentStore>> {
    let store_url = config.cookiejar.store_url.as_str();
    let database = config.cookiejar.database_name.as_str();

    if store_url == "memory" {
        info!(database, "using in-memory document store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    if let Some(root) = store_url.strip_prefix("file://") {
        info!(root, database, "using filesystem document store");
        return Ok(Arc::new(FsStore::open(root, database)?));
    }

    bail!("unsupported store url: {store_url}");
}
