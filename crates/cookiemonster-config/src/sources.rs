// Configuration sources and environment overrides

use std::path::Path;

use anyhow::{Context, Result};

use crate::RuntimeConfig;

const DEFAULT_LOCATIONS: &[&str] = &["cookiemonster.toml", ".cookiemonster.toml"];

pub(crate) fn load_from_path(path: &Path) -> Result<RuntimeConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let mut config: RuntimeConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

pub(crate) fn load_or_default() -> Result<RuntimeConfig> {
    if let Ok(path) = std::env::var("COOKIEMONSTER_CONFIG") {
        return load_from_path(Path::new(&path));
    }

    for location in DEFAULT_LOCATIONS {
        let path = Path::new(location);
        if path.exists() {
            return load_from_path(path);
        }
    }

    let mut config = RuntimeConfig::default();
    apply_env_overrides(&mut config)?;
    Ok(config)
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("invalid {key}: {err}")),
        Err(_) => Ok(None),
    }
}

/// Environment variables beat everything else.
pub(crate) fn apply_env_overrides(config: &mut RuntimeConfig) -> Result<()> {
    if let Some(period) = parse_env::<u64>("COOKIEMONSTER_RETRIEVAL_PERIOD_SECONDS")? {
        config.retrieval.period_seconds = period;
    }
    if let Ok(source_dir) = std::env::var("COOKIEMONSTER_RETRIEVAL_SOURCE_DIR") {
        config.retrieval.source_dir = Some(source_dir);
    }
    if let Ok(store_url) = std::env::var("COOKIEMONSTER_STORE_URL") {
        config.cookiejar.store_url = store_url;
    }
    if let Ok(database) = std::env::var("COOKIEMONSTER_DATABASE_NAME") {
        config.cookiejar.database_name = database;
    }
    if let Some(workers) = parse_env::<usize>("COOKIEMONSTER_PROCESSOR_WORKERS")? {
        config.processor.workers = workers;
    }
    if let Some(port) = parse_env::<u16>("COOKIEMONSTER_API_PORT")? {
        config.api.port = port;
    }
    if let Ok(level) = std::env::var("COOKIEMONSTER_LOG_LEVEL") {
        config.logging.level = level;
    }
    Ok(())
}
