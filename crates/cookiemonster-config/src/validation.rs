// Configuration validation
//
// Run once at startup, before any component is built. A configuration error
// here is fatal (non-zero exit), so the messages spell out what to fix.

use anyhow::{bail, Result};

use crate::RuntimeConfig;

pub fn validate(config: &RuntimeConfig) -> Result<()> {
    if config.processor.workers == 0 {
        bail!("processor.workers must be at least 1");
    }
    if config.cookiejar.buffer.max_size == 0 {
        bail!("cookiejar.buffer.max_size must be at least 1");
    }
    if config.retrieval.period_seconds == 0 {
        bail!("retrieval.period_seconds must be at least 1");
    }
    if let Some(rate) = config.cookiejar.max_requests_per_second {
        if rate == 0 {
            bail!("cookiejar.max_requests_per_second must be at least 1 when set");
        }
    }

    let store_url = config.cookiejar.store_url.as_str();
    if store_url != "memory" && !store_url.starts_with("file://") {
        bail!(
            "cookiejar.store_url must be \"memory\" or a file:// root, got \"{store_url}\""
        );
    }

    // Plug-in directories must exist so their watchers can start.
    for (name, dir) in [
        ("rules.dir", config.rules.as_ref().map(|c| c.dir.as_str())),
        (
            "enrichments.dir",
            config.enrichments.as_ref().map(|c| c.dir.as_str()),
        ),
        (
            "receivers.dir",
            config.receivers.as_ref().map(|c| c.dir.as_str()),
        ),
    ] {
        if let Some(dir) = dir {
            std::fs::create_dir_all(dir)
                .map_err(|err| anyhow::anyhow!("cannot create {name} \"{dir}\": {err}"))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PluginDirConfig;

    #[test]
    fn default_config_validates() {
        validate(&RuntimeConfig::default()).unwrap();
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.processor.workers = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn bad_store_url_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.cookiejar.store_url = "couchdb://somewhere".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn plugin_directories_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let rules_dir = dir.path().join("rules");

        let mut config = RuntimeConfig::default();
        config.rules = Some(PluginDirConfig {
            dir: rules_dir.to_string_lossy().to_string(),
        });

        validate(&config).unwrap();
        assert!(rules_dir.is_dir());
    }
}
