// cookiemonster-config - Unified runtime configuration
//
// Sources, highest priority first:
// 1. Environment variables (COOKIEMONSTER_*)
// 2. Config file path from COOKIEMONSTER_CONFIG
// 3. Default config file locations (./cookiemonster.toml, ./.cookiemonster.toml)
// 4. Built-in defaults

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod sources;
mod validation;

pub use validation::validate;

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub cookiejar: CookieJarConfig,

    #[serde(default)]
    pub processor: ProcessorConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<PluginDirConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichments: Option<PluginDirConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receivers: Option<PluginDirConfig>,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    pub fn load_from_path(path: &std::path::Path) -> Result<Self> {
        sources::load_from_path(path)
    }

    /// Default locations, falling back to built-in defaults; environment
    /// overrides are applied in both cases.
    pub fn load_or_default() -> Result<Self> {
        sources::load_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub period_seconds: u64,
    /// RFC 3339 instant to start retrieving from; epoch when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_from: Option<DateTime<Utc>>,
    /// Directory scanned by the built-in filesystem source; retrieval is
    /// disabled when no source is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_dir: Option<String>,
}

impl RetrievalConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_seconds)
    }

    pub fn start_from(&self) -> DateTime<Utc> {
        self.start_from.unwrap_or(DateTime::UNIX_EPOCH)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            period_seconds: 10,
            start_from: None,
            source_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieJarConfig {
    /// "memory", or a file:// root for the durable backend.
    pub store_url: String,
    pub database_name: String,
    #[serde(default)]
    pub buffer: BufferConfig,
    /// Optional cap on jar operations per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests_per_second: Option<u32>,
}

impl Default for CookieJarConfig {
    fn default() -> Self {
        Self {
            store_url: "memory".to_string(),
            database_name: "cookiemonster".to_string(),
            buffer: BufferConfig::default(),
            max_requests_per_second: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    pub max_size: usize,
    pub latency_ms: u64,
}

impl BufferConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            latency_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub workers: usize,
    pub retry_delay_seconds: u64,
}

impl ProcessorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            retry_delay_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDirConfig {
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 5000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSink {
    Tracing,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub sink: LogSink,
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            sink: LogSink::Tracing,
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}
