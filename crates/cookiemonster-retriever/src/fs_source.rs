// Filesystem update source
//
// Scans a directory tree and reports files whose modification time is newer
// than the watermark. The out-of-the-box source for the packaged service;
// production deployments plug in their own storage-system adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;

use cookiemonster_core::{Metadata, Update};

use crate::error::RetrievalError;
use crate::source::UpdateSource;

pub struct FsUpdateSource {
    operator: opendal::Operator,
    source_name: String,
}

impl FsUpdateSource {
    pub fn new(root: &str) -> Result<Self, RetrievalError> {
        let service = opendal::services::Fs::default().root(root);
        let operator = opendal::Operator::new(service)
            .map_err(|err| RetrievalError::Source(err.to_string()))?
            .finish();
        Ok(Self {
            operator,
            source_name: "fs".to_string(),
        })
    }

    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = name.into();
        self
    }
}

#[async_trait]
impl UpdateSource for FsUpdateSource {
    async fn get_all_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<Update>> {
        let entries = self.operator.list_with("").recursive(true).await?;

        let mut updates = Vec::new();
        for entry in entries {
            if entry.path().ends_with('/') {
                continue;
            }
            let stat = self.operator.stat(entry.path()).await?;
            let Some(modified) = stat.last_modified() else {
                continue;
            };
            if modified <= since {
                continue;
            }

            let mut metadata = Metadata::new();
            metadata.insert("source".to_string(), json!(self.source_name));
            metadata.insert("size".to_string(), json!(stat.content_length()));
            updates.push(Update::new(
                format!("/{}", entry.path()),
                modified,
                metadata,
            ));
        }
        debug!(count = updates.len(), since = %since, "filesystem scan complete");
        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn reports_files_newer_than_the_watermark() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"one").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"two").unwrap();

        let source = FsUpdateSource::new(dir.path().to_str().unwrap()).unwrap();
        let updates = source
            .get_all_since(Utc.timestamp_opt(0, 0).unwrap())
            .await
            .unwrap();

        let mut targets: Vec<&str> = updates.iter().map(|u| u.target.as_str()).collect();
        targets.sort();
        assert_eq!(targets, vec!["/a.txt", "/sub/b.txt"]);
        assert!(updates.iter().all(|u| u.timestamp > Utc.timestamp_opt(0, 0).unwrap()));
    }

    #[tokio::test]
    async fn old_files_are_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"one").unwrap();

        let source = FsUpdateSource::new(dir.path().to_str().unwrap()).unwrap();
        let updates = source
            .get_all_since(Utc::now() + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert!(updates.is_empty());
    }
}
