use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cookiemonster_core::Update;

/// An external source of file updates.
///
/// Every returned update must carry a timestamp strictly newer than
/// `since`. The source may fail; the retrieval manager treats failures as
/// an empty cycle without advancing its watermark.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn get_all_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<Update>>;
}
