// Two-query reference source adapter
//
// Storage systems typically expose data-object modifications and metadata
// modifications as separate prepared queries. Both run concurrently and
// must complete (or one must fail fast) before the combined per-target
// merge runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::try_join;

use cookiemonster_core::{merge_updates, Update};

use crate::source::UpdateSource;

/// A client exposing the two prepared queries of the reference storage
/// system.
#[async_trait]
pub trait QueryClient: Send + Sync {
    async fn data_object_modifications(
        &self,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Update>>;

    async fn metadata_modifications(&self, since: DateTime<Utc>)
        -> anyhow::Result<Vec<Update>>;
}

pub struct PreparedQuerySource<C> {
    client: C,
}

impl<C: QueryClient> PreparedQuerySource<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: QueryClient> UpdateSource for PreparedQuerySource<C> {
    async fn get_all_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<Update>> {
        let (data, metadata) = try_join!(
            self.client.data_object_modifications(since),
            self.client.metadata_modifications(since),
        )?;

        let mut updates = data;
        updates.extend(metadata);
        // Targets touched by both queries collapse into one update here, so
        // the manager's own merge is a no-op for them.
        let updates = merge_updates(updates);
        Ok(updates
            .into_iter()
            .filter(|update| update.timestamp > since)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cookiemonster_core::Metadata;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    struct StubClient {
        data: anyhow::Result<Vec<Update>>,
        metadata: anyhow::Result<Vec<Update>>,
    }

    #[async_trait]
    impl QueryClient for StubClient {
        async fn data_object_modifications(
            &self,
            _since: DateTime<Utc>,
        ) -> anyhow::Result<Vec<Update>> {
            match &self.data {
                Ok(updates) => Ok(updates.clone()),
                Err(err) => Err(anyhow::anyhow!("{err}")),
            }
        }

        async fn metadata_modifications(
            &self,
            _since: DateTime<Utc>,
        ) -> anyhow::Result<Vec<Update>> {
            match &self.metadata {
                Ok(updates) => Ok(updates.clone()),
                Err(err) => Err(anyhow::anyhow!("{err}")),
            }
        }
    }

    fn update(target: &str, secs: i64, key: &str, value: serde_json::Value) -> Update {
        let mut metadata = Metadata::new();
        metadata.insert(key.to_string(), value);
        Update::new(target, ts(secs), metadata)
    }

    #[tokio::test]
    async fn combines_both_queries_per_target() {
        let source = PreparedQuerySource::new(StubClient {
            data: Ok(vec![update("/x", 50, "modified_replicas", json!([0]))]),
            metadata: Ok(vec![update(
                "/x",
                60,
                "modified_metadata_attributes",
                json!(["study"]),
            )]),
        });

        let updates = source.get_all_since(ts(0)).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].timestamp, ts(60));
        assert_eq!(updates[0].metadata["modified_replicas"], json!([0]));
        assert_eq!(
            updates[0].metadata["modified_metadata_attributes"],
            json!(["study"])
        );
    }

    #[tokio::test]
    async fn one_failing_query_fails_the_whole_retrieval() {
        let source = PreparedQuerySource::new(StubClient {
            data: Ok(vec![update("/x", 50, "size", json!(1))]),
            metadata: Err(anyhow::anyhow!("metadata query timed out")),
        });

        assert!(source.get_all_since(ts(0)).await.is_err());
    }

    #[tokio::test]
    async fn stale_results_are_filtered_out() {
        let source = PreparedQuerySource::new(StubClient {
            data: Ok(vec![
                update("/old", 10, "size", json!(1)),
                update("/new", 90, "size", json!(2)),
            ]),
            metadata: Ok(Vec::new()),
        });

        let updates = source.get_all_since(ts(50)).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].target, "/new");
    }
}
