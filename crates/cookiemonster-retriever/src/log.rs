// Retrieval log
//
// One append-only entry per retrieval cycle, including cycles that found
// nothing and cycles whose source query failed (count 0).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};

use cookiemonster_store::{Document, DocumentStore, QueryParams, ViewKey};

use crate::error::RetrievalError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalLog {
    /// The watermark the cycle queried from.
    pub retrieved_since: DateTime<Utc>,
    /// Number of merged updates the cycle produced.
    pub count: usize,
    /// Wall time of the source query, measured on a monotonic clock.
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
}

#[async_trait]
pub trait RetrievalLogStore: Send + Sync {
    async fn add(&self, log: RetrievalLog) -> Result<(), RetrievalError>;
    async fn most_recent(&self) -> Result<Option<RetrievalLog>, RetrievalError>;
    async fn count(&self) -> Result<usize, RetrievalError>;
}

/// Retrieval log persisted as documents in a `DocumentStore`.
pub struct DocumentRetrievalLog {
    store: Arc<dyn DocumentStore>,
}

impl DocumentRetrievalLog {
    pub async fn open(store: Arc<dyn DocumentStore>) -> Result<Self, RetrievalError> {
        let design = store.create_design("retrieval");
        design.define_view(
            "by_start",
            |doc: &Document| {
                if doc.str_field("kind") == Some("retrieval_log") {
                    vec![(
                        ViewKey::Int(doc.int_field("started_at").unwrap_or(0)),
                        Value::Null,
                    )]
                } else {
                    Vec::new()
                }
            },
            true,
        );
        store.commit_designs().await?;
        Ok(Self { store })
    }

    fn decode(doc: &Document) -> RetrievalLog {
        RetrievalLog {
            retrieved_since: Utc
                .timestamp_millis_opt(doc.int_field("retrieved_since").unwrap_or(0))
                .single()
                .unwrap_or_else(Utc::now),
            count: doc.int_field("count").unwrap_or(0).max(0) as usize,
            duration: Duration::from_millis(doc.int_field("duration_ms").unwrap_or(0).max(0) as u64),
            started_at: Utc
                .timestamp_millis_opt(doc.int_field("started_at").unwrap_or(0))
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

#[async_trait]
impl RetrievalLogStore for DocumentRetrievalLog {
    async fn add(&self, log: RetrievalLog) -> Result<(), RetrievalError> {
        let mut data = Map::new();
        data.insert("kind".to_string(), json!("retrieval_log"));
        data.insert(
            "retrieved_since".to_string(),
            json!(log.retrieved_since.timestamp_millis()),
        );
        data.insert("count".to_string(), json!(log.count));
        data.insert(
            "duration_ms".to_string(),
            json!(log.duration.as_millis() as u64),
        );
        data.insert(
            "started_at".to_string(),
            json!(log.started_at.timestamp_millis()),
        );
        self.store.save(Document::with_generated_id(data)).await?;
        Ok(())
    }

    async fn most_recent(&self) -> Result<Option<RetrievalLog>, RetrievalError> {
        let mut params = QueryParams::new().include_docs().limit(1);
        params.descending = true;
        let rows = self.store.query("retrieval", "by_start", params).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.doc)
            .map(|doc| Self::decode(&doc)))
    }

    async fn count(&self) -> Result<usize, RetrievalError> {
        let rows = self
            .store
            .query("retrieval", "by_start", QueryParams::new().reduce())
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.value.as_u64())
            .unwrap_or(0) as usize)
    }
}
