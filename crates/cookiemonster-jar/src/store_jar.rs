// Store-backed cookie jar
//
// Queue records and enrichment documents share one database, separated by a
// `kind` tag and served by three queue views (ready, in-progress,
// by-identifier) plus an enrichment collation view. All writes go through
// the buffered store, so every mutation here is durable before listeners
// hear about it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use cookiemonster_core::{
    Cookie, CookieJar, Enrichment, JarError, Listenable, QueueChangeListener,
};
use cookiemonster_store::{
    BufferedStore, Document, QueryParams, StoreError, ViewKey,
};

const KIND_FIELD: &str = "kind";
const KIND_QUEUE: &str = "queue";
const KIND_ENRICHMENT: &str = "enrichment";

fn map_store_err(err: StoreError) -> JarError {
    match err {
        StoreError::Unavailable(msg) => JarError::Unavailable(msg),
        other => JarError::Storage(other.to_string()),
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Queue records get a deterministic key so concurrent writers for the same
/// identifier converge on one document.
fn queue_doc_id(identifier: &str) -> String {
    let hex: String = identifier.bytes().map(|b| format!("{b:02x}")).collect();
    format!("queue-{hex}")
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Durable `CookieJar` over a buffered document store.
pub struct StoreCookieJar {
    db: Arc<BufferedStore>,
    listeners: Arc<Listenable<()>>,
    dequeue_lock: AsyncMutex<()>,
    enrichment_seq: AtomicU64,
}

impl StoreCookieJar {
    /// Set up the queue and metadata views, then reset any records left
    /// in-flight by a previous run for immediate reprocessing.
    pub async fn open(db: Arc<BufferedStore>) -> Result<Arc<Self>, JarError> {
        Self::define_views(&db);
        db.commit_designs().await.map_err(map_store_err)?;

        let jar = Arc::new(Self {
            db,
            listeners: Arc::new(Listenable::new()),
            dequeue_lock: AsyncMutex::new(()),
            enrichment_seq: AtomicU64::new(0),
        });
        jar.recover_in_flight().await?;
        jar.recover_enrichment_seq().await?;
        Ok(jar)
    }

    fn define_views(db: &BufferedStore) {
        let queue = db.create_design("queue");
        queue.define_view(
            "to_process",
            |doc: &Document| {
                if doc.str_field(KIND_FIELD) == Some(KIND_QUEUE)
                    && doc.bool_field("dirty")
                    && !doc.bool_field("processing")
                {
                    vec![(
                        ViewKey::Int(doc.int_field("queue_from").unwrap_or(0)),
                        json!(doc.str_field("identifier").unwrap_or_default()),
                    )]
                } else {
                    Vec::new()
                }
            },
            true,
        );
        queue.define_view(
            "in_progress",
            |doc: &Document| {
                if doc.str_field(KIND_FIELD) == Some(KIND_QUEUE) && doc.bool_field("processing") {
                    vec![(
                        ViewKey::Str(doc.str_field("identifier").unwrap_or_default().to_string()),
                        Value::Null,
                    )]
                } else {
                    Vec::new()
                }
            },
            false,
        );
        queue.define_view(
            "by_identifier",
            |doc: &Document| {
                if doc.str_field(KIND_FIELD) == Some(KIND_QUEUE) {
                    vec![(
                        ViewKey::Str(doc.str_field("identifier").unwrap_or_default().to_string()),
                        Value::Null,
                    )]
                } else {
                    Vec::new()
                }
            },
            false,
        );

        let metadata = db.create_design("metadata");
        metadata.define_view(
            "collate",
            |doc: &Document| {
                if doc.str_field(KIND_FIELD) == Some(KIND_ENRICHMENT) {
                    vec![(
                        ViewKey::Str(doc.str_field("identifier").unwrap_or_default().to_string()),
                        json!(doc.int_field("seq").unwrap_or(0)),
                    )]
                } else {
                    Vec::new()
                }
            },
            false,
        );
    }

    /// Anything still marked as processing was orphaned by a crash; put it
    /// straight back on the queue.
    async fn recover_in_flight(&self) -> Result<(), JarError> {
        let rows = self
            .db
            .query("queue", "in_progress", QueryParams::new().include_docs())
            .await
            .map_err(map_store_err)?;
        for row in rows {
            let Some(doc) = row.doc else { continue };
            let identifier = doc.str_field("identifier").unwrap_or_default().to_string();
            info!(identifier, "resetting in-flight cookie after restart");
            let mut data = doc.data.clone();
            data.insert("dirty".to_string(), json!(true));
            data.insert("processing".to_string(), json!(false));
            data.insert("reprocess".to_string(), json!(false));
            data.insert("queue_from".to_string(), json!(now_ms()));
            self.db
                .upsert(data, Some(doc.id))
                .await
                .map_err(map_store_err)?;
        }
        Ok(())
    }

    async fn recover_enrichment_seq(&self) -> Result<(), JarError> {
        let rows = self
            .db
            .query("metadata", "collate", QueryParams::new())
            .await
            .map_err(map_store_err)?;
        let max_seq = rows
            .iter()
            .filter_map(|row| row.value.as_i64())
            .max()
            .unwrap_or(0);
        self.enrichment_seq
            .store(max_seq as u64 + 1, Ordering::SeqCst);
        Ok(())
    }

    fn broadcast(&self) {
        self.listeners.notify_listeners(&());
    }

    async fn queue_record(&self, identifier: &str) -> Result<Option<Document>, JarError> {
        let rows = self
            .db
            .query(
                "queue",
                "by_identifier",
                QueryParams::new()
                    .key(ViewKey::Str(identifier.to_string()))
                    .include_docs(),
            )
            .await
            .map_err(map_store_err)?;
        Ok(rows.into_iter().next().and_then(|row| row.doc))
    }

    fn queue_defaults(identifier: &str) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert(KIND_FIELD.to_string(), json!(KIND_QUEUE));
        data.insert("identifier".to_string(), json!(identifier));
        data.insert("dirty".to_string(), json!(false));
        data.insert("processing".to_string(), json!(false));
        data.insert("reprocess".to_string(), json!(false));
        data.insert("queue_from".to_string(), Value::Null);
        data
    }

    /// Write a queue record update; `existing` keeps the stored key so the
    /// update lands on the same document.
    async fn write_queue_record(
        &self,
        identifier: &str,
        existing: Option<&Document>,
        patch: &[(&str, Value)],
    ) -> Result<(), JarError> {
        let mut data = match existing {
            Some(doc) => doc.data.clone(),
            None => Self::queue_defaults(identifier),
        };
        for (field, value) in patch {
            data.insert(field.to_string(), value.clone());
        }
        let key = existing
            .map(|doc| doc.id.clone())
            .unwrap_or_else(|| queue_doc_id(identifier));
        self.db.upsert(data, Some(key)).await.map_err(map_store_err)
    }

    async fn load_enrichments(&self, identifier: &str) -> Result<Vec<Enrichment>, JarError> {
        let rows = self
            .db
            .query(
                "metadata",
                "collate",
                QueryParams::new()
                    .key(ViewKey::Str(identifier.to_string()))
                    .include_docs(),
            )
            .await
            .map_err(map_store_err)?;

        let mut enrichments: Vec<(i64, Enrichment)> = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(doc) = row.doc else { continue };
            let seq = doc.int_field("seq").unwrap_or(0);
            let metadata = match doc.field("metadata") {
                Some(Value::Object(object)) => object
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
                _ => Default::default(),
            };
            enrichments.push((
                seq,
                Enrichment::new(
                    doc.str_field("source").unwrap_or_default(),
                    ms_to_datetime(doc.int_field("timestamp").unwrap_or(0)),
                    metadata,
                ),
            ));
        }
        enrichments.sort_by(|a, b| {
            a.1.timestamp
                .cmp(&b.1.timestamp)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(enrichments.into_iter().map(|(_, e)| e).collect())
    }

    fn schedule_broadcast(&self, delay: Duration) {
        if delay.is_zero() {
            self.broadcast();
            return;
        }
        let listeners = Arc::clone(&self.listeners);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            listeners.notify_listeners(&());
        });
    }
}

#[async_trait]
impl CookieJar for StoreCookieJar {
    async fn fetch_cookie(&self, identifier: &str) -> Result<Option<Cookie>, JarError> {
        let enrichments = self.load_enrichments(identifier).await?;
        if enrichments.is_empty() && self.queue_record(identifier).await?.is_none() {
            return Ok(None);
        }
        Ok(Some(Cookie {
            identifier: identifier.to_string(),
            enrichments,
        }))
    }

    async fn delete_cookie(&self, identifier: &str) -> Result<(), JarError> {
        if let Some(record) = self.queue_record(identifier).await? {
            self.db.delete(&record.id).await.map_err(map_store_err)?;
        }
        let rows = self
            .db
            .query(
                "metadata",
                "collate",
                QueryParams::new().key(ViewKey::Str(identifier.to_string())),
            )
            .await
            .map_err(map_store_err)?;
        for row in rows {
            self.db.delete(&row.id).await.map_err(map_store_err)?;
        }
        Ok(())
    }

    async fn enrich_cookie(
        &self,
        identifier: &str,
        enrichment: Enrichment,
    ) -> Result<(), JarError> {
        let seq = self.enrichment_seq.fetch_add(1, Ordering::SeqCst);
        let mut data = Map::new();
        data.insert(KIND_FIELD.to_string(), json!(KIND_ENRICHMENT));
        data.insert("identifier".to_string(), json!(identifier));
        data.insert("source".to_string(), json!(enrichment.source));
        data.insert(
            "timestamp".to_string(),
            json!(enrichment.timestamp.timestamp_millis()),
        );
        data.insert("seq".to_string(), json!(seq));
        data.insert(
            "metadata".to_string(),
            Value::Object(enrichment.metadata.into_iter().collect()),
        );
        self.db.upsert(data, None).await.map_err(map_store_err)?;

        let record = self.queue_record(identifier).await?;
        let in_flight = record
            .as_ref()
            .map(|doc| doc.bool_field("processing"))
            .unwrap_or(false);
        if in_flight {
            // Enrichment raced an active dispatch: flag it so completion
            // re-enqueues instead of resting.
            self.write_queue_record(identifier, record.as_ref(), &[("reprocess", json!(true))])
                .await?;
            return Ok(());
        }

        self.write_queue_record(
            identifier,
            record.as_ref(),
            &[
                ("dirty", json!(true)),
                ("reprocess", json!(false)),
                ("queue_from", json!(now_ms())),
            ],
        )
        .await?;
        self.broadcast();
        Ok(())
    }

    async fn mark_as_failed(
        &self,
        identifier: &str,
        requeue_delay: Duration,
    ) -> Result<(), JarError> {
        let record = self.queue_record(identifier).await?;
        let queue_from = now_ms() + requeue_delay.as_millis() as i64;
        self.write_queue_record(
            identifier,
            record.as_ref(),
            &[
                ("dirty", json!(true)),
                ("processing", json!(false)),
                ("reprocess", json!(false)),
                ("queue_from", json!(queue_from)),
            ],
        )
        .await?;
        warn!(identifier, delay_ms = requeue_delay.as_millis() as u64, "cookie marked as failed");
        self.schedule_broadcast(requeue_delay);
        Ok(())
    }

    async fn mark_as_complete(&self, identifier: &str) -> Result<(), JarError> {
        let record = match self.queue_record(identifier).await? {
            Some(record) => record,
            // Completing an unknown cookie is a no-op.
            None => return Ok(()),
        };

        if record.bool_field("reprocess") {
            // An enrichment arrived while this cookie was in flight.
            self.write_queue_record(
                identifier,
                Some(&record),
                &[
                    ("dirty", json!(true)),
                    ("processing", json!(false)),
                    ("reprocess", json!(false)),
                    ("queue_from", json!(now_ms())),
                ],
            )
            .await?;
            self.broadcast();
        } else {
            self.write_queue_record(identifier, Some(&record), &[("processing", json!(false))])
                .await?;
        }
        Ok(())
    }

    async fn mark_for_processing(&self, identifier: &str) -> Result<(), JarError> {
        let record = self.queue_record(identifier).await?;
        let in_flight = record
            .as_ref()
            .map(|doc| doc.bool_field("processing"))
            .unwrap_or(false);
        if in_flight {
            self.write_queue_record(identifier, record.as_ref(), &[("reprocess", json!(true))])
                .await?;
            return Ok(());
        }

        self.write_queue_record(
            identifier,
            record.as_ref(),
            &[
                ("dirty", json!(true)),
                ("reprocess", json!(false)),
                ("queue_from", json!(now_ms())),
            ],
        )
        .await?;
        self.broadcast();
        Ok(())
    }

    async fn get_next_for_processing(&self) -> Result<Option<Cookie>, JarError> {
        let identifier = {
            // Exclusive section: one indexed lookup and one record update.
            let _guard = self.dequeue_lock.lock().await;
            let rows = self
                .db
                .query(
                    "queue",
                    "to_process",
                    QueryParams::new()
                        .end_key(ViewKey::Int(now_ms()))
                        .limit(1)
                        .include_docs(),
                )
                .await
                .map_err(map_store_err)?;

            let Some(row) = rows.into_iter().next() else {
                return Ok(None);
            };
            let Some(doc) = row.doc else {
                return Ok(None);
            };
            let identifier = doc.str_field("identifier").unwrap_or_default().to_string();
            self.write_queue_record(
                &identifier,
                Some(&doc),
                &[
                    ("dirty", json!(false)),
                    ("processing", json!(true)),
                    ("queue_from", Value::Null),
                ],
            )
            .await?;
            identifier
        };

        let enrichments = self.load_enrichments(&identifier).await?;
        Ok(Some(Cookie {
            identifier,
            enrichments,
        }))
    }

    async fn queue_length(&self) -> Result<usize, JarError> {
        let rows = self
            .db
            .query(
                "queue",
                "to_process",
                QueryParams::new().end_key(ViewKey::Int(now_ms())).reduce(),
            )
            .await
            .map_err(map_store_err)?;
        Ok(rows
            .first()
            .and_then(|row| row.value.as_u64())
            .unwrap_or(0) as usize)
    }

    fn add_listener(&self, listener: QueueChangeListener) {
        self.listeners
            .add_listener(Arc::new(move |_: &()| listener()));
    }
}
