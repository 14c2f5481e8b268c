// In-memory cookie jar
//
// The full CookieJar contract over process memory. Used by tests and small
// deployments where durability across restarts is not needed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use cookiemonster_core::{
    Cookie, CookieJar, Enrichment, JarError, Listenable, QueueChangeListener,
};

#[derive(Default)]
struct CookieState {
    enrichments: Vec<Enrichment>,
    dirty: bool,
    processing: bool,
    reprocess: bool,
    queue_from: Option<DateTime<Utc>>,
}

pub struct MemoryCookieJar {
    cookies: Mutex<BTreeMap<String, CookieState>>,
    listeners: Arc<Listenable<()>>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self {
            cookies: Mutex::new(BTreeMap::new()),
            listeners: Arc::new(Listenable::new()),
        }
    }

    fn broadcast(&self) {
        self.listeners.notify_listeners(&());
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

impl Default for MemoryCookieJar {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CookieJar for MemoryCookieJar {
    async fn fetch_cookie(&self, identifier: &str) -> Result<Option<Cookie>, JarError> {
        let cookies = self.cookies.lock();
        Ok(cookies.get(identifier).map(|state| {
            let mut enrichments = state.enrichments.clone();
            enrichments.sort_by_key(|e| e.timestamp);
            Cookie {
                identifier: identifier.to_string(),
                enrichments,
            }
        }))
    }

    async fn delete_cookie(&self, identifier: &str) -> Result<(), JarError> {
        self.cookies.lock().remove(identifier);
        Ok(())
    }

    async fn enrich_cookie(
        &self,
        identifier: &str,
        enrichment: Enrichment,
    ) -> Result<(), JarError> {
        let in_flight = {
            let mut cookies = self.cookies.lock();
            let state = cookies.entry(identifier.to_string()).or_default();
            state.enrichments.push(enrichment);
            if state.processing {
                state.reprocess = true;
                true
            } else {
                state.dirty = true;
                state.reprocess = false;
                state.queue_from = Some(Utc::now());
                false
            }
        };
        if !in_flight {
            self.broadcast();
        }
        Ok(())
    }

    async fn mark_as_failed(
        &self,
        identifier: &str,
        requeue_delay: Duration,
    ) -> Result<(), JarError> {
        {
            let mut cookies = self.cookies.lock();
            let state = cookies.entry(identifier.to_string()).or_default();
            state.processing = false;
            state.reprocess = false;
            state.dirty = true;
            state.queue_from = Some(
                Utc::now()
                    + chrono::Duration::milliseconds(requeue_delay.as_millis() as i64),
            );
        }
        self.schedule_broadcast(requeue_delay);
        Ok(())
    }

    async fn mark_as_complete(&self, identifier: &str) -> Result<(), JarError> {
        let requeued = {
            let mut cookies = self.cookies.lock();
            match cookies.get_mut(identifier) {
                None => false,
                Some(state) => {
                    state.processing = false;
                    if state.reprocess {
                        state.reprocess = false;
                        state.dirty = true;
                        state.queue_from = Some(Utc::now());
                        true
                    } else {
                        false
                    }
                }
            }
        };
        if requeued {
            self.broadcast();
        }
        Ok(())
    }

    async fn mark_for_processing(&self, identifier: &str) -> Result<(), JarError> {
        let in_flight = {
            let mut cookies = self.cookies.lock();
            let state = cookies.entry(identifier.to_string()).or_default();
            if state.processing {
                state.reprocess = true;
                true
            } else {
                state.dirty = true;
                state.reprocess = false;
                state.queue_from = Some(Utc::now());
                false
            }
        };
        if !in_flight {
            self.broadcast();
        }
        Ok(())
    }

    async fn get_next_for_processing(&self) -> Result<Option<Cookie>, JarError> {
        let now = Utc::now();
        let mut cookies = self.cookies.lock();

        let next = cookies
            .iter()
            .filter(|(_, state)| {
                state.dirty
                    && !state.processing
                    && state.queue_from.map(|from| from <= now).unwrap_or(false)
            })
            .min_by_key(|(identifier, state)| (state.queue_from, identifier.clone()))
            .map(|(identifier, _)| identifier.clone());

        let Some(identifier) = next else {
            return Ok(None);
        };
        let state = cookies
            .get_mut(&identifier)
            .expect("selected cookie must exist");
        state.dirty = false;
        state.processing = true;
        state.queue_from = None;

        let mut enrichments = state.enrichments.clone();
        enrichments.sort_by_key(|e| e.timestamp);
        Ok(Some(Cookie {
            identifier,
            enrichments,
        }))
    }

    async fn queue_length(&self) -> Result<usize, JarError> {
        let now = Utc::now();
        Ok(self
            .cookies
            .lock()
            .values()
            .filter(|state| {
                state.dirty
                    && !state.processing
                    && state.queue_from.map(|from| from <= now).unwrap_or(false)
            })
            .count())
    }

    fn add_listener(&self, listener: QueueChangeListener) {
        self.listeners
            .add_listener(Arc::new(move |_: &()| listener()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cookiemonster_core::Metadata;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn enrichment(source: &str, secs: i64) -> Enrichment {
        Enrichment::new(source, Utc.timestamp_opt(secs, 0).unwrap(), Metadata::new())
    }

    #[tokio::test]
    async fn contract_matches_the_store_backed_jar() {
        let jar = MemoryCookieJar::new();
        assert_eq!(jar.queue_length().await.unwrap(), 0);
        assert!(jar.get_next_for_processing().await.unwrap().is_none());

        jar.enrich_cookie("/foo", enrichment("r", 100)).await.unwrap();
        assert_eq!(jar.queue_length().await.unwrap(), 1);

        let cookie = jar.get_next_for_processing().await.unwrap().unwrap();
        assert_eq!(cookie.identifier, "/foo");
        assert_eq!(jar.queue_length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn out_of_order_enrichment_is_sorted_on_read() {
        let jar = MemoryCookieJar::new();
        jar.enrich_cookie("/foo", enrichment("late", 200)).await.unwrap();
        jar.enrich_cookie("/foo", enrichment("early", 100)).await.unwrap();

        let cookie = jar.fetch_cookie("/foo").await.unwrap().unwrap();
        assert_eq!(cookie.enrichments[0].source, "early");
        assert_eq!(cookie.enrichments[1].source, "late");
    }

    #[tokio::test]
    async fn reprocess_flag_survives_completion() {
        let jar = MemoryCookieJar::new();
        jar.enrich_cookie("/foo", enrichment("first", 100)).await.unwrap();
        jar.get_next_for_processing().await.unwrap().unwrap();

        jar.enrich_cookie("/foo", enrichment("second", 200)).await.unwrap();
        assert_eq!(jar.queue_length().await.unwrap(), 0);

        jar.mark_as_complete("/foo").await.unwrap();
        assert_eq!(jar.queue_length().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn listeners_fire_on_queue_changes_only() {
        let jar = MemoryCookieJar::new();
        let broadcasts = Arc::new(AtomicUsize::new(0));
        {
            let broadcasts = Arc::clone(&broadcasts);
            jar.add_listener(Arc::new(move || {
                broadcasts.fetch_add(1, Ordering::SeqCst);
            }));
        }

        jar.enrich_cookie("/foo", enrichment("r", 100)).await.unwrap();
        assert_eq!(broadcasts.load(Ordering::SeqCst), 1);

        jar.get_next_for_processing().await.unwrap().unwrap();
        jar.enrich_cookie("/foo", enrichment("r", 200)).await.unwrap();
        // In-flight enrichment defers its broadcast to completion.
        assert_eq!(broadcasts.load(Ordering::SeqCst), 1);
        jar.mark_as_complete("/foo").await.unwrap();
        assert_eq!(broadcasts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn delayed_failure_keeps_cookie_out_of_queue() {
        let jar = MemoryCookieJar::new();
        jar.enrich_cookie("/foo", enrichment("r", 100)).await.unwrap();
        jar.get_next_for_processing().await.unwrap().unwrap();

        jar.mark_as_failed("/foo", Duration::from_millis(60)).await.unwrap();
        assert_eq!(jar.queue_length().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(jar.queue_length().await.unwrap(), 1);
    }
}
