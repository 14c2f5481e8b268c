// Timed jar wrapper
//
// Wraps any CookieJar and records a "<method>_time" measurement around each
// call without changing the wrapped jar's contract.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use cookiemonster_core::{
    Cookie, CookieJar, Enrichment, JarError, QueueChangeListener,
};

use crate::logger::{Measurement, MeasurementLogger};

pub struct TimedCookieJar {
    inner: Arc<dyn CookieJar>,
    logger: Arc<dyn MeasurementLogger>,
}

impl TimedCookieJar {
    pub fn new(inner: Arc<dyn CookieJar>, logger: Arc<dyn MeasurementLogger>) -> Self {
        Self { inner, logger }
    }

    fn record(&self, measured: &str, started: Instant) {
        self.logger.record(Measurement::single(
            measured,
            json!(started.elapsed().as_secs_f64()),
        ));
    }
}

#[async_trait]
impl CookieJar for TimedCookieJar {
    async fn fetch_cookie(&self, identifier: &str) -> Result<Option<Cookie>, JarError> {
        let started = Instant::now();
        let result = self.inner.fetch_cookie(identifier).await;
        self.record("fetch_cookie_time", started);
        result
    }

    async fn delete_cookie(&self, identifier: &str) -> Result<(), JarError> {
        let started = Instant::now();
        let result = self.inner.delete_cookie(identifier).await;
        self.record("delete_cookie_time", started);
        result
    }

    async fn enrich_cookie(
        &self,
        identifier: &str,
        enrichment: Enrichment,
    ) -> Result<(), JarError> {
        let started = Instant::now();
        let result = self.inner.enrich_cookie(identifier, enrichment).await;
        self.record("enrich_cookie_time", started);
        result
    }

    async fn mark_as_failed(
        &self,
        identifier: &str,
        requeue_delay: Duration,
    ) -> Result<(), JarError> {
        let started = Instant::now();
        let result = self.inner.mark_as_failed(identifier, requeue_delay).await;
        self.record("mark_as_failed_time", started);
        result
    }

    async fn mark_as_complete(&self, identifier: &str) -> Result<(), JarError> {
        let started = Instant::now();
        let result = self.inner.mark_as_complete(identifier).await;
        self.record("mark_as_complete_time", started);
        result
    }

    async fn mark_for_processing(&self, identifier: &str) -> Result<(), JarError> {
        let started = Instant::now();
        let result = self.inner.mark_for_processing(identifier).await;
        self.record("mark_for_processing_time", started);
        result
    }

    async fn get_next_for_processing(&self) -> Result<Option<Cookie>, JarError> {
        let started = Instant::now();
        let result = self.inner.get_next_for_processing().await;
        self.record("get_next_for_processing_time", started);
        result
    }

    async fn queue_length(&self) -> Result<usize, JarError> {
        let started = Instant::now();
        let result = self.inner.queue_length().await;
        self.record("queue_length_time", started);
        result
    }

    fn add_listener(&self, listener: QueueChangeListener) {
        self.inner.add_listener(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{BufferedLogger, LoggerConfig};
    use crate::sink::MemorySink;
    use chrono::Utc;
    use cookiemonster_core::Metadata;
    use cookiemonster_jar::MemoryCookieJar;

    #[tokio::test]
    async fn every_call_is_timed_and_forwarded() {
        let sink = Arc::new(MemorySink::new());
        let logger = Arc::new(BufferedLogger::new(
            sink.clone(),
            LoggerConfig {
                max_buffer_size: 1,
                buffer_latency: Duration::from_millis(10),
            },
        ));
        let jar = TimedCookieJar::new(Arc::new(MemoryCookieJar::new()), logger);

        jar.enrich_cookie("/a", Enrichment::new("r", Utc::now(), Metadata::new()))
            .await
            .unwrap();
        assert_eq!(jar.queue_length().await.unwrap(), 1);
        let cookie = jar.get_next_for_processing().await.unwrap().unwrap();
        assert_eq!(cookie.identifier, "/a");

        let measured: Vec<String> = sink
            .recorded()
            .iter()
            .map(|m| m.measured.clone())
            .collect();
        assert_eq!(
            measured,
            vec![
                "enrich_cookie_time",
                "queue_length_time",
                "get_next_for_processing_time"
            ]
        );
        assert!(sink
            .recorded()
            .iter()
            .all(|m| m.values["value"].as_f64().unwrap() >= 0.0));
    }

    #[tokio::test]
    async fn listeners_pass_through_to_the_wrapped_jar() {
        let sink = Arc::new(MemorySink::new());
        let logger = Arc::new(BufferedLogger::new(sink, LoggerConfig::default()));
        let jar = TimedCookieJar::new(Arc::new(MemoryCookieJar::new()), logger);

        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            jar.add_listener(Arc::new(move || {
                fired.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }

        jar.enrich_cookie("/a", Enrichment::new("r", Utc::now(), Metadata::new()))
            .await
            .unwrap();
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
