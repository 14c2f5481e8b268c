// Rate-limited jar middleware
//
// Token bucket across all jar methods: capacity R, one token released back
// 1/R seconds after being taken, so sustained throughput settles at R
// operations per second.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use cookiemonster_core::{
    Cookie, CookieJar, Enrichment, JarError, QueueChangeListener,
};

pub struct RateLimitedCookieJar {
    inner: Arc<dyn CookieJar>,
    tokens: Arc<Semaphore>,
    refill: Duration,
}

impl RateLimitedCookieJar {
    pub fn new(inner: Arc<dyn CookieJar>, max_requests_per_second: u32) -> Self {
        let capacity = max_requests_per_second.max(1);
        Self {
            inner,
            tokens: Arc::new(Semaphore::new(capacity as usize)),
            refill: Duration::from_secs_f64(1.0 / f64::from(capacity)),
        }
    }

    async fn take_token(&self) {
        let permit = self
            .tokens
            .acquire()
            .await
            .expect("token semaphore never closes");
        permit.forget();

        let tokens = Arc::clone(&self.tokens);
        let refill = self.refill;
        tokio::spawn(async move {
            tokio::time::sleep(refill).await;
            tokens.add_permits(1);
        });
    }
}

#[async_trait]
impl CookieJar for RateLimitedCookieJar {
    async fn fetch_cookie(&self, identifier: &str) -> Result<Option<Cookie>, JarError> {
        self.take_token().await;
        self.inner.fetch_cookie(identifier).await
    }

    async fn delete_cookie(&self, identifier: &str) -> Result<(), JarError> {
        self.take_token().await;
        self.inner.delete_cookie(identifier).await
    }

    async fn enrich_cookie(
        &self,
        identifier: &str,
        enrichment: Enrichment,
    ) -> Result<(), JarError> {
        self.take_token().await;
        self.inner.enrich_cookie(identifier, enrichment).await
    }

    async fn mark_as_failed(
        &self,
        identifier: &str,
        requeue_delay: Duration,
    ) -> Result<(), JarError> {
        self.take_token().await;
        self.inner.mark_as_failed(identifier, requeue_delay).await
    }

    async fn mark_as_complete(&self, identifier: &str) -> Result<(), JarError> {
        self.take_token().await;
        self.inner.mark_as_complete(identifier).await
    }

    async fn mark_for_processing(&self, identifier: &str) -> Result<(), JarError> {
        self.take_token().await;
        self.inner.mark_for_processing(identifier).await
    }

    async fn get_next_for_processing(&self) -> Result<Option<Cookie>, JarError> {
        self.take_token().await;
        self.inner.get_next_for_processing().await
    }

    async fn queue_length(&self) -> Result<usize, JarError> {
        self.take_token().await;
        self.inner.queue_length().await
    }

    fn add_listener(&self, listener: QueueChangeListener) {
        self.inner.add_listener(listener);
    }
}
