// Retry jar middleware
//
// Retries transient store unavailability with exponential backoff. Anything
// other than `JarError::Unavailable` passes straight through: conflicts are
// already resolved below, and logic errors should not be retried.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use cookiemonster_core::{
    Cookie, CookieJar, Enrichment, JarError, QueueChangeListener,
};

pub struct RetryingCookieJar {
    inner: Arc<dyn CookieJar>,
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryingCookieJar {
    pub fn new(inner: Arc<dyn CookieJar>, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    async fn retry<T, F, Fut>(&self, operation: F) -> Result<T, JarError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, JarError>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Err(JarError::Unavailable(msg)) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(JarError::Unavailable(msg));
                    }
                    let delay = self.base_delay.saturating_mul(1 << attempt.min(10));
                    warn!(%msg, attempt, "jar unavailable, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl CookieJar for RetryingCookieJar {
    async fn fetch_cookie(&self, identifier: &str) -> Result<Option<Cookie>, JarError> {
        self.retry(|| self.inner.fetch_cookie(identifier)).await
    }

    async fn delete_cookie(&self, identifier: &str) -> Result<(), JarError> {
        self.retry(|| self.inner.delete_cookie(identifier)).await
    }

    async fn enrich_cookie(
        &self,
        identifier: &str,
        enrichment: Enrichment,
    ) -> Result<(), JarError> {
        self.retry(|| self.inner.enrich_cookie(identifier, enrichment.clone()))
            .await
    }

    async fn mark_as_failed(
        &self,
        identifier: &str,
        requeue_delay: Duration,
    ) -> Result<(), JarError> {
        self.retry(|| self.inner.mark_as_failed(identifier, requeue_delay))
            .await
    }

    async fn mark_as_complete(&self, identifier: &str) -> Result<(), JarError> {
        self.retry(|| self.inner.mark_as_complete(identifier)).await
    }

    async fn mark_for_processing(&self, identifier: &str) -> Result<(), JarError> {
        self.retry(|| self.inner.mark_for_processing(identifier))
            .await
    }

    async fn get_next_for_processing(&self) -> Result<Option<Cookie>, JarError> {
        self.retry(|| self.inner.get_next_for_processing()).await
    }

    async fn queue_length(&self) -> Result<usize, JarError> {
        self.retry(|| self.inner.queue_length()).await
    }

    fn add_listener(&self, listener: QueueChangeListener) {
        self.inner.add_listener(listener);
    }
}
