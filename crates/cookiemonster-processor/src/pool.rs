// Processor pool
//
// Workers are fungible; the pool is just a permit count. A dispatch pass
// claims a permit, claims a cookie, and hands both to a spawned worker;
// when the worker finishes it returns the permit and triggers another pass,
// which keeps the pool saturated without a global scheduler thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use cookiemonster_core::{
    Context, Cookie, CookieJar, EnrichmentLoader, NotificationReceiver, Registrable, Rule,
};
use cookiemonster_registry::Registry;

use crate::pipeline::{evaluate, unknown_notification, Outcome};

#[derive(Debug, Clone)]
pub struct ProcessorPoolConfig {
    pub workers: usize,
    /// Requeue delay applied when a cookie's processing fails.
    pub retry_delay: Duration,
}

impl Default for ProcessorPoolConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            retry_delay: Duration::ZERO,
        }
    }
}

struct PoolInner {
    jar: Arc<dyn CookieJar>,
    rules: Arc<Registry<Rule>>,
    loaders: Arc<Registry<EnrichmentLoader>>,
    receivers: Arc<Registry<NotificationReceiver>>,
    ctx: Arc<Context>,
    idle: Arc<Semaphore>,
    wake: Notify,
    stopped: AtomicBool,
    workers: usize,
    retry_delay: Duration,
}

pub struct ProcessorPool {
    inner: Arc<PoolInner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessorPool {
    pub fn new(
        config: ProcessorPoolConfig,
        jar: Arc<dyn CookieJar>,
        rules: Arc<Registry<Rule>>,
        loaders: Arc<Registry<EnrichmentLoader>>,
        receivers: Arc<Registry<NotificationReceiver>>,
        ctx: Arc<Context>,
    ) -> Self {
        let workers = config.workers.max(1);
        Self {
            inner: Arc::new(PoolInner {
                jar,
                rules,
                loaders,
                receivers,
                ctx,
                idle: Arc::new(Semaphore::new(workers)),
                wake: Notify::new(),
                stopped: AtomicBool::new(false),
                workers,
                retry_delay: config.retry_delay,
            }),
            dispatcher: Mutex::new(None),
        }
    }

    /// Workers currently processing a cookie.
    pub fn busy_workers(&self) -> usize {
        self.inner.workers - self.inner.idle.available_permits()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers
    }

    /// Subscribe to the jar's queue events and start dispatching. Starting
    /// twice has no effect.
    pub fn start(&self) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return;
        }

        {
            let inner = Arc::clone(&self.inner);
            self.inner.jar.add_listener(Arc::new(move || {
                inner.wake.notify_one();
            }));
        }

        let inner = Arc::clone(&self.inner);
        *dispatcher = Some(tokio::spawn(async move {
            // Drain whatever was ready before we subscribed.
            dispatch_pass(&inner).await;
            loop {
                inner.wake.notified().await;
                if inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                dispatch_pass(&inner).await;
            }
            debug!("processor dispatcher stopped");
        }));
    }

    /// Stop dispatching and wait for in-flight cookies to finish.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }

        // Every worker permit back home means every worker is idle.
        let _ = self
            .inner
            .idle
            .acquire_many(self.inner.workers as u32)
            .await;
    }
}

async fn dispatch_pass(inner: &Arc<PoolInner>) {
    loop {
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let Ok(permit) = Arc::clone(&inner.idle).try_acquire_owned() else {
            return;
        };

        match inner.jar.get_next_for_processing().await {
            Ok(Some(cookie)) => {
                counter!("cookiemonster.processor.dispatched", 1);
                let inner = Arc::clone(inner);
                tokio::spawn(run_worker(inner, cookie, permit));
            }
            Ok(None) => {
                drop(permit);
                return;
            }
            Err(err) => {
                warn!(%err, "failed to dequeue next cookie");
                drop(permit);
                return;
            }
        }
    }
}

async fn run_worker(inner: Arc<PoolInner>, cookie: Cookie, permit: OwnedSemaphorePermit) {
    process_cookie(&inner, cookie).await;
    drop(permit);
    // Seek more work: completion is itself a dispatch trigger.
    inner.wake.notify_one();
}

async fn process_cookie(inner: &Arc<PoolInner>, cookie: Cookie) {
    // Snapshots are taken per cookie so hot reloads apply between cookies.
    let rules = inner.rules.get_all();
    let loaders = inner.loaders.get_all();
    let identifier = cookie.identifier.clone();

    match evaluate(&cookie, &rules, &loaders, &inner.ctx) {
        Ok(Outcome::Notify(notifications)) => {
            deliver(inner, &notifications);
            if let Err(err) = inner.jar.mark_as_complete(&identifier).await {
                warn!(identifier, %err, "failed to complete cookie");
            }
        }
        Ok(Outcome::Enrich(enrichment)) => {
            debug!(identifier, source = %enrichment.source, "cookie enriched, requeueing");
            if let Err(err) = inner.jar.enrich_cookie(&identifier, enrichment).await {
                warn!(identifier, %err, "failed to store enrichment");
            }
        }
        Ok(Outcome::Unknown) => {
            counter!("cookiemonster.processor.unknown", 1);
            deliver(inner, &[unknown_notification(&cookie)]);
            if let Err(err) = inner.jar.mark_as_complete(&identifier).await {
                warn!(identifier, %err, "failed to complete unknown cookie");
            }
        }
        Err(err) => {
            counter!("cookiemonster.processor.failed", 1);
            warn!(identifier, %err, "cookie processing failed");
            if let Err(err) = inner
                .jar
                .mark_as_failed(&identifier, inner.retry_delay)
                .await
            {
                warn!(identifier, %err, "failed to mark cookie as failed");
            }
        }
    }
}

/// Best-effort fan-out: every receiver sees every notification; a receiver
/// error is logged and delivery continues. No shared lock is held here.
fn deliver(inner: &Arc<PoolInner>, notifications: &[cookiemonster_core::Notification]) {
    if notifications.is_empty() {
        return;
    }
    for receiver in inner.receivers.get_all().iter() {
        for notification in notifications {
            if let Err(err) = receiver.receive(notification, &inner.ctx) {
                warn!(
                    receiver = receiver.stable_id(),
                    about = %notification.about,
                    %err,
                    "notification receiver failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cookiemonster_core::{Enrichment, Metadata, Notification, RuleAction};
    use cookiemonster_jar::MemoryCookieJar;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        jar: Arc<MemoryCookieJar>,
        rules: Arc<Registry<Rule>>,
        loaders: Arc<Registry<EnrichmentLoader>>,
        receivers: Arc<Registry<NotificationReceiver>>,
        received: Arc<Mutex<Vec<Notification>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let received = Arc::new(Mutex::new(Vec::new()));
            let receivers: Arc<Registry<NotificationReceiver>> = Arc::new(Registry::new());
            {
                let received = Arc::clone(&received);
                receivers.register_static(NotificationReceiver::new(
                    "collector",
                    move |notification, _ctx| {
                        received.lock().push(notification.clone());
                        Ok(())
                    },
                ));
            }
            Self {
                jar: Arc::new(MemoryCookieJar::new()),
                rules: Arc::new(Registry::new()),
                loaders: Arc::new(Registry::new()),
                receivers,
                received,
            }
        }

        fn pool(&self, config: ProcessorPoolConfig) -> ProcessorPool {
            let jar: Arc<dyn CookieJar> = self.jar.clone();
            ProcessorPool::new(
                config,
                jar.clone(),
                Arc::clone(&self.rules),
                Arc::clone(&self.loaders),
                Arc::clone(&self.receivers),
                Arc::new(Context::new(jar)),
            )
        }
    }

    fn enrichment(source: &str) -> Enrichment {
        Enrichment::new(source, Utc::now(), Metadata::new())
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within two seconds");
    }

    #[tokio::test]
    async fn matched_cookie_notifies_and_completes() {
        let fixture = Fixture::new();
        fixture.rules.register_static(Rule::new(
            "no-match",
            1,
            |_, _| Ok(false),
            |_, _| Ok(RuleAction::new(Vec::new(), false)),
        ));
        fixture.rules.register_static(Rule::new(
            "match-high",
            9,
            |cookie, _| Ok(cookie.identifier == "/cookie/matches"),
            |_, _| {
                Ok(RuleAction::new(
                    vec![Notification::new("N", "match-high", serde_json::Value::Null)],
                    true,
                ))
            },
        ));
        let loader_calls = Arc::new(AtomicUsize::new(0));
        {
            let loader_calls = Arc::clone(&loader_calls);
            fixture.loaders.register_static(EnrichmentLoader::new(
                "always",
                1,
                move |_, _| {
                    loader_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                },
                |_, _| Ok(enrichment("always")),
            ));
        }

        let pool = fixture.pool(ProcessorPoolConfig::default());
        pool.start();

        fixture
            .jar
            .enrich_cookie("/cookie/matches", enrichment("seed"))
            .await
            .unwrap();

        let received = Arc::clone(&fixture.received);
        wait_until(move || received.lock().len() == 1).await;
        assert_eq!(fixture.received.lock()[0].about, "N");
        // The terminating match means no enrichment loader is consulted.
        assert_eq!(loader_calls.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.jar.queue_length().await.unwrap(), 0);

        pool.stop().await;
    }

    #[tokio::test]
    async fn enrichment_loop_runs_until_a_rule_matches() {
        let fixture = Fixture::new();
        // Matches only once the hash loader has contributed.
        fixture.rules.register_static(Rule::new(
            "hash-done",
            5,
            |cookie, _| Ok(cookie.metadata_sources().contains("hash")),
            |cookie, _| {
                Ok(RuleAction::new(
                    vec![Notification::new(
                        "hashed",
                        "hash-done",
                        serde_json::json!(cookie.identifier),
                    )],
                    true,
                ))
            },
        ));
        fixture.loaders.register_static(EnrichmentLoader::new(
            "hash",
            5,
            |cookie, _| Ok(!cookie.metadata_sources().contains("hash")),
            |_, _| Ok(enrichment("hash")),
        ));

        let pool = fixture.pool(ProcessorPoolConfig::default());
        pool.start();

        fixture
            .jar
            .enrich_cookie("/data/file", enrichment("seed"))
            .await
            .unwrap();

        let received = Arc::clone(&fixture.received);
        wait_until(move || received.lock().len() == 1).await;
        assert_eq!(fixture.received.lock()[0].about, "hashed");

        let cookie = fixture.jar.fetch_cookie("/data/file").await.unwrap().unwrap();
        let sources = cookie.metadata_sources();
        assert!(sources.contains("seed") && sources.contains("hash"));

        pool.stop().await;
    }

    #[tokio::test]
    async fn unclassifiable_cookie_emits_unknown() {
        let fixture = Fixture::new();
        let pool = fixture.pool(ProcessorPoolConfig::default());
        pool.start();

        fixture
            .jar
            .enrich_cookie("/mystery", enrichment("seed"))
            .await
            .unwrap();

        let received = Arc::clone(&fixture.received);
        wait_until(move || received.lock().len() == 1).await;
        let notification = fixture.received.lock()[0].clone();
        assert_eq!(notification.about, "unknown");
        assert_eq!(notification.data, serde_json::json!("/mystery"));

        pool.stop().await;
    }

    #[tokio::test]
    async fn failing_rule_marks_the_cookie_failed_and_retries() {
        let fixture = Fixture::new();
        let failures = Arc::new(AtomicUsize::new(0));
        {
            let failures = Arc::clone(&failures);
            fixture.rules.register_static(Rule::new(
                "flaky",
                5,
                move |_, _| {
                    if failures.fetch_add(1, Ordering::SeqCst) == 0 {
                        anyhow::bail!("first evaluation explodes");
                    }
                    Ok(false)
                },
                |_, _| Ok(RuleAction::new(Vec::new(), false)),
            ));
        }

        let pool = fixture.pool(ProcessorPoolConfig {
            workers: 2,
            retry_delay: Duration::ZERO,
        });
        pool.start();

        fixture
            .jar
            .enrich_cookie("/flaky", enrichment("seed"))
            .await
            .unwrap();

        // First pass fails, zero-delay requeue, second pass falls through to
        // the unknown classification.
        let received = Arc::clone(&fixture.received);
        wait_until(move || received.lock().len() == 1).await;
        assert_eq!(fixture.received.lock()[0].about, "unknown");
        assert!(failures.load(Ordering::SeqCst) >= 2);

        pool.stop().await;
    }

    #[tokio::test]
    async fn receiver_errors_do_not_fail_the_cookie() {
        let fixture = Fixture::new();
        fixture.receivers.register_static(NotificationReceiver::new(
            "broken",
            |_, _| anyhow::bail!("receiver down"),
        ));

        let pool = fixture.pool(ProcessorPoolConfig::default());
        pool.start();

        fixture
            .jar
            .enrich_cookie("/x", enrichment("seed"))
            .await
            .unwrap();

        // The healthy collector still gets the unknown notification and the
        // cookie completes rather than being retried forever.
        let received = Arc::clone(&fixture.received);
        wait_until(move || received.lock().len() == 1).await;
        assert_eq!(fixture.jar.queue_length().await.unwrap(), 0);

        pool.stop().await;
    }

    #[tokio::test]
    async fn stopped_pool_dispatches_nothing() {
        let fixture = Fixture::new();
        let pool = fixture.pool(ProcessorPoolConfig::default());
        pool.start();
        pool.stop().await;

        fixture
            .jar
            .enrich_cookie("/late", enrichment("seed"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(fixture.received.lock().is_empty());
        assert_eq!(fixture.jar.queue_length().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pool_reports_worker_counts() {
        let fixture = Fixture::new();
        let pool = fixture.pool(ProcessorPoolConfig {
            workers: 3,
            retry_delay: Duration::ZERO,
        });
        assert_eq!(pool.worker_count(), 3);
        assert_eq!(pool.busy_workers(), 0);
    }
}
