// Periodic retrieval manager
//
// The schedule is anchored: tick k fires at start + k*period regardless of
// how long retrievals take. Retrieval runs inline on the timer task, so at
// most one is ever in flight; a tick that fires during a long retrieval is
// coalesced away. The watermark only advances on a successful, non-empty
// cycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use cookiemonster_core::{merge_updates, Listenable, Update};

use crate::log::{RetrievalLog, RetrievalLogStore};
use crate::source::UpdateSource;

type UpdateListener = Arc<dyn Fn(&Vec<Update>) + Send + Sync>;

struct RetrievalState {
    source: Arc<dyn UpdateSource>,
    log: Arc<dyn RetrievalLogStore>,
    listeners: Listenable<Vec<Update>>,
    watermark: RwLock<DateTime<Utc>>,
}

impl RetrievalState {
    /// One complete retrieval cycle: query, merge, advance, broadcast, log.
    async fn run_once(&self) {
        let since = *self.watermark.read();
        let started_at = Utc::now();
        let query_clock = Instant::now();

        let entry = match self.source.get_all_since(since).await {
            Ok(updates) => {
                let duration = query_clock.elapsed();
                let updates = merge_updates(updates);
                debug!(
                    count = updates.len(),
                    since = %since,
                    took_ms = duration.as_millis() as u64,
                    "retrieved updates"
                );
                counter!("cookiemonster.retrieval.updates", updates.len() as u64);

                if let Some(newest) = updates.iter().map(|u| u.timestamp).max() {
                    *self.watermark.write() = newest;
                    self.listeners.notify_listeners(&updates);
                }

                RetrievalLog {
                    retrieved_since: since,
                    count: updates.len(),
                    duration,
                    started_at,
                }
            }
            Err(err) => {
                // Watermark untouched, nobody notified; the failed cycle is
                // still logged and the next tick proceeds normally.
                warn!(%err, since = %since, "update retrieval failed");
                counter!("cookiemonster.retrieval.failures", 1);
                RetrievalLog {
                    retrieved_since: since,
                    count: 0,
                    duration: query_clock.elapsed(),
                    started_at,
                }
            }
        };

        if let Err(err) = self.log.add(entry).await {
            warn!(%err, "failed to append retrieval log entry");
        }
    }
}

pub struct PeriodicRetrievalManager {
    state: Arc<RetrievalState>,
    period: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
}

impl PeriodicRetrievalManager {
    pub fn new(
        period: Duration,
        source: Arc<dyn UpdateSource>,
        log: Arc<dyn RetrievalLogStore>,
        start_from: DateTime<Utc>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            state: Arc::new(RetrievalState {
                source,
                log,
                listeners: Listenable::new(),
                watermark: RwLock::new(start_from),
            }),
            period,
            handle: Mutex::new(None),
            stop,
        }
    }

    /// Listeners receive each cycle's merged updates.
    pub fn add_listener(&self, listener: UpdateListener) {
        self.state.listeners.add_listener(listener);
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        *self.state.watermark.read()
    }

    /// Run a single retrieval cycle on the caller's task.
    pub async fn run_once(&self) {
        self.state.run_once().await;
    }

    /// Start the anchored schedule. Starting an already-running manager has
    /// no effect.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let state = Arc::clone(&self.state);
        let period = self.period;
        let mut stop_rx = self.stop.subscribe();
        *handle = Some(tokio::spawn(async move {
            let mut ticks =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticks.tick() => state.run_once().await,
                }
            }
            debug!("periodic retrieval stopped");
        }));
    }

    /// Cooperative stop: any in-flight retrieval finishes, no further ticks
    /// fire once this returns.
    pub async fn stop(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = self.stop.send(true);
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cookiemonster_core::Metadata;
    use cookiemonster_store::MemoryStore;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::log::DocumentRetrievalLog;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    /// Yields one scripted batch per call, then empties; can be told to fail.
    struct ScriptedSource {
        batches: SyncMutex<Vec<anyhow::Result<Vec<Update>>>>,
        calls: AtomicUsize,
        seen_since: SyncMutex<Vec<DateTime<Utc>>>,
    }

    impl ScriptedSource {
        fn new(batches: Vec<anyhow::Result<Vec<Update>>>) -> Self {
            Self {
                batches: SyncMutex::new(batches),
                calls: AtomicUsize::new(0),
                seen_since: SyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl UpdateSource for ScriptedSource {
        async fn get_all_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<Update>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_since.lock().push(since);
            let mut batches = self.batches.lock();
            if batches.is_empty() {
                Ok(Vec::new())
            } else {
                batches.remove(0)
            }
        }
    }

    async fn manager_with(
        source: Arc<ScriptedSource>,
    ) -> (PeriodicRetrievalManager, Arc<DocumentRetrievalLog>) {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let log = Arc::new(DocumentRetrievalLog::open(store).await.unwrap());
        (
            PeriodicRetrievalManager::new(
                Duration::from_millis(20),
                source,
                log.clone(),
                ts(0),
            ),
            log,
        )
    }

    #[tokio::test]
    async fn successful_cycle_advances_watermark_and_notifies() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![
            Update::new("/x", ts(50), Metadata::new()),
            Update::new("/y", ts(80), Metadata::new()),
        ])]));
        let (manager, log) = manager_with(source.clone()).await;

        let broadcasts = Arc::new(SyncMutex::new(Vec::new()));
        {
            let broadcasts = Arc::clone(&broadcasts);
            manager.add_listener(Arc::new(move |updates: &Vec<Update>| {
                broadcasts.lock().push(updates.clone());
            }));
        }

        manager.run_once().await;

        assert_eq!(manager.watermark(), ts(80));
        assert_eq!(broadcasts.lock().len(), 1);
        assert_eq!(broadcasts.lock()[0].len(), 2);

        let entry = log.most_recent().await.unwrap().unwrap();
        assert_eq!(entry.count, 2);
        assert_eq!(entry.retrieved_since, ts(0));
    }

    #[tokio::test]
    async fn listeners_see_merged_updates() {
        let mut meta_a = Metadata::new();
        meta_a.insert("modified_replicas".to_string(), serde_json::json!([1]));
        let mut meta_b = Metadata::new();
        meta_b.insert("modified_replicas".to_string(), serde_json::json!([2]));

        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![
            Update::new("/x", ts(50), meta_a),
            Update::new("/x", ts(60), meta_b),
        ])]));
        let (manager, log) = manager_with(source).await;

        let broadcasts = Arc::new(SyncMutex::new(Vec::new()));
        {
            let broadcasts = Arc::clone(&broadcasts);
            manager.add_listener(Arc::new(move |updates: &Vec<Update>| {
                broadcasts.lock().push(updates.clone());
            }));
        }

        manager.run_once().await;

        let seen = broadcasts.lock();
        assert_eq!(seen[0].len(), 1);
        assert_eq!(seen[0][0].timestamp, ts(60));
        assert_eq!(
            seen[0][0].metadata["modified_replicas"],
            serde_json::json!([1, 2])
        );
        drop(seen);
        assert_eq!(log.most_recent().await.unwrap().unwrap().count, 1);
    }

    #[tokio::test]
    async fn failed_cycle_logs_zero_and_keeps_watermark() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(anyhow::anyhow!("query node down")),
            Ok(vec![Update::new("/x", ts(50), Metadata::new())]),
        ]));
        let (manager, log) = manager_with(source).await;

        let notified = Arc::new(AtomicUsize::new(0));
        {
            let notified = Arc::clone(&notified);
            manager.add_listener(Arc::new(move |_: &Vec<Update>| {
                notified.fetch_add(1, Ordering::SeqCst);
            }));
        }

        manager.run_once().await;
        assert_eq!(manager.watermark(), ts(0));
        assert_eq!(notified.load(Ordering::SeqCst), 0);
        assert_eq!(log.most_recent().await.unwrap().unwrap().count, 0);

        // The next cycle proceeds normally.
        manager.run_once().await;
        assert_eq!(manager.watermark(), ts(50));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(log.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_cycle_keeps_watermark_but_still_logs() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(Vec::new())]));
        let (manager, log) = manager_with(source).await;

        manager.run_once().await;
        assert_eq!(manager.watermark(), ts(0));
        assert_eq!(log.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn next_cycle_queries_from_the_new_watermark() {
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(vec![Update::new("/x", ts(50), Metadata::new())]),
            Ok(Vec::new()),
        ]));
        let (manager, _) = manager_with(source.clone()).await;

        manager.run_once().await;
        manager.run_once().await;

        let seen = source.seen_since.lock();
        assert_eq!(*seen, vec![ts(0), ts(50)]);
    }

    #[tokio::test]
    async fn periodic_schedule_runs_and_stops() {
        let source = Arc::new(ScriptedSource::new(vec![]));
        let (manager, log) = manager_with(source.clone()).await;

        manager.start();
        manager.start(); // idempotent
        tokio::time::sleep(Duration::from_millis(70)).await;
        manager.stop().await;

        let calls_at_stop = source.calls.load(Ordering::SeqCst);
        assert!(calls_at_stop >= 2, "expected at least two ticks");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), calls_at_stop);
        assert_eq!(log.count().await.unwrap(), calls_at_stop);
    }
}
