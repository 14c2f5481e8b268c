// Buffered writes
//
// Upserts and deletions are staged in a buffer and discharged to an upsert
// queue when the buffer fills or goes quiet, then batch-written with a bulk
// revision prefetch. Callers block until their write is durable: the
// per-document lock is held from append until the batcher acknowledges the
// batch, so a caller returning from `upsert` has observed durability.
//
// Batch lifecycle: staged -> locked -> prefetched -> written | requeued.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::design::{DesignHandle, QueryParams, ViewRow};
use crate::document::Document;
use crate::error::StoreError;
use crate::lock_pool::LockPool;
use crate::store::DocumentStore;

#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Discharge when this many writes are staged.
    pub max_size: usize,
    /// Discharge when this long has passed since the last append.
    pub latency: Duration,
    /// Write attempts per batch before the callers see `Unavailable`.
    pub max_attempts: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            latency: Duration::from_millis(50),
            max_attempts: 8,
        }
    }
}

enum PendingOp {
    Upsert(Document),
    Delete(String),
}

impl PendingOp {
    fn key(&self) -> &str {
        match self {
            PendingOp::Upsert(doc) => &doc.id,
            PendingOp::Delete(key) => key,
        }
    }
}

struct PendingWrite {
    op: PendingOp,
    ack: oneshot::Sender<Result<(), StoreError>>,
}

struct Batch {
    writes: Vec<PendingWrite>,
    attempts: u32,
}

struct BufferState {
    writes: Vec<PendingWrite>,
    last_append: Instant,
}

struct Inner {
    store: Arc<dyn DocumentStore>,
    config: BufferConfig,
    buffer: Mutex<BufferState>,
    queue: Mutex<VecDeque<Batch>>,
    in_flight: AtomicUsize,
    kick: Notify,
    locks: LockPool,
}

/// A write-buffering layer over a `DocumentStore`.
pub struct BufferedStore {
    inner: Arc<Inner>,
    tasks: Vec<JoinHandle<()>>,
}

impl BufferedStore {
    pub fn new(store: Arc<dyn DocumentStore>, config: BufferConfig) -> Self {
        let inner = Arc::new(Inner {
            store,
            config: config.clone(),
            buffer: Mutex::new(BufferState {
                writes: Vec::new(),
                last_append: Instant::now(),
            }),
            queue: Mutex::new(VecDeque::new()),
            in_flight: AtomicUsize::new(0),
            kick: Notify::new(),
            locks: LockPool::new(),
        });

        let writer = tokio::spawn(writer_loop(Arc::clone(&inner)));
        let watcher = tokio::spawn(latency_watcher(Arc::clone(&inner)));

        Self {
            inner,
            tasks: vec![writer, watcher],
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    /// Point read; with a revision, searches the retained history.
    pub async fn fetch(
        &self,
        key: &str,
        revision: Option<&str>,
    ) -> Result<Option<Document>, StoreError> {
        match revision {
            None => self.inner.store.get(key).await,
            Some(revision) => {
                let revisions = self.inner.store.revisions(key).await?;
                Ok(revisions
                    .into_iter()
                    .find(|doc| doc.rev.as_deref() == Some(revision)))
            }
        }
    }

    /// Enqueue an insert-or-update and wait for it to become durable.
    ///
    /// Without a key a fresh one is generated. Any `_id`/`_rev` members in
    /// the data are discarded; revisions are managed by the batcher.
    pub async fn upsert(
        &self,
        mut data: Map<String, Value>,
        key: Option<String>,
    ) -> Result<(), StoreError> {
        data.remove("_id");
        data.remove("_rev");
        let doc = match key {
            Some(key) => Document::new(key, data),
            None => Document::with_generated_id(data),
        };
        if doc.id.starts_with('_') {
            return Err(StoreError::InvalidKey(doc.id));
        }
        self.submit(PendingOp::Upsert(doc)).await
    }

    /// Enqueue a deletion of the current revision and wait for durability.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if key.starts_with('_') {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        self.submit(PendingOp::Delete(key.to_string())).await
    }

    async fn submit(&self, op: PendingOp) -> Result<(), StoreError> {
        let guard = self.inner.locks.acquire(op.key()).await;
        let (ack, done) = oneshot::channel();

        let discharge_now = {
            let mut buffer = self.inner.buffer.lock();
            buffer.writes.push(PendingWrite { op, ack });
            buffer.last_append = Instant::now();
            buffer.writes.len() >= self.inner.config.max_size
        };
        if discharge_now {
            discharge(&self.inner);
        }

        let result = done
            .await
            .unwrap_or_else(|_| Err(StoreError::Unavailable("batcher stopped".to_string())));
        drop(guard);
        result
    }

    pub async fn query(
        &self,
        design: &str,
        view: &str,
        params: QueryParams,
    ) -> Result<Vec<ViewRow>, StoreError> {
        self.inner.store.query(design, view, params).await
    }

    pub fn create_design(&self, name: &str) -> DesignHandle {
        self.inner.store.create_design(name)
    }

    pub fn get_design(&self, name: &str) -> Option<DesignHandle> {
        self.inner.store.get_design(name)
    }

    pub async fn commit_designs(&self) -> Result<(), StoreError> {
        self.inner.store.commit_designs().await
    }

    /// Discharge whatever is staged and wait until every queued batch has
    /// been written (or failed definitively).
    pub async fn flush(&self) {
        discharge(&self.inner);
        loop {
            let drained = self.inner.queue.lock().is_empty()
                && self.inner.in_flight.load(Ordering::SeqCst) == 0
                && self.inner.buffer.lock().writes.is_empty();
            if drained {
                return;
            }
            self.inner.kick.notify_one();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for BufferedStore {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Move the staged writes onto the upsert queue.
fn discharge(inner: &Arc<Inner>) {
    let writes = {
        let mut buffer = inner.buffer.lock();
        if buffer.writes.is_empty() {
            return;
        }
        std::mem::take(&mut buffer.writes)
    };
    trace!(count = writes.len(), "buffer discharged");
    inner.queue.lock().push_back(Batch { writes, attempts: 0 });
    inner.kick.notify_one();
}

/// Enforce the latency bound at half-latency period.
async fn latency_watcher(inner: Arc<Inner>) {
    let period = (inner.config.latency / 2).max(Duration::from_millis(1));
    loop {
        tokio::time::sleep(period).await;
        let due = {
            let buffer = inner.buffer.lock();
            !buffer.writes.is_empty() && buffer.last_append.elapsed() >= inner.config.latency
        };
        if due {
            discharge(&inner);
        }
    }
}

async fn writer_loop(inner: Arc<Inner>) {
    loop {
        inner.kick.notified().await;
        loop {
            let batch = inner.queue.lock().pop_front();
            let batch = match batch {
                Some(batch) => batch,
                None => break,
            };
            inner.in_flight.fetch_add(1, Ordering::SeqCst);
            let backoff = write_batch(&inner, batch).await;
            inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Some(delay) = backoff {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Attempt one batch. Returns a backoff to apply before the next attempt
/// when the batch was requeued on transient failure.
async fn write_batch(inner: &Arc<Inner>, batch: Batch) -> Option<Duration> {
    // Split out writes for keys already present in this batch: they are
    // requeued for a subsequent batch rather than re-appended to the buffer,
    // which would deadlock. Keeping the earliest write here preserves write
    // order, so the chronologically last write is the one that finally
    // sticks.
    let mut seen: HashSet<String> = HashSet::new();
    let mut primary: Vec<PendingWrite> = Vec::new();
    let mut duplicates: Vec<PendingWrite> = Vec::new();
    for write in batch.writes {
        if seen.insert(write.op.key().to_string()) {
            primary.push(write);
        } else {
            duplicates.push(write);
        }
    }
    if !duplicates.is_empty() {
        debug!(count = duplicates.len(), "requeueing duplicate-key writes");
        inner.queue.lock().push_front(Batch {
            writes: duplicates,
            attempts: 0,
        });
    }

    // Bulk revision prefetch immediately before the write, so conflicts are
    // normally avoided on the first attempt.
    let keys: Vec<String> = primary.iter().map(|w| w.op.key().to_string()).collect();
    let revs: HashMap<String, String> = match inner.store.all(&keys, false).await {
        Ok(rows) => rows
            .into_iter()
            .filter_map(|row| row.rev.map(|rev| (row.id, rev)))
            .collect(),
        Err(err) => return requeue(inner, primary, batch.attempts, err),
    };

    let mut upserts = Vec::new();
    let mut deletions = Vec::new();
    for write in &primary {
        match &write.op {
            PendingOp::Upsert(doc) => {
                let mut doc = doc.clone();
                doc.rev = revs.get(&doc.id).cloned();
                upserts.push(doc);
            }
            PendingOp::Delete(key) => deletions.push(key.clone()),
        }
    }

    if let Err(err) = inner.store.save_bulk(upserts, true).await {
        return requeue(inner, primary, batch.attempts, err);
    }
    if let Err(err) = inner.store.delete_bulk(&deletions).await {
        return requeue(inner, primary, batch.attempts, err);
    }

    trace!(count = primary.len(), "batch written");
    for write in primary {
        let _ = write.ack.send(Ok(()));
    }
    None
}

fn requeue(
    inner: &Arc<Inner>,
    writes: Vec<PendingWrite>,
    attempts: u32,
    err: StoreError,
) -> Option<Duration> {
    let attempts = attempts + 1;
    if attempts >= inner.config.max_attempts {
        warn!(%err, attempts, "dropping batch after exhausting write attempts");
        for write in writes {
            let _ = write
                .ack
                .send(Err(StoreError::Unavailable(format!(
                    "write attempts exhausted: {err}"
                ))));
        }
        return None;
    }

    let backoff = match &err {
        // Conflicts are retried immediately: the next prefetch picks up the
        // winning revision.
        StoreError::Conflict(_) => {
            debug!(%err, attempts, "requeueing batch after revision conflict");
            None
        }
        _ => {
            warn!(%err, attempts, "store unavailable, requeueing batch");
            Some(
                Duration::from_millis(10u64.saturating_mul(1u64 << attempts.min(10)))
                    .min(Duration::from_secs(1)),
            )
        }
    };

    inner.queue.lock().push_front(Batch { writes, attempts });
    inner.kick.notify_one();
    backoff
}
