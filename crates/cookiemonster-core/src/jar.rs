// CookieJar contract
//
// A cookie jar is both a repository of per-file enrichment history and a
// processing queue: new metadata implies reprocessing. Implementations live
// in the cookiemonster-jar crate; the contract lives here so plug-in
// contexts can hold a jar without a crate cycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Cookie, Enrichment};

/// Queue-change callback, invoked after the backing write is durable.
pub type QueueChangeListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Error)]
pub enum JarError {
    /// The backing store could not be reached; retrying may succeed.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backing store rejected or failed the operation.
    #[error("storage failure: {0}")]
    Storage(String),
}

/// An enrichable repository of file metadata with an intrinsic processing
/// queue.
///
/// Queue state per cookie: `dirty` (needs processing), `processing`
/// (currently dispatched) and `queue_from` (earliest dispatch time). A
/// cookie is ready iff `dirty && !processing && queue_from <= now`.
#[async_trait]
pub trait CookieJar: Send + Sync {
    /// Full enrichment history for `identifier`, chronologically ordered.
    async fn fetch_cookie(&self, identifier: &str) -> Result<Option<Cookie>, JarError>;

    /// Remove all metadata and queue records for `identifier`. Upstream data
    /// is untouched.
    async fn delete_cookie(&self, identifier: &str) -> Result<(), JarError>;

    /// Append an enrichment and return the cookie to the queue.
    async fn enrich_cookie(&self, identifier: &str, enrichment: Enrichment)
        -> Result<(), JarError>;

    /// Mark a cookie as having failed processing; it re-enters the queue
    /// after `requeue_delay`.
    async fn mark_as_failed(
        &self,
        identifier: &str,
        requeue_delay: Duration,
    ) -> Result<(), JarError>;

    /// Mark a cookie as having completed processing.
    async fn mark_as_complete(&self, identifier: &str) -> Result<(), JarError>;

    /// Return a cookie to the queue immediately, regardless of metadata
    /// changes. Intended for exceptional circumstances (admin reprocessing,
    /// downstream changes).
    async fn mark_for_processing(&self, identifier: &str) -> Result<(), JarError>;

    /// Atomically claim the ready cookie with the smallest `queue_from`.
    ///
    /// Returns the claimed cookie's full history, or `None` when no cookie
    /// is ready. Safe under concurrent callers: each ready cookie is handed
    /// out at most once.
    async fn get_next_for_processing(&self) -> Result<Option<Cookie>, JarError>;

    /// Number of cookies currently ready for processing.
    async fn queue_length(&self) -> Result<usize, JarError>;

    /// Register a queue-change listener.
    fn add_listener(&self, listener: QueueChangeListener);
}
