use thiserror::Error;

use cookiemonster_store::StoreError;

/// Failures surfaced by the retrieval machinery.
///
/// A failing `get_all_since` inside a scheduled cycle is handled by the
/// manager itself (watermark untouched, count-0 log entry); this type
/// covers the crate's fallible surface: building source adapters and
/// reading or appending the retrieval log.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("update source failure: {0}")]
    Source(String),

    #[error("retrieval log failure: {0}")]
    Log(#[from] StoreError),
}
