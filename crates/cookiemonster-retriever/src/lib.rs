// cookiemonster-retriever - Watermark-driven update retrieval
//
// Periodically pulls updates newer than a monotonic watermark from an
// external source, merges same-target updates, broadcasts the result and
// durably logs every retrieval. Two source adapters are included: a
// two-query reference adapter and a filesystem scanner.

mod error;
mod fs_source;
mod log;
mod manager;
mod prepared;
mod source;

pub use error::RetrievalError;
pub use fs_source::FsUpdateSource;
pub use log::{DocumentRetrievalLog, RetrievalLog, RetrievalLogStore};
pub use manager::PeriodicRetrievalManager;
pub use prepared::{PreparedQuerySource, QueryClient};
pub use source::UpdateSource;
