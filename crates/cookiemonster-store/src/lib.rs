// cookiemonster-store - Buffered, revisionable document storage
//
// A CouchDB-shaped document store abstraction: string keys, opaque revision
// tokens, bulk operations and pre-declared views. Two backends (in-memory
// and opendal filesystem) plus the write buffer that batches upserts for
// throughput while keeping per-caller durability guarantees.

mod buffered;
mod design;
mod document;
mod error;
mod lock_pool;
mod store;

pub use buffered::{BufferConfig, BufferedStore};
pub use design::{Design, DesignHandle, QueryParams, ViewKey, ViewRow};
pub use document::Document;
pub use error::StoreError;
pub use store::{AllRow, DocumentStore, FsStore, MemoryStore};
